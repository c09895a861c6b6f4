//! In-process isolate on a dedicated OS thread.

use std::io;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc;

use super::protocol::{HostMessage, IsolateMessage};
use super::worker::{self, CommandSource, EventSink};
use super::{IsolateHandle, IsolateLauncher};
use crate::error::CoordinatorError;
use crate::image::CompilerImage;

/// Runs the isolate loop on a named thread connected by channels.
///
/// A thread cannot be killed: teardown drops the channels and the thread
/// exits once its current invocation returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl ThreadLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl IsolateLauncher for ThreadLauncher {
    fn launch(&self, image: &Arc<dyn CompilerImage>) -> Result<IsolateHandle, CoordinatorError> {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let image = Arc::clone(image);

        std::thread::Builder::new()
            .name("scadbox-isolate".to_string())
            .spawn(move || {
                let mut commands = ChannelCommands(command_rx);
                let events: Arc<dyn EventSink> = Arc::new(ChannelEvents(event_tx));
                if let Err(e) = worker::serve(Ok(image), &mut commands, events) {
                    tracing::debug!(error = %e, "Isolate thread detached");
                }
            })
            .map_err(|e| CoordinatorError::Launch(format!("Failed to spawn isolate thread: {}", e)))?;

        Ok(IsolateHandle::new(command_tx, event_rx))
    }
}

struct ChannelCommands(std_mpsc::Receiver<HostMessage>);

impl CommandSource for ChannelCommands {
    fn recv(&mut self) -> io::Result<Option<HostMessage>> {
        // A closed channel reads as EOF
        Ok(self.0.recv().ok())
    }
}

struct ChannelEvents(mpsc::UnboundedSender<IsolateMessage>);

impl EventSink for ChannelEvents {
    fn send(&self, message: &IsolateMessage) -> io::Result<()> {
        self.0
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host side closed"))
    }
}
