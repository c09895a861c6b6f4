//! Isolation boundary between the coordinator and compiler work.
//!
//! The host and the isolate share nothing but two ordered message channels.
//! Compiler work runs on the isolate side, so a slow or crashing compile can
//! neither block nor take down the host.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐   HostMessage    ┌──────────────────────┐
//!   │   Coordinator    │ ───────────────▶ │       Isolate        │
//!   │ (pump, watchdog) │                  │ serve(): provision → │
//!   │                  │ ◀─────────────── │ invoke → result      │
//!   └──────────────────┘  IsolateMessage  └──────────────────────┘
//! ```
//!
//! Two launchers provide the isolate side:
//!
//! - [`ProcessLauncher`]: a `scadbox worker` subprocess speaking JSON lines
//!   over stdin/stdout. It can be killed.
//! - [`ThreadLauncher`]: [`worker::serve`] on a named OS thread. Teardown
//!   only detaches it.

mod process;
pub mod protocol;
pub mod signals;
mod thread;
pub mod worker;

pub use process::ProcessLauncher;
pub use thread::ThreadLauncher;
pub use worker::{WorkerArgs, run_worker_main};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::CoordinatorError;
use crate::image::CompilerImage;
use protocol::{HostMessage, IsolateMessage};

/// Event half of a boundary, in isolate emission order.
pub type EventReceiver = mpsc::UnboundedReceiver<IsolateMessage>;

/// Starts isolates for a loaded image.
pub trait IsolateLauncher: Send + Sync {
    /// Start one isolate. Must be called from within a tokio runtime.
    fn launch(&self, image: &Arc<dyn CompilerImage>) -> Result<IsolateHandle, CoordinatorError>;
}

/// Command half of a boundary.
pub trait CommandSink: Send + Sync {
    /// Queue `message`. Returns `false` once the isolate side is gone.
    fn send(&self, message: HostMessage) -> bool;
}

impl CommandSink for std::sync::mpsc::Sender<HostMessage> {
    fn send(&self, message: HostMessage) -> bool {
        std::sync::mpsc::Sender::send(self, message).is_ok()
    }
}

impl CommandSink for mpsc::UnboundedSender<HostMessage> {
    fn send(&self, message: HostMessage) -> bool {
        mpsc::UnboundedSender::send(self, message).is_ok()
    }
}

/// A freshly launched isolate, not yet known to be ready.
pub struct IsolateHandle {
    boundary: Boundary,
    events: EventReceiver,
}

impl IsolateHandle {
    pub fn new(commands: impl CommandSink + 'static, events: EventReceiver) -> Self {
        Self {
            boundary: Boundary {
                commands: Box::new(commands),
                kill: None,
            },
            events,
        }
    }

    /// Attach a kill switch fired by [`Boundary::kill`].
    pub fn with_kill(mut self, kill: oneshot::Sender<()>) -> Self {
        self.boundary.kill = Some(kill);
        self
    }

    /// Wait for the startup handshake.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), CoordinatorError> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(IsolateMessage::Ready)) => Ok(()),
            Ok(Some(IsolateMessage::Error { error })) => Err(CoordinatorError::Launch(error)),
            Ok(Some(other)) => Err(CoordinatorError::Launch(format!(
                "Isolate sent unexpected message instead of ready: {:?}",
                other
            ))),
            Ok(None) => Err(CoordinatorError::Launch(
                "Isolate closed connection before ready".to_string(),
            )),
            Err(_) => Err(CoordinatorError::Launch(format!(
                "Isolate not ready after {}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    pub fn into_parts(self) -> (Boundary, EventReceiver) {
        (self.boundary, self.events)
    }
}

/// The host's grip on a running isolate.
pub struct Boundary {
    commands: Box<dyn CommandSink>,
    kill: Option<oneshot::Sender<()>>,
}

impl Boundary {
    pub fn send(&self, message: HostMessage) -> bool {
        self.commands.send(message)
    }

    /// Ask the isolate to exit after its current request.
    pub fn close(self) {
        self.commands.send(HostMessage::Exit);
    }

    /// Stop the isolate now, abandoning any running request.
    pub fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary")
            .field("killable", &self.kill.is_some())
            .finish()
    }
}
