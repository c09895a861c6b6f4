//! Isolate side of the boundary.
//!
//! [`serve`] reports startup once (`ready` or `error`), then handles compile
//! requests one at a time. Each request gets a freshly provisioned sandbox;
//! its output lines are streamed as they are emitted and followed by exactly
//! one terminal `result`. A request whose sandbox cannot be provisioned gets
//! a `provision` failure and the loop moves on to the next request.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::protocol::{FailureKind, HostMessage, IsolateMessage};
use crate::decoder::OutputFormat;
use crate::error::LoadError;
use crate::image::{CompilerImage, ImageSource, NativeImageSource};
use crate::sandbox::{self, OutputSink, StreamKind};

/// Where the isolate reads requests from.
pub trait CommandSource {
    /// Next request, or `None` when the host has gone away.
    fn recv(&mut self) -> io::Result<Option<HostMessage>>;
}

/// Where the isolate writes events to. Shared with output sinks.
pub trait EventSink: Send + Sync {
    fn send(&self, message: &IsolateMessage) -> io::Result<()>;
}

/// Run the isolate loop until `exit`, EOF, or a broken event channel.
pub fn serve(
    image: Result<Arc<dyn CompilerImage>, LoadError>,
    commands: &mut dyn CommandSource,
    events: Arc<dyn EventSink>,
) -> io::Result<()> {
    let image = match image {
        Ok(image) => {
            events.send(&IsolateMessage::Ready)?;
            image
        }
        Err(e) => {
            events.send(&IsolateMessage::error(e.to_string()))?;
            return Ok(());
        }
    };

    while let Some(request) = commands.recv()? {
        match request {
            HostMessage::Exit => return Ok(()),
            HostMessage::Compile { id, source, format } => {
                events.send(&IsolateMessage::Started { id })?;
                let result = run_request(image.as_ref(), id, &source, format, &events);
                events.send(&result)?;
            }
        }
    }

    // EOF - host closed the pipe
    Ok(())
}

/// Provision, invoke, and summarize one request.
fn run_request(
    image: &dyn CompilerImage,
    id: u64,
    source: &str,
    format: OutputFormat,
    events: &Arc<dyn EventSink>,
) -> IsolateMessage {
    let started = Instant::now();
    let sink = request_sink(id, Arc::clone(events));

    let instance = match sandbox::provision(image, sink) {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!(id, error = %e, "Sandbox provisioning failed");
            return IsolateMessage::failed(id, FailureKind::Provision, e.to_string(), millis(started));
        }
    };

    match instance.invoke(source, format) {
        Ok(invocation) if invocation.succeeded() => {
            IsolateMessage::completed(id, invocation.output, millis(started))
        }
        Ok(invocation) => IsolateMessage::failed(
            id,
            FailureKind::Compile,
            format!("compiler exited with status {}", invocation.exit_code),
            millis(started),
        ),
        Err(e) => IsolateMessage::failed(id, FailureKind::Provision, e.to_string(), millis(started)),
    }
}

/// Sink that tags every line with the request id.
fn request_sink(id: u64, events: Arc<dyn EventSink>) -> Arc<dyn OutputSink> {
    Arc::new(move |channel: StreamKind, text: &str| {
        if let Err(e) = events.send(&IsolateMessage::stream(id, channel, text)) {
            tracing::debug!(id, error = %e, "Dropping output line");
        }
    })
}

fn millis(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Requests read as JSON lines. Blank and malformed lines are skipped.
pub struct LineCommands<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> LineCommands<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::with_capacity(4096),
        }
    }
}

impl<R: BufRead> CommandSource for LineCommands<R> {
    fn recv(&mut self) -> io::Result<Option<HostMessage>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            match HostMessage::from_line(line) {
                Ok(request) => return Ok(Some(request)),
                // Invalid request - log and keep serving
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid request"),
            }
        }
    }
}

/// Events written as JSON lines, flushed one message at a time.
pub struct LineEvents<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LineEvents<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for LineEvents<W> {
    fn send(&self, message: &IsolateMessage) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("event writer poisoned"))?;
        writer.write_all(message.to_line().as_bytes())?;
        writer.flush()
    }
}

/// Arguments of the isolate subprocess.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub image: PathBuf,
    pub digest: Option<String>,
    pub font_dir: Option<PathBuf>,
}

/// Run the isolate subprocess main function on stdin/stdout.
///
/// Never returns: exits 0 on a clean shutdown, 1 on an I/O failure.
pub fn run_worker_main(args: &WorkerArgs) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let mut commands = LineCommands::new(io::stdin().lock());
    let events: Arc<dyn EventSink> = Arc::new(LineEvents::new(io::stdout()));

    let mut source = NativeImageSource::new(&args.image);
    if let Some(digest) = &args.digest {
        source = source.with_expected_digest(digest);
    }
    if let Some(dir) = &args.font_dir {
        source = source.with_font_dir(dir);
    }

    match serve(source.fetch(), &mut commands, events) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "Isolate I/O failure");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedImage;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<HostMessage>);

    impl CommandSource for Scripted {
        fn recv(&mut self) -> io::Result<Option<HostMessage>> {
            Ok(self.0.pop_front())
        }
    }

    #[derive(Default)]
    struct Recorded(Mutex<Vec<IsolateMessage>>);

    impl EventSink for Recorded {
        fn send(&self, message: &IsolateMessage) -> io::Result<()> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn run(image: Result<Arc<dyn CompilerImage>, LoadError>, requests: Vec<HostMessage>) -> Vec<IsolateMessage> {
        let events = Arc::new(Recorded::default());
        let mut commands = Scripted(requests.into());
        serve(image, &mut commands, events.clone()).unwrap();
        let recorded = events.0.lock().unwrap().clone();
        recorded
    }

    #[test]
    fn test_ready_then_streams_then_result() {
        let image: Arc<dyn CompilerImage> = Arc::new(ScriptedImage::new());
        let events = run(
            Ok(image),
            vec![HostMessage::compile(
                1,
                "info: first\nerror: WARNING: second\ninfo: third",
                OutputFormat::MeshBinary,
            )],
        );

        assert_eq!(events[0], IsolateMessage::Ready);
        assert_eq!(events[1], IsolateMessage::Started { id: 1 });
        assert_eq!(events[2], IsolateMessage::stream(1, StreamKind::Info, "first"));
        assert_eq!(
            events[3],
            IsolateMessage::stream(1, StreamKind::Error, "WARNING: second")
        );
        assert_eq!(events[4], IsolateMessage::stream(1, StreamKind::Info, "third"));
        match &events[5] {
            IsolateMessage::Result {
                id, success, output, ..
            } => {
                assert_eq!(*id, 1);
                assert!(*success);
                assert!(output.is_some());
            }
            other => panic!("Expected Result, got {:?}", other),
        }
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn test_load_failure_reports_error() {
        let events = run(
            Err(LoadError::NotFound(PathBuf::from("/opt/openscad"))),
            vec![HostMessage::compile(1, "cube(1);", OutputFormat::MeshBinary)],
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], IsolateMessage::Error { error } if error.contains("/opt/openscad")));
    }

    #[test]
    fn test_compile_failure_result() {
        let image: Arc<dyn CompilerImage> = Arc::new(ScriptedImage::new());
        let events = run(
            Ok(image),
            vec![HostMessage::compile(2, "syntax-error", OutputFormat::MeshBinary)],
        );
        match events.last().unwrap() {
            IsolateMessage::Result {
                success,
                failure,
                output,
                error,
                ..
            } => {
                assert!(!*success);
                assert_eq!(*failure, Some(FailureKind::Compile));
                assert!(output.is_none());
                assert!(error.as_deref().unwrap().contains("status 1"));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_provision_failure_does_not_stop_loop() {
        let image: Arc<dyn CompilerImage> = Arc::new(ScriptedImage::new().fail_instantiations(1));
        let events = run(
            Ok(image),
            vec![
                HostMessage::compile(1, "cube(1);", OutputFormat::MeshBinary),
                HostMessage::compile(2, "cube(2);", OutputFormat::MeshBinary),
            ],
        );

        let results: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                IsolateMessage::Result {
                    id, success, failure, ..
                } => Some((*id, *success, *failure)),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![(1, false, Some(FailureKind::Provision)), (2, true, None)]
        );
    }

    #[test]
    fn test_each_request_gets_fresh_instance() {
        let image = Arc::new(ScriptedImage::new());
        let shared: Arc<dyn CompilerImage> = image.clone();
        run(
            Ok(shared),
            vec![
                HostMessage::compile(1, "cube(1);", OutputFormat::MeshBinary),
                HostMessage::compile(2, "cube(2);", OutputFormat::MeshAscii),
                HostMessage::Exit,
                HostMessage::compile(3, "never", OutputFormat::MeshBinary),
            ],
        );
        assert_eq!(image.instantiations(), 2);
        assert_eq!(image.invocations(), 2);
    }

    /// Writer whose bytes stay readable after the sink is dropped.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_commands_skip_blank_and_invalid_lines() {
        let input = format!(
            "\n{{\"type\":\"bogus\"}}\nnot json\r\n{}\r\n{}",
            HostMessage::compile(4, "cube(1);", OutputFormat::MeshAscii).to_line().trim_end(),
            HostMessage::Exit.to_line()
        );
        let mut commands = LineCommands::new(io::Cursor::new(input));

        assert_eq!(
            commands.recv().unwrap(),
            Some(HostMessage::compile(4, "cube(1);", OutputFormat::MeshAscii))
        );
        assert_eq!(commands.recv().unwrap(), Some(HostMessage::Exit));
        assert_eq!(commands.recv().unwrap(), None);
    }

    #[test]
    fn test_serve_over_json_lines() {
        let image: Arc<dyn CompilerImage> = Arc::new(ScriptedImage::new());
        let input = [
            HostMessage::compile(3, "info: hi", OutputFormat::MeshBinary).to_line(),
            HostMessage::Exit.to_line(),
        ]
        .concat();
        let output = SharedBuf::default();

        let mut commands = LineCommands::new(io::Cursor::new(input));
        serve(Ok(image), &mut commands, Arc::new(LineEvents::new(output.clone()))).unwrap();

        let written = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
        let messages: Vec<_> = written
            .lines()
            .map(|line| IsolateMessage::from_line(line).unwrap())
            .collect();
        assert_eq!(messages[0], IsolateMessage::Ready);
        assert_eq!(messages[1], IsolateMessage::Started { id: 3 });
        assert_eq!(messages[2], IsolateMessage::stream(3, StreamKind::Info, "hi"));
        assert!(matches!(messages[3], IsolateMessage::Result { id: 3, success: true, .. }));
        assert_eq!(messages.len(), 4);
    }
}
