//! Entry point backed by a native compiler executable.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use super::{EntryPoint, OutputSink, SandboxEnv, StreamKind};

/// Exit code reported when the compiler could not be started.
const SPAWN_FAILED: i32 = 127;

/// Runs the compiler program as a child process rooted in the sandbox.
#[derive(Debug)]
pub struct NativeEntry {
    program: PathBuf,
}

impl NativeEntry {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl EntryPoint for NativeEntry {
    fn call_main(self: Box<Self>, env: &SandboxEnv, args: &[String], sink: &dyn OutputSink) -> i32 {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&env.root)
            .env_clear()
            .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                sink.emit(
                    StreamKind::Error,
                    &format!("ERROR: failed to start compiler: {}", e),
                );
                return SPAWN_FAILED;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Each stream keeps its own emission order.
        std::thread::scope(|s| {
            if let Some(out) = stdout {
                s.spawn(move || forward_lines(out, StreamKind::Info, sink));
            }
            if let Some(err) = stderr {
                s.spawn(move || forward_lines(err, StreamKind::Error, sink));
            }
        });

        match child.wait() {
            Ok(status) => exit_code(status),
            Err(e) => {
                sink.emit(
                    StreamKind::Error,
                    &format!("ERROR: failed to wait for compiler: {}", e),
                );
                SPAWN_FAILED
            }
        }
    }
}

/// Forward each line of `reader` to `sink`. Invalid UTF-8 is replaced.
fn forward_lines<R: Read>(reader: R, stream: StreamKind, sink: &dyn OutputSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.emit(stream, line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                tracing::debug!(%stream, error = %e, "Compiler stream read failed");
                break;
            }
        }
    }
}

/// Map an exit status to a shell-style code (128 + signal when killed).
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
