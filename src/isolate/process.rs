//! Isolate subprocess spawning and supervision.
//!
//! The isolate is the current executable re-run in hidden `worker` mode. Each
//! isolate gets three tasks: a writer serializing commands to its stdin, a
//! reader parsing events from its stdout, and a supervisor that owns the
//! child, kills it on request, and reports unexpected deaths.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::protocol::{HostMessage, IsolateMessage};
use super::signals::analyze_exit_status;
use super::{IsolateHandle, IsolateLauncher};
use crate::error::CoordinatorError;
use crate::image::CompilerImage;

/// Launches isolates as `scadbox worker` subprocesses.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Re-run the current executable as the isolate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `program` instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    fn worker_program(&self) -> Result<PathBuf, CoordinatorError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                CoordinatorError::Launch(format!("Failed to get current executable: {}", e))
            }),
        }
    }
}

impl IsolateLauncher for ProcessLauncher {
    fn launch(&self, image: &Arc<dyn CompilerImage>) -> Result<IsolateHandle, CoordinatorError> {
        let info = image.info();
        let image_path = info.path.ok_or_else(|| {
            CoordinatorError::Launch("Compiler image has no path a subprocess can open".to_string())
        })?;
        let program = self.worker_program()?;

        let mut cmd = Command::new(&program);
        cmd.arg("worker")
            .arg("--image")
            .arg(&image_path)
            .arg("--digest")
            .arg(&info.digest);
        if let Some(dir) = &info.font_dir {
            cmd.arg("--font-dir").arg(dir);
        }

        // Own process group so a kill also reaches the running compiler
        cmd.process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Isolate logs go to parent's stderr
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CoordinatorError::Launch(format!("Failed to spawn isolate: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoordinatorError::Launch("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordinatorError::Launch("Child stdout not captured".into()))?;

        tracing::debug!(
            pid = child.id(),
            program = %program.display(),
            image = %image_path.display(),
            "Spawned isolate"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_commands(stdin, command_rx));
        let reader = tokio::spawn(read_events(stdout, event_tx.clone()));
        tokio::spawn(supervise(child, kill_rx, reader, event_tx));

        Ok(IsolateHandle::new(command_tx, event_rx).with_kill(kill_tx))
    }
}

/// Forward commands to the isolate's stdin until either side closes.
async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<HostMessage>) {
    while let Some(message) = commands.recv().await {
        let line = message.to_line();
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "Isolate stdin closed");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    // Dropping stdin closes the pipe; the isolate sees EOF
}

/// Parse events from the isolate's stdout until EOF.
async fn read_events(stdout: ChildStdout, events: mpsc::UnboundedSender<IsolateMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match IsolateMessage::from_line(&line) {
                    Ok(message) => {
                        if events.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Invalid isolate message"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from isolate");
                break;
            }
        }
    }
}

/// Own the child until it exits. Unexpected deaths are reported as an
/// `error` event after every event the isolate managed to write.
async fn supervise(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<IsolateMessage>,
) {
    let pid = child.id();
    let mut killed = false;

    let status = tokio::select! {
        status = child.wait() => status,
        signal = &mut kill => {
            // A dropped kill switch means a graceful close: keep waiting
            if signal.is_ok() {
                killed = true;
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.start_kill();
            }
            child.wait().await
        }
    };

    let _ = reader.await;

    match status {
        Ok(status) => {
            let reason = analyze_exit_status(status);
            if killed {
                tracing::debug!(pid, reason = %reason, "Isolate killed");
            } else if reason.is_success() {
                tracing::debug!(pid, "Isolate exited");
            } else {
                tracing::warn!(pid, reason = %reason, "Isolate died unexpectedly");
                let _ = events.send(IsolateMessage::error(format!("Isolate {}", reason)));
            }
        }
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to wait for isolate");
            let _ = events.send(IsolateMessage::error(format!(
                "Failed to wait for isolate: {}",
                e
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedImage;

    #[test]
    fn test_scripted_image_cannot_cross_process_boundary() {
        let image: Arc<dyn CompilerImage> = Arc::new(ScriptedImage::new());
        let err = ProcessLauncher::new().launch(&image).err().unwrap();
        assert!(matches!(err, CoordinatorError::Launch(_)));
    }

    #[test]
    fn test_worker_program_override() {
        let launcher = ProcessLauncher::new().with_program("/opt/scadbox");
        assert_eq!(
            launcher.worker_program().unwrap(),
            PathBuf::from("/opt/scadbox")
        );
        assert!(ProcessLauncher::new().worker_program().is_ok());
    }
}
