//! Crash analysis for isolate subprocesses.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why an isolate process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from OOM killer).
    OutOfMemory,
    /// Stack overflow (SIGSEGV on Linux).
    StackOverflow,
    /// Stack overflow (SIGBUS on macOS).
    StackOverflowMacOS,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL from OOM killer)".to_string(),
            Self::StackOverflow => "stack overflow (SIGSEGV)".to_string(),
            Self::StackOverflowMacOS => "stack overflow (SIGBUS)".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        // SIGKILL (9) - likely OOM killer
        Some(Ok(Signal::SIGKILL)) => TerminationReason::OutOfMemory,
        // SIGSEGV (11) - stack overflow on Linux
        Some(Ok(Signal::SIGSEGV)) => TerminationReason::StackOverflow,
        // SIGBUS (10) - stack overflow on macOS
        Some(Ok(Signal::SIGBUS)) => TerminationReason::StackOverflowMacOS,
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_exit_code() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(0));
        assert!(analyze_exit_status(status).is_success());

        // wait(2) encodes the exit code in the second byte
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(3));
    }

    #[test]
    fn test_analyze_signals() {
        assert_eq!(
            analyze_exit_status(ExitStatus::from_raw(Signal::SIGKILL as i32)),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_exit_status(ExitStatus::from_raw(Signal::SIGSEGV as i32)),
            TerminationReason::StackOverflow
        );
        assert_eq!(
            analyze_exit_status(ExitStatus::from_raw(Signal::SIGTERM as i32)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_description() {
        assert!(TerminationReason::Exited(2).to_string().contains("code 2"));
        assert!(
            TerminationReason::Signaled(Signal::SIGABRT)
                .to_string()
                .contains("SIGABRT")
        );
    }
}
