//! Coordinator configuration.
//!
//! # Environment Variables
//!
//! - `SCADBOX_COMPILE_TIMEOUT_SECS` - Per-request deadline, `0` disables the watchdog
//! - `SCADBOX_READY_TIMEOUT_SECS` - How long to wait for an isolate handshake
//! - `SCADBOX_FORMAT` - Default output format: binary, ascii

use std::time::Duration;

use crate::decoder::OutputFormat;

/// Default per-request compile deadline.
pub const DEFAULT_COMPILE_DEADLINE: Duration = Duration::from_secs(120);

/// Default isolate startup deadline.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Format used by `compile()`.
    pub default_format: OutputFormat,
    /// Watchdog deadline per accepted request; `None` disables the watchdog.
    pub compile_deadline: Option<Duration>,
    pub ready_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_format: OutputFormat::MeshBinary,
            compile_deadline: Some(DEFAULT_COMPILE_DEADLINE),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_format(mut self, format: OutputFormat) -> Self {
        self.default_format = format;
        self
    }

    pub fn with_compile_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.compile_deadline = deadline;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Apply environment variable overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(secs) = std::env::var("SCADBOX_COMPILE_TIMEOUT_SECS")
            && let Ok(secs) = secs.trim().parse::<u64>()
        {
            self.compile_deadline = deadline_from_secs(secs);
        }

        if let Ok(secs) = std::env::var("SCADBOX_READY_TIMEOUT_SECS")
            && let Ok(secs) = secs.trim().parse::<u64>()
            && secs > 0
        {
            self.ready_timeout = Duration::from_secs(secs);
        }

        if let Ok(format) = std::env::var("SCADBOX_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.default_format = format;
        }

        self
    }
}

/// Deadline for a timeout given in seconds, `0` meaning none.
pub fn deadline_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.default_format, OutputFormat::MeshBinary);
        assert_eq!(config.compile_deadline, Some(Duration::from_secs(120)));
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_disables_deadline() {
        assert_eq!(deadline_from_secs(0), None);
        assert_eq!(deadline_from_secs(5), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_builder() {
        let config = CoordinatorConfig::new()
            .with_default_format(OutputFormat::MeshAscii)
            .with_compile_deadline(None)
            .with_ready_timeout(Duration::from_secs(2));
        assert_eq!(config.default_format, OutputFormat::MeshAscii);
        assert_eq!(config.compile_deadline, None);
        assert_eq!(config.ready_timeout, Duration::from_secs(2));
    }
}
