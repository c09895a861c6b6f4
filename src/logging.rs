//! Logging setup for the host and the isolate subprocess.
//!
//! Everything goes to stderr; the isolate's stdout is the protocol channel.
//!
//! # Environment Variables
//!
//! - `SCADBOX_LOG` - Log filter (overrides RUST_LOG)
//! - `SCADBOX_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `SCADBOX_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use scadbox::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the isolate subprocess: compact, no target, so its lines
    /// interleave readably with the host's.
    pub fn for_worker() -> Self {
        Self {
            show_target: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter set from CLI arguments wins over `SCADBOX_LOG`/`RUST_LOG`;
    /// `SCADBOX_LOG_LEVEL` only applies when no filter is set.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("SCADBOX_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("SCADBOX_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("SCADBOX_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber. Subsequent calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let result = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
    };

    // Already initialized
    let _ = result;
}
