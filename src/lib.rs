//! scadbox - single-flight coordinator for sandboxed CAD compiler runs.
//!
//! A [`Coordinator`] loads a compiler image once per session, then runs every
//! compile request in a fresh throwaway sandbox on the far side of an
//! isolation boundary. At most one request is pending at a time: a newer
//! request supersedes the pending one, and results of superseded or
//! cancelled requests never reach the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//! use scadbox::config::CoordinatorConfig;
//! use scadbox::image::NativeImageSource;
//! use scadbox::isolate::ProcessLauncher;
//! use scadbox::Coordinator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let coordinator = Coordinator::new(
//!     Arc::new(NativeImageSource::new("openscad")),
//!     Arc::new(ProcessLauncher::new()),
//!     CoordinatorConfig::default().with_env_overrides(),
//! );
//! coordinator.initialize().await?;
//! let result = coordinator.compile("cube(10);")?.await?;
//! println!("{} bytes", result.output_len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod image;
pub mod isolate;
pub mod logging;
pub mod result;
pub mod sandbox;

#[cfg(test)]
mod testing;

pub use config::CoordinatorConfig;
pub use coordinator::{CompileTicket, Coordinator, CoordinatorState};
pub use decoder::{OutputFormat, ResultDecoder};
pub use error::{CompileError, CoordinatorError, LoadError, ProvisionError};
pub use result::{CompilationResult, Diagnostic, Severity};
