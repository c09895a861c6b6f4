//! Error types for scadbox.

use std::path::PathBuf;

use thiserror::Error;

use crate::result::CompilationResult;

/// Failure to fetch or instantiate the compiler image.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("Compiler image not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read compiler image {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("Compiler image is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("Compiler image is empty: {0}")]
    Empty(PathBuf),

    #[error("Compiler image digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Failed to instantiate compiler image: {0}")]
    Instantiate(String),
}

/// Failure to build a sandbox instance for one request.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to allocate sandbox filesystem: {0}")]
    Filesystem(#[source] std::io::Error),

    #[error("Failed to instantiate compiler entry point: {0}")]
    Entrypoint(String),

    #[error("Failed to stage source: {0}")]
    Source(#[source] std::io::Error),
}

/// Errors surfaced synchronously or from initialization.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Coordinator is not ready. Call initialize() first.")]
    NotReady,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to launch isolate: {0}")]
    Launch(String),

    #[error("Isolate fault: {0}")]
    IsolateFault(String),
}

/// Outcome of an accepted request that did not produce a usable result.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Request {generation} was superseded by a newer request")]
    Superseded { generation: u64 },

    #[error("Request {generation} was cancelled")]
    Cancelled { generation: u64 },

    #[error("Isolate fault: {0}")]
    IsolateFault(String),

    #[error("Compilation failed: {}", .0.summary())]
    CompileFailed(Box<CompilationResult>),

    #[error("Compiler reported success but produced no output")]
    NoOutputProduced(Box<CompilationResult>),
}

impl CompileError {
    /// Supersession and cancellation are intentional discards, not failures.
    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Superseded { .. } | Self::Cancelled { .. })
    }

    /// The assembled result, when the compiler actually ran to completion.
    pub fn result(&self) -> Option<&CompilationResult> {
        match self {
            Self::CompileFailed(result) | Self::NoOutputProduced(result) => Some(result),
            _ => None,
        }
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
