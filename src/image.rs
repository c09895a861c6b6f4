//! Compiler image loading.
//!
//! Loading the compiler image (reading the executable, fingerprinting it,
//! collecting its fonts) is the expensive one-time step. [`ImageLoader`]
//! memoizes it for the lifetime of the session that owns the loader:
//! concurrent callers share one in-flight load, and a failed load is not
//! cached so a later call can retry.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::{LoadError, ProvisionError};
use crate::sandbox::fonts::FontSet;
use crate::sandbox::{EntryPoint, NativeEntry, SandboxEnv};

/// Descriptive facts about a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Executable path, when the image can be re-opened by another process.
    pub path: Option<PathBuf>,
    /// Hex SHA-256 of the image bytes.
    pub digest: String,
    pub size: u64,
    /// Directory the font set was loaded from.
    pub font_dir: Option<PathBuf>,
}

/// A loaded, immutable compiler image shared by every request of a session.
pub trait CompilerImage: Send + Sync + fmt::Debug {
    fn info(&self) -> ImageInfo;

    fn fonts(&self) -> &FontSet;

    /// Create a fresh entry point bound to one sandbox.
    fn instantiate(&self, env: &SandboxEnv) -> Result<Box<dyn EntryPoint>, ProvisionError>;
}

/// Where compiler images come from. `fetch` is blocking.
pub trait ImageSource: Send + Sync {
    fn fetch(&self) -> Result<Arc<dyn CompilerImage>, LoadError>;
}

/// Loads a native compiler executable from disk.
#[derive(Debug, Clone)]
pub struct NativeImageSource {
    program: PathBuf,
    font_dir: Option<PathBuf>,
    expected_digest: Option<String>,
}

impl NativeImageSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            font_dir: None,
            expected_digest: None,
        }
    }

    /// Load font files from `dir` along with the image.
    pub fn with_font_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.font_dir = Some(dir.into());
        self
    }

    /// Reject the image unless its SHA-256 matches `digest`.
    pub fn with_expected_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }
}

impl ImageSource for NativeImageSource {
    fn fetch(&self) -> Result<Arc<dyn CompilerImage>, LoadError> {
        let path = resolve_program(&self.program)?;

        let meta = fs::metadata(&path).map_err(|e| LoadError::Unreadable {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(LoadError::NotExecutable(path));
        }

        let bytes = fs::read(&path).map_err(|e| LoadError::Unreadable {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(LoadError::Empty(path));
        }

        let digest = format!("{:x}", Sha256::digest(&bytes));
        if let Some(expected) = &self.expected_digest
            && !expected.eq_ignore_ascii_case(&digest)
        {
            return Err(LoadError::DigestMismatch {
                expected: expected.clone(),
                actual: digest,
            });
        }

        let fonts = match &self.font_dir {
            Some(dir) => FontSet::from_dir(dir).unwrap_or_else(|e| {
                tracing::warn!(dir = %dir.display(), error = %e, "Font directory unreadable, continuing without fonts");
                FontSet::embedded()
            }),
            None => FontSet::embedded(),
        };

        tracing::info!(
            path = %path.display(),
            size = bytes.len(),
            digest = %digest,
            fonts = fonts.len(),
            "Loaded compiler image"
        );

        Ok(Arc::new(NativeImage {
            path,
            digest,
            size: bytes.len() as u64,
            fonts,
            font_dir: self.font_dir.clone(),
        }))
    }
}

/// Resolve `program` to an existing path, searching `PATH` for bare names.
fn resolve_program(program: &Path) -> Result<PathBuf, LoadError> {
    if program.components().count() > 1 || program.is_absolute() {
        return if program.exists() {
            Ok(program.to_path_buf())
        } else {
            Err(LoadError::NotFound(program.to_path_buf()))
        };
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| LoadError::NotFound(program.to_path_buf()))
}

/// A native compiler executable, verified and fingerprinted.
#[derive(Debug)]
pub struct NativeImage {
    path: PathBuf,
    digest: String,
    size: u64,
    fonts: FontSet,
    font_dir: Option<PathBuf>,
}

impl CompilerImage for NativeImage {
    fn info(&self) -> ImageInfo {
        ImageInfo {
            path: Some(self.path.clone()),
            digest: self.digest.clone(),
            size: self.size,
            font_dir: self.font_dir.clone(),
        }
    }

    fn fonts(&self) -> &FontSet {
        &self.fonts
    }

    fn instantiate(&self, _env: &SandboxEnv) -> Result<Box<dyn EntryPoint>, ProvisionError> {
        Ok(Box::new(NativeEntry::new(&self.path)))
    }
}

/// Memoizing loader for one session.
pub struct ImageLoader {
    source: Arc<dyn ImageSource>,
    image: OnceCell<Arc<dyn CompilerImage>>,
    fetches: AtomicUsize,
}

impl ImageLoader {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self {
            source,
            image: OnceCell::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Load the image, or return the memoized one.
    pub async fn load(&self) -> Result<Arc<dyn CompilerImage>, LoadError> {
        self.image
            .get_or_try_init(|| async {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                let source = Arc::clone(&self.source);
                match tokio::task::spawn_blocking(move || source.fetch()).await {
                    Ok(fetched) => fetched,
                    Err(e) => Err(LoadError::Instantiate(format!(
                        "image load task failed: {}",
                        e
                    ))),
                }
            })
            .await
            .map(Arc::clone)
    }

    /// The memoized image, if a load has completed.
    pub fn get(&self) -> Option<Arc<dyn CompilerImage>> {
        self.image.get().cloned()
    }

    /// Number of fetches actually started.
    pub fn load_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("loaded", &self.image.initialized())
            .field("fetches", &self.load_count())
            .finish()
    }
}
