//! Per-request sandbox provisioning.
//!
//! Every compile request gets its own [`SandboxInstance`]: a private
//! temporary filesystem, seeded fonts, an environment pointing the compiler
//! at them, and output sinks wired to the caller. The instance is consumed by
//! [`SandboxInstance::invoke`], so its entry point runs exactly once.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── input.scad
//! ├── output.stl
//! ├── fonts/                  (fonts.conf + font files)
//! ├── usr/share/fonts/
//! └── home/
//!     ├── .fonts/
//!     └── .local/share/fonts/
//! ```

pub mod fonts;
mod native;

pub use native::NativeEntry;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::decoder::OutputFormat;
use crate::error::ProvisionError;
use crate::image::CompilerImage;
use fonts::{EMBEDDED_FONTCONFIG, FONT_DIRS, FONTCONFIG_DIR, FONTCONFIG_FILE, FontSet};

/// Source file name inside the sandbox.
pub const INPUT_FILE: &str = "input.scad";

/// Output file stem inside the sandbox.
pub const OUTPUT_STEM: &str = "output";

/// Minimal search path handed to the compiler.
const SANDBOX_PATH: &str = "/usr/bin:/bin";

/// Output stream of a running compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Info,
    Error,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Receives compiler output lines as they are emitted.
pub trait OutputSink: Send + Sync {
    fn emit(&self, stream: StreamKind, text: &str);
}

impl<F> OutputSink for F
where
    F: Fn(StreamKind, &str) + Send + Sync,
{
    fn emit(&self, stream: StreamKind, text: &str) {
        self(stream, text)
    }
}

/// What the compiler entry point sees of its sandbox.
#[derive(Debug, Clone)]
pub struct SandboxEnv {
    pub root: PathBuf,
    pub vars: Vec<(String, String)>,
}

impl SandboxEnv {
    fn new(root: &Path) -> Self {
        let home = root.join("home");
        let vars = vec![
            ("HOME".to_string(), display(&home)),
            (
                "FONTCONFIG_PATH".to_string(),
                display(&root.join(FONTCONFIG_DIR)),
            ),
            (
                "FONTCONFIG_FILE".to_string(),
                display(&root.join(FONTCONFIG_DIR).join(FONTCONFIG_FILE)),
            ),
            (
                "XDG_DATA_HOME".to_string(),
                display(&home.join(".local/share")),
            ),
            ("XDG_CACHE_HOME".to_string(), display(&home.join(".cache"))),
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
        ];
        Self {
            root: root.to_path_buf(),
            vars,
        }
    }

    /// Look up a variable by name.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The compiler's `main`, bound to one sandbox.
///
/// Implementations may corrupt their own state when `call_main` returns;
/// taking `self: Box<Self>` means nothing can call it again.
pub trait EntryPoint: Send {
    /// Run the compiler with `args`, forwarding output to `sink`. Returns the exit code.
    fn call_main(self: Box<Self>, env: &SandboxEnv, args: &[String], sink: &dyn OutputSink) -> i32;
}

/// Counts from best-effort font seeding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub dirs_created: usize,
    pub files_written: usize,
    pub failures: usize,
}

/// Outcome of invoking the entry point.
#[derive(Debug)]
pub struct Invocation {
    pub exit_code: i32,
    /// Artifact bytes; `None` when the compiler wrote no output file.
    pub output: Option<Vec<u8>>,
}

impl Invocation {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// One throwaway compiler execution context.
pub struct SandboxInstance {
    dir: TempDir,
    env: SandboxEnv,
    entry: Box<dyn EntryPoint>,
    sink: Arc<dyn OutputSink>,
    report: ProvisionReport,
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("root", &self.dir.path())
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl SandboxInstance {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn env(&self) -> &SandboxEnv {
        &self.env
    }

    pub fn report(&self) -> ProvisionReport {
        self.report
    }

    /// Stage `source`, run the compiler once, and collect its output.
    ///
    /// Consumes the instance; the sandbox directory is removed on return.
    pub fn invoke(self, source: &str, format: OutputFormat) -> Result<Invocation, ProvisionError> {
        let root = self.dir.path();
        fs::write(root.join(INPUT_FILE), source).map_err(ProvisionError::Source)?;

        let output_name = format!("{}.{}", OUTPUT_STEM, format.extension());
        let args = vec![
            INPUT_FILE.to_string(),
            "-o".to_string(),
            output_name.clone(),
            "--export-format".to_string(),
            format.export_flag().to_string(),
        ];

        let exit_code = self.entry.call_main(&self.env, &args, self.sink.as_ref());

        let output = match fs::read(root.join(&output_name)) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read compiler output");
                None
            }
        };

        Ok(Invocation { exit_code, output })
    }
}

/// Build a fresh sandbox instance for `image`.
///
/// Font seeding is best-effort: individual directory or file failures are
/// counted and logged, never fatal.
pub fn provision(
    image: &dyn CompilerImage,
    sink: Arc<dyn OutputSink>,
) -> Result<SandboxInstance, ProvisionError> {
    let dir = tempfile::Builder::new()
        .prefix("scadbox-")
        .tempdir()
        .map_err(ProvisionError::Filesystem)?;
    let root = dir.path();

    let report = seed_fonts(root, image.fonts());
    let env = SandboxEnv::new(root);
    let entry = image.instantiate(&env)?;

    tracing::debug!(
        root = %root.display(),
        dirs_created = report.dirs_created,
        files_written = report.files_written,
        failures = report.failures,
        "Provisioned sandbox"
    );

    Ok(SandboxInstance {
        dir,
        env,
        entry,
        sink,
        report,
    })
}

/// Create font directories and copy every font into each of them.
pub(crate) fn seed_fonts(root: &Path, fonts: &FontSet) -> ProvisionReport {
    let mut report = ProvisionReport::default();

    for rel in FONT_DIRS {
        let dir = root.join(rel);
        match fs::create_dir_all(&dir) {
            Ok(()) => report.dirs_created += 1,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Failed to create font dir");
                report.failures += 1;
                continue;
            }
        }

        for font in fonts.files() {
            let path = dir.join(&font.name);
            match fs::write(&path, &font.bytes) {
                Ok(()) => report.files_written += 1,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to write font");
                    report.failures += 1;
                }
            }
        }
    }

    let config = root.join(FONTCONFIG_DIR).join(FONTCONFIG_FILE);
    match fs::write(&config, EMBEDDED_FONTCONFIG) {
        Ok(()) => report.files_written += 1,
        Err(e) => {
            tracing::debug!(path = %config.display(), error = %e, "Failed to write fontconfig");
            report.failures += 1;
        }
    }

    report
}
