//! Font assets seeded into every sandbox.
//!
//! The compiler's font matcher probes several conventional locations, so each
//! font file is copied into every directory in [`FONT_DIRS`]. The fontconfig
//! file is embedded in the binary and written once under `fonts/`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Directories (relative to the sandbox root) the compiler searches for fonts.
pub const FONT_DIRS: &[&str] = &[
    "fonts",
    "usr/share/fonts",
    "home/.fonts",
    "home/.local/share/fonts",
];

/// Directory holding the fontconfig file, relative to the sandbox root.
pub const FONTCONFIG_DIR: &str = "fonts";

/// Name of the embedded fontconfig file.
pub const FONTCONFIG_FILE: &str = "fonts.conf";

/// Embedded fontconfig configuration.
pub const EMBEDDED_FONTCONFIG: &str = include_str!("fonts.conf");

/// Extensions accepted when loading fonts from a directory.
const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "ttc"];

/// A single font file held in memory.
#[derive(Debug, Clone)]
pub struct FontFile {
    pub name: String,
    pub bytes: Arc<[u8]>,
}

/// Fixed set of fonts loaded once with the compiler image.
#[derive(Debug, Clone, Default)]
pub struct FontSet {
    files: Vec<FontFile>,
}

impl FontSet {
    /// Font set with no font files (only the embedded fontconfig is seeded).
    pub fn embedded() -> Self {
        Self::default()
    }

    /// Load every font file in `dir`, skipping entries that cannot be read.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let is_font = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FONT_EXTENSIONS.contains(&e.to_lowercase().as_str()));
            if !is_font {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) => files.push(FontFile {
                    name: name.to_string(),
                    bytes: bytes.into(),
                }),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable font");
                }
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { files })
    }

    /// Add a font from memory.
    pub fn with_font(mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.files.push(FontFile {
            name: name.into(),
            bytes: bytes.into(),
        });
        self
    }

    pub fn files(&self) -> &[FontFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
