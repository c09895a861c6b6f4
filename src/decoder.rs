//! Output formats and the mesh decoder seam.
//!
//! Compiler output is an opaque byte buffer to this crate. Turning it into
//! renderable geometry is the job of a [`ResultDecoder`] supplied by the caller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::result::CompilationResult;

/// Mesh export format requested from the compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Binary STL (default for previews)
    #[default]
    MeshBinary,
    /// ASCII STL
    MeshAscii,
}

impl OutputFormat {
    /// Value passed to the compiler's `--export-format` flag.
    pub fn export_flag(self) -> &'static str {
        match self {
            Self::MeshBinary => "binstl",
            Self::MeshAscii => "asciistl",
        }
    }

    /// File extension of the artifact inside the sandbox.
    pub fn extension(self) -> &'static str {
        "stl"
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" | "binstl" | "mesh_binary" => Ok(Self::MeshBinary),
            "ascii" | "asciistl" | "mesh_ascii" => Ok(Self::MeshAscii),
            _ => Err(format!(
                "Unknown output format: '{}'. Valid options: binary, ascii",
                s
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeshBinary => write!(f, "binary"),
            Self::MeshAscii => write!(f, "ascii"),
        }
    }
}

/// Decodes compiler output into caller-defined geometry.
pub trait ResultDecoder {
    type Geometry;
    type Error;

    fn decode(&self, bytes: &[u8], format: OutputFormat) -> Result<Self::Geometry, Self::Error>;
}

impl CompilationResult {
    /// Hand the output buffer to `decoder`. Returns `None` when there is no output.
    pub fn decode_with<D: ResultDecoder>(
        &self,
        decoder: &D,
    ) -> Option<Result<D::Geometry, D::Error>> {
        self.output
            .as_deref()
            .map(|bytes| decoder.decode(bytes, self.format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ByteCount;

    impl ResultDecoder for ByteCount {
        type Geometry = usize;
        type Error = String;

        fn decode(&self, bytes: &[u8], format: OutputFormat) -> Result<usize, String> {
            match format {
                OutputFormat::MeshBinary => Ok(bytes.len()),
                OutputFormat::MeshAscii => Err("ascii not supported".into()),
            }
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("binary".parse::<OutputFormat>().unwrap(), OutputFormat::MeshBinary);
        assert_eq!("BINSTL".parse::<OutputFormat>().unwrap(), OutputFormat::MeshBinary);
        assert_eq!("ascii".parse::<OutputFormat>().unwrap(), OutputFormat::MeshAscii);
        assert!("obj".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_export_flags() {
        assert_eq!(OutputFormat::MeshBinary.export_flag(), "binstl");
        assert_eq!(OutputFormat::MeshAscii.export_flag(), "asciistl");
    }

    #[test]
    fn test_decode_with() {
        let mut result = CompilationResult {
            generation: 1,
            success: true,
            output: Some(vec![0u8; 84]),
            format: OutputFormat::MeshBinary,
            diagnostics: vec![],
            info_lines: vec![],
            error_lines: vec![],
            elapsed: Duration::ZERO,
        };
        assert_eq!(result.decode_with(&ByteCount), Some(Ok(84)));

        result.output = None;
        assert_eq!(result.decode_with(&ByteCount), None);
    }
}
