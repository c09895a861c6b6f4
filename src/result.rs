//! Compilation results and compiler diagnostics.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::decoder::OutputFormat;

/// Assembled outcome of one compile request.
#[derive(Debug, Clone, Serialize)]
pub struct CompilationResult {
    /// Generation the request was accepted under.
    pub generation: u64,
    pub success: bool,
    /// Raw artifact bytes, if the compiler wrote any.
    #[serde(skip)]
    pub output: Option<Vec<u8>>,
    pub format: OutputFormat,
    pub diagnostics: Vec<Diagnostic>,
    /// Informational stream lines, in emission order.
    pub info_lines: Vec<String>,
    /// Error stream lines, in emission order.
    pub error_lines: Vec<String>,
    pub elapsed: Duration,
}

impl CompilationResult {
    /// Output size in bytes (0 when absent).
    pub fn output_len(&self) -> usize {
        self.output.as_ref().map_or(0, Vec::len)
    }

    /// Whether any diagnostic has error severity.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// First error diagnostic, or a generic description.
    pub fn summary(&self) -> String {
        self.diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
            .or_else(|| self.diagnostics.first())
            .map(ToString::to_string)
            .unwrap_or_else(|| "no diagnostics".to_string())
    }
}

/// Diagnostic severity as reported by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Deprecated,
    Trace,
}

impl Severity {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "ERROR" => Some(Self::Error),
            "WARNING" => Some(Self::Warning),
            "DEPRECATED" => Some(Self::Deprecated),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Deprecated => write!(f, "deprecated"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

/// A single compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Source line, when the compiler reported one.
    pub line: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {}): {}", self.severity, line, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

impl Diagnostic {
    /// Parse one error-stream line such as
    /// `ERROR: Parser error in file "input.scad", line 3: syntax error`.
    pub fn parse(line: &str) -> Option<Self> {
        let (prefix, rest) = line.split_once(':')?;
        let severity = Severity::from_prefix(prefix.trim())?;
        let message = rest.trim().to_string();
        Some(Self {
            severity,
            line: find_line_number(&message),
            message,
        })
    }
}

/// Extract `N` from `line N` anywhere in the message.
fn find_line_number(message: &str) -> Option<u32> {
    let idx = message.find("line ")?;
    let digits: String = message[idx + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Build the diagnostic list for a finished request.
///
/// A failed request always gets at least one error diagnostic: the terminal
/// error message, or the raw error stream when nothing parsed.
pub fn collect_diagnostics(
    error_lines: &[String],
    terminal_error: Option<&str>,
    success: bool,
) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> =
        error_lines.iter().filter_map(|l| Diagnostic::parse(l)).collect();

    if let Some(message) = terminal_error {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            line: None,
            message: message.to_string(),
        });
    }

    if !success && !diagnostics.iter().any(|d| d.severity == Severity::Error) {
        let message = if error_lines.is_empty() {
            "compiler exited with an error".to_string()
        } else {
            error_lines.join("\n")
        };
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            line: None,
            message,
        });
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_with_line() {
        let d = Diagnostic::parse(
            "ERROR: Parser error in file \"input.scad\", line 3: syntax error",
        )
        .unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.line, Some(3));
        assert!(d.message.contains("syntax error"));
    }

    #[test]
    fn test_parse_warning_without_line() {
        let d = Diagnostic::parse("WARNING: Object may not be a valid 2-manifold").unwrap();
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.line, None);
    }

    #[test]
    fn test_parse_ignores_plain_lines() {
        assert!(Diagnostic::parse("Geometries in cache: 3").is_none());
        assert!(Diagnostic::parse("Compiling design (CSG Tree generation)...").is_none());
    }

    #[test]
    fn test_failed_request_always_has_error() {
        let lines = vec!["something went sideways".to_string()];
        let diags = collect_diagnostics(&lines, None, false);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Error);
        assert_eq!(diags[0].message, "something went sideways");

        let diags = collect_diagnostics(&[], None, false);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_terminal_error_appended() {
        let lines = vec!["WARNING: unused variable".to_string()];
        let diags = collect_diagnostics(&lines, Some("exit status 1"), false);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[1].message, "exit status 1");
    }

    #[test]
    fn test_success_keeps_only_parsed() {
        let lines = vec![
            "WARNING: deprecated syntax".to_string(),
            "Rendering finished".to_string(),
        ];
        let diags = collect_diagnostics(&lines, None, true);
        assert_eq!(diags.len(), 1);
    }
}
