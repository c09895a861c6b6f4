//! Wire protocol between host and isolate.
//!
//! Messages are JSON-serialized and newline-delimited. Every per-request
//! message carries the request generation as `id`, so output still draining
//! from a superseded request is never attributed to a newer one.

use serde::{Deserialize, Serialize};

use crate::decoder::OutputFormat;
use crate::sandbox::StreamKind;

/// Message from host to isolate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Compile `source` in a freshly provisioned sandbox.
    Compile {
        id: u64,
        source: String,
        format: OutputFormat,
    },

    /// Graceful shutdown request.
    Exit,
}

/// Why a terminal result reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The compiler ran and exited non-zero.
    Compile,
    /// The sandbox for this request could not be built.
    Provision,
}

/// Message from isolate to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IsolateMessage {
    /// Isolate loaded its image and accepts requests. Sent once at startup.
    Ready,

    /// Isolate cannot serve requests.
    Error { error: String },

    /// The isolate began running request `id`. Sent before any of its output.
    Started { id: u64 },

    /// One output line of a running request.
    Stream {
        id: u64,
        channel: StreamKind,
        text: String,
    },

    /// Terminal event of a request. Exactly one per accepted request.
    Result {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
        output: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureKind>,
        elapsed_millis: u64,
    },
}

impl HostMessage {
    /// Create a compile request.
    pub fn compile(id: u64, source: impl Into<String>, format: OutputFormat) -> Self {
        Self::Compile {
            id,
            source: source.into(),
            format,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("HostMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl IsolateMessage {
    /// Create a startup error message.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Create a stream line message.
    pub fn stream(id: u64, channel: StreamKind, text: impl Into<String>) -> Self {
        Self::Stream {
            id,
            channel,
            text: text.into(),
        }
    }

    /// Create a terminal result for a compiler that exited zero.
    pub fn completed(id: u64, output: Option<Vec<u8>>, elapsed_millis: u64) -> Self {
        Self::Result {
            id,
            success: true,
            output,
            error: None,
            failure: None,
            elapsed_millis,
        }
    }

    /// Create a terminal failure result.
    pub fn failed(
        id: u64,
        failure: FailureKind,
        error: impl Into<String>,
        elapsed_millis: u64,
    ) -> Self {
        Self::Result {
            id,
            success: false,
            output: None,
            error: Some(error.into()),
            failure: Some(failure),
            elapsed_millis,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("IsolateMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Artifact bytes travel as base64 strings.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_request_serialization() {
        let req = HostMessage::compile(7, "cube(1);", OutputFormat::MeshAscii);
        let line = req.to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"compile\""));
        assert!(line.contains("\"format\":\"mesh_ascii\""));

        match HostMessage::from_line(&line).unwrap() {
            HostMessage::Compile { id, source, format } => {
                assert_eq!(id, 7);
                assert_eq!(source, "cube(1);");
                assert_eq!(format, OutputFormat::MeshAscii);
            }
            other => panic!("Expected Compile variant, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_request() {
        let parsed = HostMessage::from_line(&HostMessage::Exit.to_line()).unwrap();
        assert_eq!(parsed, HostMessage::Exit);
    }

    #[test]
    fn test_ready_wire_form() {
        assert_eq!(IsolateMessage::Ready.to_line(), "{\"type\":\"ready\"}\n");
    }

    #[test]
    fn test_stream_wire_form() {
        let line = IsolateMessage::stream(3, StreamKind::Error, "WARNING: x").to_line();
        assert!(line.contains("\"type\":\"stream\""));
        assert!(line.contains("\"channel\":\"error\""));
        assert_eq!(
            IsolateMessage::from_line(&line).unwrap(),
            IsolateMessage::stream(3, StreamKind::Error, "WARNING: x")
        );
    }

    #[test]
    fn test_started_wire_form() {
        let line = IsolateMessage::Started { id: 12 }.to_line();
        assert_eq!(line, "{\"type\":\"started\",\"id\":12}\n");
    }

    #[test]
    fn test_result_output_is_base64() {
        let msg = IsolateMessage::completed(4, Some(vec![0, 1, 2, 255]), 15);
        let line = msg.to_line();
        assert!(line.contains("\"output\":\"AAEC/w==\""));
        assert!(!line.contains("failure"));
        assert_eq!(IsolateMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_failed_result_omits_output() {
        let msg = IsolateMessage::failed(5, FailureKind::Provision, "no space left", 2);
        let line = msg.to_line();
        assert!(!line.contains("output"));
        assert!(line.contains("\"failure\":\"provision\""));
        assert_eq!(IsolateMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_result_minimal_fields() {
        let parsed =
            IsolateMessage::from_line(r#"{"type":"result","id":9,"success":true,"elapsed_millis":1}"#)
                .unwrap();
        assert_eq!(parsed, IsolateMessage::completed(9, None, 1));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(IsolateMessage::from_line(r#"{"type":"restart"}"#).is_err());
        assert!(HostMessage::from_line("not json").is_err());
    }
}
