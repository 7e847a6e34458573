//! # Lab Wire Protocol
//!
//! JSON text frames in both directions, plus raw binary PCM frames from the
//! client (see [`crate::audio`]).
//!
//! ## Message Format:
//! - **Client → Server**: `Envelope`, tagged by a `type` field
//! - **Server → Client**: loosely shaped JSON. Most messages carry `type`, but
//!   brain replies and older transcriptions are recognized only by which
//!   fields are present, so inbound messages are *classified* rather than
//!   deserialized straight into one tagged enum.
//!
//! ## Classification precedence (first match wins):
//! `status` → `file_content_request` → `cabinet` → `file_content` → `control`
//! → `debug` → non-empty `brain` → `transcription` / non-empty `text`.
//!
//! Payloads are not mutually exclusive by schema (a message may carry both a
//! `type` and a `text`), so the order above is the contract. Anything that
//! matches nothing, or matches a tag but lacks that shape's required fields,
//! is dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ClientResult;

/// Messages the console sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First message on every new socket
    Handshake { version: String },

    /// Typed user input for the lab
    TextInput { content: String },

    /// Debounced autosave of the workspace document
    WorkspaceSave { filename: String, content: String },

    /// User opened a file from the cabinet
    SelectFile { filename: String },

    /// Fetch a file the server asked us to open
    ReadFile { filename: String },

    /// Microphone on/off announcement
    MicState { active: bool },
}

impl Envelope {
    pub fn to_json(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, used as a tracing field.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Handshake { .. } => "handshake",
            Envelope::TextInput { .. } => "text_input",
            Envelope::WorkspaceSave { .. } => "workspace_save",
            Envelope::SelectFile { .. } => "select_file",
            Envelope::ReadFile { .. } => "read_file",
            Envelope::MicState { .. } => "mic_state",
        }
    }
}

/// `{type:"status", state, message, version}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusUpdate {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Extra fields a brain reply may carry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BrainMetadata {
    #[serde(default)]
    pub oracle_category: Option<String>,
    #[serde(default)]
    pub sources: Vec<Value>,
}

/// `{brain, brain_source, channel, clear, oracle_category, sources}`
#[derive(Debug, Clone, PartialEq)]
pub struct BrainReply {
    pub text: String,
    pub source_label: Option<String>,
    pub channel: Option<String>,
    pub clear: bool,
    pub metadata: BrainMetadata,
}

/// `{type:"transcription", text}` or any bare `{text}` payload
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
}

/// Flattened `{type:"cabinet", files:{archive, drafts|workspace}}`
#[derive(Debug, Clone, PartialEq)]
pub struct CabinetListing {
    /// Archive year keys; unordered on the wire, sorted by `FileCabinet`
    pub archive: Vec<String>,
    pub workspace_files: Vec<String>,
}

/// `{type:"file_content", filename, content}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileContent {
    pub filename: String,
    #[serde(default)]
    pub content: String,
}

/// `{type:"file_content_request", filename}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileRequest {
    pub filename: String,
}

/// Commands the server can issue to the console.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    StopAudio,
    Other(String),
}

/// `{type:"debug", event, data}`
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent {
    pub event: String,
    pub data: Value,
}

/// A classified server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Status(StatusUpdate),
    FileRequest(FileRequest),
    Cabinet(CabinetListing),
    FileContent(FileContent),
    Control(ControlCommand),
    Debug(DebugEvent),
    Brain(BrainReply),
    Transcription(Transcription),
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Status(_) => "status",
            Inbound::FileRequest(_) => "file_content_request",
            Inbound::Cabinet(_) => "cabinet",
            Inbound::FileContent(_) => "file_content",
            Inbound::Control(_) => "control",
            Inbound::Debug(_) => "debug",
            Inbound::Brain(_) => "brain",
            Inbound::Transcription(_) => "transcription",
        }
    }
}

/// Parse one text frame and classify it. Non-JSON frames are dropped.
pub fn decode(text: &str) -> Option<Inbound> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => classify(&value),
        Err(err) => {
            debug!(error = %err, "Dropping non-JSON frame");
            None
        }
    }
}

/// Classify a decoded JSON message. Total and deterministic: the same value
/// always yields the same kind, and at most one kind.
pub fn classify(value: &Value) -> Option<Inbound> {
    let tag = value.get("type").and_then(Value::as_str);

    let classified = match tag {
        Some("status") => typed(value).map(Inbound::Status),
        Some("file_content_request") => typed(value).map(Inbound::FileRequest),
        Some("cabinet") => Some(Inbound::Cabinet(cabinet(value))),
        Some("file_content") => typed(value).map(Inbound::FileContent),
        Some("control") => control(value).map(Inbound::Control),
        Some("debug") => Some(Inbound::Debug(debug_event(value))),
        _ => None,
    };
    if classified.is_some() {
        if tag != Some("debug") && (truthy_str(value, "brain").is_some() || truthy_str(value, "text").is_some()) {
            debug!(tag = ?tag, "Payload matches several shapes; tagged shape wins");
        }
        return classified;
    }

    if let Some(text) = truthy_str(value, "brain") {
        return Some(Inbound::Brain(brain(value, text)));
    }

    if tag == Some("transcription") || truthy_str(value, "text").is_some() {
        return truthy_str(value, "text").map(|text| {
            Inbound::Transcription(Transcription {
                text: text.to_string(),
            })
        });
    }

    None
}

fn typed<T: for<'de> Deserialize<'de>>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            debug!(error = %err, "Dropping payload with a known tag but the wrong shape");
            None
        }
    }
}

/// A string field that the server considers "set": present and non-empty.
fn truthy_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn cabinet(value: &Value) -> CabinetListing {
    let files = value.get("files").unwrap_or(&Value::Null);

    // Archive arrives as {year: [...]} from current servers, or a plain list
    let archive = match files.get("archive") {
        Some(Value::Object(years)) => years.keys().cloned().collect(),
        Some(Value::Array(years)) => years.iter().filter_map(scalar_to_string).collect(),
        _ => Vec::new(),
    };

    let workspace = files.get("workspace").or_else(|| files.get("drafts"));
    let workspace_files = match workspace {
        Some(Value::Array(names)) => names.iter().filter_map(scalar_to_string).collect(),
        _ => Vec::new(),
    };

    CabinetListing {
        archive,
        workspace_files,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn control(value: &Value) -> Option<ControlCommand> {
    match value.get("command").and_then(Value::as_str)? {
        "stop_audio" => Some(ControlCommand::StopAudio),
        other => Some(ControlCommand::Other(other.to_string())),
    }
}

fn debug_event(value: &Value) -> DebugEvent {
    DebugEvent {
        event: value
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("debug")
            .to_string(),
        data: value.get("data").cloned().unwrap_or(Value::Null),
    }
}

fn brain(value: &Value, text: &str) -> BrainReply {
    BrainReply {
        text: text.to_string(),
        source_label: truthy_str(value, "brain_source").map(str::to_string),
        channel: truthy_str(value, "channel").map(str::to_string),
        clear: value.get("clear").and_then(Value::as_bool).unwrap_or(false),
        metadata: BrainMetadata::deserialize(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_envelopes_are_tagged() {
        let handshake = Envelope::Handshake {
            version: "3.4.0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&handshake).unwrap(),
            json!({"type": "handshake", "version": "3.4.0"})
        );

        let save = Envelope::WorkspaceSave {
            filename: "a.md".to_string(),
            content: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&save).unwrap(),
            json!({"type": "workspace_save", "filename": "a.md", "content": "hello"})
        );

        let mic = Envelope::MicState { active: true };
        assert_eq!(mic.to_json().unwrap(), r#"{"type":"mic_state","active":true}"#);
    }

    #[test]
    fn test_each_shape_classifies_to_one_kind() {
        let cases = vec![
            (json!({"type": "status", "state": "ready", "message": "ok", "version": "3.4.0"}), "status"),
            (json!({"type": "file_content_request", "filename": "notes.md"}), "file_content_request"),
            (json!({"type": "cabinet", "files": {"archive": {"2024": []}, "drafts": ["a.md"]}}), "cabinet"),
            (json!({"type": "file_content", "filename": "a.md", "content": "hi"}), "file_content"),
            (json!({"type": "control", "command": "stop_audio"}), "control"),
            (json!({"type": "debug", "event": "tick", "data": {"n": 1}}), "debug"),
            (json!({"brain": "Narf.", "brain_source": "Pinky"}), "brain"),
            (json!({"type": "transcription", "text": "hello lab"}), "transcription"),
            (json!({"text": "bare text"}), "transcription"),
            (json!({"brain": "plan", "brain_source": "System", "channel": "insight"}), "brain"),
        ];

        for (value, expected) in cases {
            let inbound = classify(&value).unwrap_or_else(|| panic!("unclassified: {}", value));
            assert_eq!(inbound.kind(), expected, "for {}", value);
        }
    }

    #[test]
    fn test_precedence_for_overlapping_shapes() {
        // A tag beats a brain payload, a brain payload beats text
        let status_with_brain = json!({"type": "status", "state": "ready", "brain": "x"});
        assert_eq!(classify(&status_with_brain).unwrap().kind(), "status");

        let brain_with_text = json!({"brain": "thought", "text": "heard"});
        assert_eq!(classify(&brain_with_text).unwrap().kind(), "brain");

        let transcription_with_brain = json!({"type": "transcription", "text": "t", "brain": "b"});
        assert_eq!(classify(&transcription_with_brain).unwrap().kind(), "brain");
    }

    #[test]
    fn test_unknown_or_malformed_payloads_are_dropped() {
        assert!(classify(&json!({"type": "weather", "temp": 21})).is_none());
        assert!(classify(&json!({"type": "file_content"})).is_none());
        assert!(classify(&json!({"type": "status"})).is_none());
        assert!(classify(&json!({"brain": ""})).is_none());
        assert!(classify(&json!({"type": "transcription", "text": ""})).is_none());
        assert!(classify(&json!([1, 2, 3])).is_none());
        assert!(decode("not json at all").is_none());
    }

    #[test]
    fn test_brain_reply_fields() {
        let value = json!({
            "brain": "Consider the long game.",
            "brain_source": "The Brain",
            "channel": "insight",
            "clear": true,
            "oracle_category": "strategy",
            "sources": ["2019/notes.md"]
        });
        match classify(&value) {
            Some(Inbound::Brain(reply)) => {
                assert_eq!(reply.source_label.as_deref(), Some("The Brain"));
                assert_eq!(reply.channel.as_deref(), Some("insight"));
                assert!(reply.clear);
                assert_eq!(reply.metadata.oracle_category.as_deref(), Some("strategy"));
                assert_eq!(reply.metadata.sources.len(), 1);
            }
            other => panic!("expected brain reply, got {:?}", other),
        }
    }

    #[test]
    fn test_cabinet_accepts_workspace_or_drafts() {
        let current = json!({"type": "cabinet", "files": {"archive": ["2023", 2024], "workspace": ["b.md"]}});
        match classify(&current) {
            Some(Inbound::Cabinet(listing)) => {
                assert_eq!(listing.archive, vec!["2023", "2024"]);
                assert_eq!(listing.workspace_files, vec!["b.md"]);
            }
            other => panic!("expected cabinet, got {:?}", other),
        }

        let empty = json!({"type": "cabinet"});
        match classify(&empty) {
            Some(Inbound::Cabinet(listing)) => {
                assert!(listing.archive.is_empty());
                assert!(listing.workspace_files.is_empty());
            }
            other => panic!("expected cabinet, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_control_command_is_kept_for_logging() {
        let value = json!({"type": "control", "command": "reboot"});
        assert_eq!(
            classify(&value),
            Some(Inbound::Control(ControlCommand::Other("reboot".to_string())))
        );
    }
}
