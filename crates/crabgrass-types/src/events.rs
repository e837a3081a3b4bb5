use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Listener key. Every inbound event kind plus the locally raised `error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    CompletionChanged,
    FileSaved,
    AgentMessage,
    AgentEdit,
    AgentEditStreamStart,
    AgentEditStreamChunk,
    AgentEditStreamEnd,
    Error,
}

impl EventKind {
    pub const INBOUND: [EventKind; 8] = [
        EventKind::Connected,
        EventKind::CompletionChanged,
        EventKind::FileSaved,
        EventKind::AgentMessage,
        EventKind::AgentEdit,
        EventKind::AgentEditStreamStart,
        EventKind::AgentEditStreamChunk,
        EventKind::AgentEditStreamEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::CompletionChanged => "completion_changed",
            EventKind::FileSaved => "file_saved",
            EventKind::AgentMessage => "agent_message",
            EventKind::AgentEdit => "agent_edit",
            EventKind::AgentEditStreamStart => "agent_edit_stream_start",
            EventKind::AgentEditStreamChunk => "agent_edit_stream_chunk",
            EventKind::AgentEditStreamEnd => "agent_edit_stream_end",
            EventKind::Error => "error",
        }
    }

    /// Maps an SSE `event:` name to a server-sent kind. `error` is never
    /// accepted from the wire.
    pub fn from_wire(name: &str) -> Option<Self> {
        EventKind::INBOUND
            .into_iter()
            .find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edit operation as named by the server. Unknown names pass through so the
/// assembler never has to understand them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EditOperation {
    Insert,
    Replace,
    Delete,
    Other(String),
}

impl EditOperation {
    pub fn as_str(&self) -> &str {
        match self {
            EditOperation::Insert => "insert",
            EditOperation::Replace => "replace",
            EditOperation::Delete => "delete",
            EditOperation::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for EditOperation {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "insert" => EditOperation::Insert,
            "replace" => EditOperation::Replace,
            "delete" => EditOperation::Delete,
            _ => EditOperation::Other(raw),
        }
    }
}

impl From<EditOperation> for String {
    fn from(op: EditOperation) -> Self {
        op.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    #[serde(default)]
    pub idea_id: Option<String>,
    #[serde(default)]
    pub objective_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChanged {
    #[serde(default)]
    pub idea_id: Option<String>,
    pub file_type: String,
    pub is_complete: bool,
    #[serde(default)]
    pub total_complete: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSaved {
    #[serde(default)]
    pub idea_id: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(alias = "message", alias = "response")]
    pub content: String,
}

/// A complete edit, either pushed whole or synthesized from a finished
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEdit {
    #[serde(default)]
    pub edit_id: Option<String>,
    pub file_path: String,
    pub operation: EditOperation,
    #[serde(default)]
    pub range: serde_json::Value,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStreamStart {
    pub edit_id: String,
    pub file_path: String,
    pub operation: EditOperation,
    #[serde(default)]
    pub range: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStreamChunk {
    pub edit_id: String,
    #[serde(alias = "chunk")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStreamEnd {
    pub edit_id: String,
    pub final_content: String,
}

/// Typed server push event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Connected(Connected),
    CompletionChanged(CompletionChanged),
    FileSaved(FileSaved),
    AgentMessage(AgentMessage),
    AgentEdit(AgentEdit),
    AgentEditStreamStart(EditStreamStart),
    AgentEditStreamChunk(EditStreamChunk),
    AgentEditStreamEnd(EditStreamEnd),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundEvent {
    /// Decodes one named SSE frame. `data` is the JSON payload string.
    pub fn decode(event_name: &str, data: &str) -> Result<Self, DecodeError> {
        let kind = EventKind::from_wire(event_name.trim())
            .ok_or_else(|| DecodeError::UnknownKind(event_name.to_string()))?;
        let data = if data.trim().is_empty() { "{}" } else { data };

        Ok(match kind {
            EventKind::Connected => InboundEvent::Connected(payload(kind, data)?),
            EventKind::CompletionChanged => InboundEvent::CompletionChanged(payload(kind, data)?),
            EventKind::FileSaved => InboundEvent::FileSaved(payload(kind, data)?),
            EventKind::AgentMessage => InboundEvent::AgentMessage(payload(kind, data)?),
            EventKind::AgentEdit => InboundEvent::AgentEdit(payload(kind, data)?),
            EventKind::AgentEditStreamStart => {
                InboundEvent::AgentEditStreamStart(payload(kind, data)?)
            }
            EventKind::AgentEditStreamChunk => {
                InboundEvent::AgentEditStreamChunk(payload(kind, data)?)
            }
            EventKind::AgentEditStreamEnd => InboundEvent::AgentEditStreamEnd(payload(kind, data)?),
            EventKind::Error => return Err(DecodeError::UnknownKind(event_name.to_string())),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Connected(_) => EventKind::Connected,
            InboundEvent::CompletionChanged(_) => EventKind::CompletionChanged,
            InboundEvent::FileSaved(_) => EventKind::FileSaved,
            InboundEvent::AgentMessage(_) => EventKind::AgentMessage,
            InboundEvent::AgentEdit(_) => EventKind::AgentEdit,
            InboundEvent::AgentEditStreamStart(_) => EventKind::AgentEditStreamStart,
            InboundEvent::AgentEditStreamChunk(_) => EventKind::AgentEditStreamChunk,
            InboundEvent::AgentEditStreamEnd(_) => EventKind::AgentEditStreamEnd,
        }
    }

    /// Edit id for streamed and whole edits, used as a correlation id in logs.
    pub fn edit_id(&self) -> Option<&str> {
        match self {
            InboundEvent::AgentEdit(edit) => edit.edit_id.as_deref(),
            InboundEvent::AgentEditStreamStart(start) => Some(&start.edit_id),
            InboundEvent::AgentEditStreamChunk(chunk) => Some(&chunk.edit_id),
            InboundEvent::AgentEditStreamEnd(end) => Some(&end.edit_id),
            _ => None,
        }
    }
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: &str) -> Result<T, DecodeError> {
    serde_json::from_str(data).map_err(|source| DecodeError::Payload { kind, source })
}
