//! Wire Protocol Types
//!
//! Inbound frames are parsed into one normalized [`UpdateFrame`] at the
//! transport boundary. Status strings are mapped through a single table into
//! [`MessageStatus`]; nothing downstream branches on raw strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::types::{ConversationId, FileAttachment, MessageStatus, Section, UpdateMode};

/// Inbound status spellings seen from backends, lowercased.
///
/// Several backend revisions report the same state differently
/// ("PROCESSING", "processing", "MessageStatus.PROCESSING", "in_progress").
const STATUS_TABLE: &[(&str, MessageStatus)] = &[
    ("pending", MessageStatus::Pending),
    ("created", MessageStatus::Pending),
    ("sending", MessageStatus::Sending),
    ("sent", MessageStatus::Sending),
    ("queued", MessageStatus::Queued),
    ("waiting", MessageStatus::Queued),
    ("processing", MessageStatus::Processing),
    ("in_progress", MessageStatus::Processing),
    ("thinking", MessageStatus::Processing),
    ("streaming", MessageStatus::Streaming),
    ("generating", MessageStatus::Streaming),
    ("responding", MessageStatus::Streaming),
    ("complete", MessageStatus::COMPLETE),
    ("completed", MessageStatus::COMPLETE),
    ("done", MessageStatus::COMPLETE),
    ("finished", MessageStatus::COMPLETE),
    ("stopped", MessageStatus::STOPPED),
    ("cancelled", MessageStatus::STOPPED),
    ("canceled", MessageStatus::STOPPED),
    ("error", MessageStatus::Error),
    ("failed", MessageStatus::Error),
];

/// Map a raw status string to the closed status enum.
pub fn normalize_status(raw: &str) -> Option<MessageStatus> {
    // "MessageStatus.PROCESSING" -> "processing"
    let tail = raw.trim().rsplit('.').next().unwrap_or_default();
    let key = tail.to_ascii_lowercase().replace(['-', ' '], "_");
    STATUS_TABLE
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, status)| *status)
}

/// Frames received FROM the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    MessageUpdate(RawMessageUpdate),
    Pong,
    /// Any other frame type; not handled by the sync core.
    #[serde(other)]
    Other,
}

/// `message_update` payload exactly as the server sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessageUpdate {
    #[serde(default)]
    pub message_id: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assistant_content: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_update_type: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub is_complete: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Normalized update frame. Ephemeral: consumed by the router and buffer, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateFrame {
    /// Message id as the server reported it (client id or server id).
    pub target_id: Option<String>,
    pub status: Option<MessageStatus>,
    pub content_fragment: Option<String>,
    pub update_mode: UpdateMode,
    pub section: Option<Section>,
    pub conversation_id: Option<ConversationId>,
    pub is_complete: bool,
    pub model: Option<String>,
    pub error: Option<String>,
}

impl UpdateFrame {
    /// Completion, failure, or a terminal status: the stream for this message ends here.
    pub fn is_terminal(&self) -> bool {
        self.is_complete
            || self.error.is_some()
            || self.status.is_some_and(|s| s.is_terminal())
    }
}

impl From<RawMessageUpdate> for UpdateFrame {
    fn from(raw: RawMessageUpdate) -> Self {
        let update_mode = match raw.content_update_type.as_deref() {
            Some(kind) if kind.eq_ignore_ascii_case("replace") => UpdateMode::Replace,
            _ => UpdateMode::Append,
        };
        Self {
            target_id: raw.message_id.as_ref().and_then(value_to_id),
            status: raw.status.as_deref().and_then(normalize_status),
            content_fragment: raw.assistant_content.or(raw.content),
            update_mode,
            section: raw.section.as_deref().and_then(Section::from_wire),
            conversation_id: raw
                .conversation_id
                .as_ref()
                .and_then(value_to_id)
                .map(ConversationId::from),
            is_complete: raw.is_complete.unwrap_or(false),
            model: raw.model.filter(|m| !m.is_empty()),
            error: raw.error.as_ref().and_then(error_text),
        }
    }
}

/// Parse one text frame. `Ok(None)` means a well-formed frame this core ignores.
pub fn parse_frame(text: &str) -> Result<Option<UpdateFrame>, SyncError> {
    match serde_json::from_str::<InboundFrame>(text)? {
        InboundFrame::MessageUpdate(raw) => Ok(Some(raw.into())),
        InboundFrame::Pong | InboundFrame::Other => Ok(None),
    }
}

pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("detail"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

/// Frames sent FROM the client TO the server over the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping,
    StopGeneration {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
}

/// Body of the create-message request. `conversation_id: null` asks the
/// server to create a new conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub content: String,
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileAttachment>,
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub conversation_id: String,
    /// Server id of the assistant message, when the backend reports one.
    #[serde(default)]
    pub message_id: Option<String>,
}
