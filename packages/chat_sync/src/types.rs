//! Domain model: messages, conversations and their identifiers.
//!
//! Message ids are assigned client-side and never change. Whatever id the
//! server later reports for the same message is kept in
//! [`MessageMetadata::server_id`], so routing registrations made at send time
//! stay valid for the whole generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix that marks a conversation the server has not confirmed yet.
const TEMP_CONVERSATION_PREFIX: &str = "temp-";

/// Client-assigned message identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversation identifier. Either server-assigned, or a temporary marker
/// created on the first send of a brand new conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// A fresh temporary marker standing in for a not-yet-created conversation.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_CONVERSATION_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_CONVERSATION_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Tie-break rank for messages sharing a timestamp.
    pub(crate) fn order_rank(self) -> u8 {
        match self {
            Role::System => 0,
            Role::User => 1,
            Role::Assistant => 2,
        }
    }
}

/// Lifecycle of a single message.
///
/// `Pending -> Sending|Queued -> Processing -> Streaming -> Complete`, with
/// `Error` reachable from any non-terminal state. `Complete` and `Error` are
/// terminal and never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Queued,
    Processing,
    Streaming,
    Complete {
        /// Set when the user cancelled the generation.
        #[serde(default)]
        stopped: bool,
    },
    Error,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Pending
    }
}

impl MessageStatus {
    pub const COMPLETE: MessageStatus = MessageStatus::Complete { stopped: false };
    pub const STOPPED: MessageStatus = MessageStatus::Complete { stopped: true };

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Complete { .. } | MessageStatus::Error)
    }

    /// True for the statuses a server reports while it is still producing output.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MessageStatus::Queued | MessageStatus::Processing | MessageStatus::Streaming
        )
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sending | MessageStatus::Queued => 1,
            MessageStatus::Processing => 2,
            MessageStatus::Streaming => 3,
            MessageStatus::Complete { .. } | MessageStatus::Error => 4,
        }
    }

    /// Resolve a requested transition. Returns the new status, or `None` when
    /// the request would move backwards or leave a terminal state.
    pub fn advance(self, next: MessageStatus) -> Option<MessageStatus> {
        if self.is_terminal() {
            return None;
        }
        match next {
            MessageStatus::Error | MessageStatus::Complete { .. } => Some(next),
            _ if next.rank() > self.rank() => Some(next),
            _ => None,
        }
    }
}

/// A named sub-stream within one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Thinking,
    Response,
}

impl Section {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "thinking" | "reasoning" | "thought" => Some(Section::Thinking),
            "response" | "answer" | "content" | "final" => Some(Section::Response),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionContent {
    pub content: String,
    pub visible: bool,
}

impl SectionContent {
    fn empty() -> Self {
        Self {
            content: String::new(),
            visible: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSections {
    pub response: SectionContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<SectionContent>,
}

impl Default for MessageSections {
    fn default() -> Self {
        Self {
            response: SectionContent::empty(),
            thinking: None,
        }
    }
}

impl MessageSections {
    pub fn get(&self, section: Section) -> Option<&SectionContent> {
        match section {
            Section::Response => Some(&self.response),
            Section::Thinking => self.thinking.as_ref(),
        }
    }

    /// Mutable access to a section, creating it when absent.
    pub fn get_or_insert(&mut self, section: Section) -> &mut SectionContent {
        match section {
            Section::Response => &mut self.response,
            Section::Thinking => self.thinking.get_or_insert_with(SectionContent::empty),
        }
    }
}

/// How a content update combines with what is already there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    Append,
    Replace,
}

/// A file sent alongside a user message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Encoded payload, passed through to the server untouched.
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<FileAttachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<MessageSections>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(conversation_id: ConversationId, role: Role, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            created_at,
            status: MessageStatus::Pending,
            content: String::new(),
            sections: None,
            metadata: MessageMetadata::default(),
        }
    }

    /// Optimistic user message, shown immediately while the request is in flight.
    pub fn user(
        conversation_id: ConversationId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: MessageStatus::Sending,
            content: content.into(),
            ..Self::new(conversation_id, Role::User, created_at)
        }
    }

    /// Empty assistant message awaiting streamed content.
    pub fn assistant_placeholder(
        conversation_id: ConversationId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: MessageStatus::Streaming,
            ..Self::new(conversation_id, Role::Assistant, created_at)
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_attachment(mut self, attachment: Option<FileAttachment>) -> Self {
        self.metadata.attachment = attachment;
        self
    }

    pub fn section(&self, section: Section) -> Option<&SectionContent> {
        self.sections.as_ref().and_then(|s| s.get(section))
    }

    /// True when `raw` is either this message's own id or the id the server uses for it.
    pub fn answers_to(&self, raw: &str) -> bool {
        self.id.as_str() == raw || self.metadata.server_id.as_deref() == Some(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Provisional entry for a conversation the server has not created yet.
    pub fn provisional(id: ConversationId, first_message: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: provisional_title(first_message),
            created_at: now,
            updated_at: now,
        }
    }
}

const PROVISIONAL_TITLE_CHARS: usize = 40;

fn provisional_title(first_message: &str) -> String {
    let line = first_message.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return "New conversation".to_string();
    }
    let mut title: String = line.chars().take(PROVISIONAL_TITLE_CHARS).collect();
    if line.chars().count() > PROVISIONAL_TITLE_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_conversation_ids_are_marked() {
        let id = ConversationId::temporary();
        assert!(id.is_temporary());
        assert!(!ConversationId::from("abc123").is_temporary());
        assert_ne!(id, ConversationId::temporary());
    }

    #[test]
    fn status_only_moves_forward() {
        use MessageStatus::*;
        assert_eq!(Pending.advance(Sending), Some(Sending));
        assert_eq!(Sending.advance(Processing), Some(Processing));
        assert_eq!(Processing.advance(Streaming), Some(Streaming));
        assert_eq!(Streaming.advance(Processing), None);
        assert_eq!(Sending.advance(Queued), None);
        assert_eq!(Streaming.advance(MessageStatus::COMPLETE), Some(MessageStatus::COMPLETE));
    }

    #[test]
    fn terminal_statuses_are_never_left() {
        use MessageStatus::*;
        assert_eq!(Error.advance(MessageStatus::COMPLETE), None);
        assert_eq!(Error.advance(Streaming), None);
        assert_eq!(MessageStatus::STOPPED.advance(Error), None);
        assert_eq!(MessageStatus::COMPLETE.advance(Streaming), None);
    }

    #[test]
    fn any_live_status_can_fail() {
        use MessageStatus::*;
        for status in [Pending, Sending, Queued, Processing, Streaming] {
            assert_eq!(status.advance(Error), Some(Error));
        }
    }

    #[test]
    fn section_aliases() {
        assert_eq!(Section::from_wire("reasoning"), Some(Section::Thinking));
        assert_eq!(Section::from_wire(" Response "), Some(Section::Response));
        assert_eq!(Section::from_wire("tools"), None);
    }

    #[test]
    fn thinking_section_created_on_demand() {
        let mut sections = MessageSections::default();
        assert!(sections.get(Section::Thinking).is_none());
        sections.get_or_insert(Section::Thinking).content.push_str("hmm");
        assert_eq!(sections.get(Section::Thinking).map(|s| s.content.as_str()), Some("hmm"));
    }

    #[test]
    fn provisional_title_is_truncated() {
        let now = Utc::now();
        let long = "a".repeat(80);
        let convo = Conversation::provisional(ConversationId::temporary(), &long, now);
        assert_eq!(convo.title.chars().count(), PROVISIONAL_TITLE_CHARS + 1);
        let blank = Conversation::provisional(ConversationId::temporary(), "  ", now);
        assert_eq!(blank.title, "New conversation");
    }

    #[test]
    fn server_id_counts_as_alias() {
        let mut msg = Message::assistant_placeholder(ConversationId::from("c"), Utc::now());
        assert!(msg.answers_to(msg.id.as_str()));
        assert!(!msg.answers_to("srv-1"));
        msg.metadata.server_id = Some("srv-1".to_string());
        assert!(msg.answers_to("srv-1"));
    }
}
