//! Message Store
//!
//! Normalized chat state plus a reducer. Every mutation is expressed as an
//! [`Action`]; applying one never fails and never panics, so the engine can
//! feed it whatever the network produced.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{
    Conversation, ConversationId, Message, MessageId, MessageSections, MessageStatus, Role,
    Section, UpdateMode,
};

/// Content carried by a [`MessageDelta`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentUpdate {
    pub text: String,
    pub mode: UpdateMode,
}

/// Metadata fields to overwrite. `None` leaves the existing value alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub server_id: Option<String>,
    pub model: Option<String>,
    /// Annotation only; does not change the status.
    pub error: Option<String>,
}

/// Create the message when the delta targets an unknown id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceholderSpec {
    pub conversation_id: ConversationId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Partial update to one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDelta {
    pub id: MessageId,
    pub content: Option<ContentUpdate>,
    /// Target section of `content`; `None` means the top-level content.
    pub section: Option<Section>,
    pub status: Option<MessageStatus>,
    /// Force `Complete` unless the message already ended in `Error`.
    pub is_complete: bool,
    pub metadata: MetadataPatch,
    pub create: Option<PlaceholderSpec>,
}

impl MessageDelta {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            content: None,
            section: None,
            status: None,
            is_complete: false,
            metadata: MetadataPatch::default(),
            create: None,
        }
    }

    pub fn content(
        mut self,
        text: impl Into<String>,
        mode: UpdateMode,
        section: Option<Section>,
    ) -> Self {
        self.content = Some(ContentUpdate {
            text: text.into(),
            mode,
        });
        self.section = section;
        self
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn complete(mut self) -> Self {
        self.is_complete = true;
        self
    }

    /// Mark the message failed and record why.
    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.status = Some(MessageStatus::Error);
        self.metadata.error = Some(detail.into());
        self
    }

    pub fn or_create(mut self, spec: PlaceholderSpec) -> Self {
        self.create = Some(spec);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Replace the conversation list. Temporary (unconfirmed) conversations survive.
    SetConversations(Vec<Conversation>),
    /// Insert at the front, replacing an entry with the same id.
    AddConversation(Conversation),
    SetActiveConversation(Option<ConversationId>),
    /// Bulk replace every message of one conversation.
    SetMessages {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    AddMessage(Message),
    UpdateMessage(MessageDelta),
    RemoveMessage(MessageId),
    RenameConversation {
        id: ConversationId,
        title: String,
    },
    /// Drop a conversation and all of its messages.
    RemoveConversation(ConversationId),
    /// Retag a temporary conversation with its server-assigned id.
    SwapConversationId {
        from: ConversationId,
        to: ConversationId,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatState {
    messages: HashMap<MessageId, Message>,
    conversations: Vec<Conversation>,
    active_conversation: Option<ConversationId>,
}

/// `reduce(state, action) -> state'`.
pub fn reduce(mut state: ChatState, action: Action) -> ChatState {
    state.apply(action);
    state
}

/// Chronological order; on equal timestamps system, then user, then assistant.
pub fn message_order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.role.order_rank().cmp(&b.role.order_rank()))
        .then_with(|| a.id.cmp(&b.id))
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, action: Action) {
        match action {
            Action::SetConversations(incoming) => {
                let mut next: Vec<Conversation> = self
                    .conversations
                    .drain(..)
                    .filter(|c| c.id.is_temporary() && !incoming.iter().any(|i| i.id == c.id))
                    .collect();
                next.extend(incoming);
                self.conversations = next;
            }
            Action::AddConversation(conversation) => {
                self.conversations.retain(|c| c.id != conversation.id);
                self.conversations.insert(0, conversation);
            }
            Action::SetActiveConversation(id) => {
                self.active_conversation = id;
            }
            Action::SetMessages {
                conversation_id,
                messages,
            } => {
                self.messages
                    .retain(|_, m| m.conversation_id != conversation_id);
                for mut message in messages {
                    message.conversation_id = conversation_id.clone();
                    self.messages.insert(message.id.clone(), message);
                }
            }
            Action::AddMessage(message) => {
                self.messages.insert(message.id.clone(), message);
            }
            Action::UpdateMessage(delta) => self.update_message(delta),
            Action::RemoveMessage(id) => {
                self.messages.remove(&id);
            }
            Action::RenameConversation { id, title } => {
                if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
                    conversation.title = title;
                }
            }
            Action::RemoveConversation(id) => {
                self.conversations.retain(|c| c.id != id);
                self.messages.retain(|_, m| m.conversation_id != id);
                if self.active_conversation.as_ref() == Some(&id) {
                    self.active_conversation = None;
                }
            }
            Action::SwapConversationId { from, to } => self.swap_conversation_id(&from, to),
        }
    }

    fn update_message(&mut self, delta: MessageDelta) {
        if !self.messages.contains_key(&delta.id) {
            let Some(spec) = delta.create.clone() else {
                return;
            };
            let message = match spec.role {
                Role::Assistant => {
                    Message::assistant_placeholder(spec.conversation_id, spec.created_at)
                }
                role => Message::new(spec.conversation_id, role, spec.created_at),
            };
            self.messages
                .insert(delta.id.clone(), message.with_id(delta.id.clone()));
        }
        let Some(message) = self.messages.get_mut(&delta.id) else {
            return;
        };

        if let Some(update) = delta.content {
            let target = match delta.section {
                Some(section) => {
                    &mut message
                        .sections
                        .get_or_insert_with(MessageSections::default)
                        .get_or_insert(section)
                        .content
                }
                None => &mut message.content,
            };
            match update.mode {
                UpdateMode::Append => target.push_str(&update.text),
                UpdateMode::Replace => *target = update.text,
            }
        }

        if let Some(next) = delta.status.and_then(|s| message.status.advance(s)) {
            message.status = next;
        }
        if delta.is_complete && !message.status.is_terminal() {
            message.status = MessageStatus::COMPLETE;
        }

        let patch = delta.metadata;
        if patch.server_id.is_some() {
            message.metadata.server_id = patch.server_id;
        }
        if patch.model.is_some() {
            message.metadata.model = patch.model;
        }
        if patch.error.is_some() {
            message.metadata.error = patch.error;
        }
    }

    fn swap_conversation_id(&mut self, from: &ConversationId, to: ConversationId) {
        if *from == to {
            return;
        }
        for message in self.messages.values_mut() {
            if message.conversation_id == *from {
                message.conversation_id = to.clone();
            }
        }
        if self.conversations.iter().any(|c| c.id == to) {
            self.conversations.retain(|c| c.id != *from);
        } else if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == *from) {
            conversation.id = to.clone();
        }
        if self.active_conversation.as_ref() == Some(from) {
            self.active_conversation = Some(to);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Look up a message by its client id or the id the server uses for it.
    pub fn resolve_id(&self, raw: &str) -> Option<MessageId> {
        let direct = MessageId::from(raw);
        if self.messages.contains_key(&direct) {
            return Some(direct);
        }
        self.messages
            .values()
            .find(|m| m.answers_to(raw))
            .map(|m| m.id.clone())
    }

    /// Messages of one conversation in display order.
    pub fn messages_for(&self, conversation_id: &ConversationId) -> Vec<&Message> {
        let mut messages: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.conversation_id == *conversation_id)
            .collect();
        messages.sort_by(|a, b| message_order(a, b));
        messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == *id)
    }

    pub fn has_conversation(&self, id: &ConversationId) -> bool {
        self.conversation(id).is_some() || self.messages.values().any(|m| m.conversation_id == *id)
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active_conversation.as_ref()
    }

    /// True while any assistant message is still being produced.
    pub fn is_generating(&self) -> bool {
        self.messages
            .values()
            .any(|m| m.role == Role::Assistant && !m.status.is_terminal())
    }

    /// Assistant messages that have not reached a terminal status, across all conversations.
    pub fn generating(&self) -> Vec<MessageId> {
        let mut messages: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.role == Role::Assistant && !m.status.is_terminal())
            .collect();
        messages.sort_by(|a, b| message_order(a, b));
        messages.into_iter().map(|m| m.id.clone()).collect()
    }

    /// `Queued | Processing | Streaming` messages of a conversation, in display order.
    pub fn in_flight(&self, conversation_id: &ConversationId) -> Vec<&Message> {
        self.messages_for(conversation_id)
            .into_iter()
            .filter(|m| m.status.is_in_flight())
            .collect()
    }

    pub fn latest_in_flight(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.in_flight(conversation_id).into_iter().last()
    }

    pub fn latest_assistant(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.messages_for(conversation_id)
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .last()
    }

    pub fn last_user_message(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.messages_for(conversation_id)
            .into_iter()
            .filter(|m| m.role == Role::User)
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn convo(id: &str) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            title: id.to_string(),
            created_at: t(0),
            updated_at: t(0),
        }
    }

    fn placeholder(conv: &str, id: &str, at: i64) -> Message {
        Message::assistant_placeholder(ConversationId::from(conv), t(at))
            .with_id(MessageId::from(id))
    }

    fn append(id: &str, text: &str) -> Action {
        Action::UpdateMessage(
            MessageDelta::new(MessageId::from(id)).content(text, UpdateMode::Append, None),
        )
    }

    // ── content ─────────────────────────────────────────────────────────

    #[test]
    fn appends_concatenate_in_order() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        for chunk in ["Hel", "lo wo", "rld!"] {
            state.apply(append("a1", chunk));
        }
        assert_eq!(state.message(&MessageId::from("a1")).unwrap().content, "Hello world!");
    }

    #[test]
    fn replace_overwrites_content() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(append("a1", "draft"));
        state.apply(Action::UpdateMessage(
            MessageDelta::new(MessageId::from("a1")).content("final", UpdateMode::Replace, None),
        ));
        assert_eq!(state.message(&MessageId::from("a1")).unwrap().content, "final");
    }

    #[test]
    fn section_update_creates_section_and_leaves_top_level_alone() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(append("a1", "answer"));
        state.apply(Action::UpdateMessage(
            MessageDelta::new(MessageId::from("a1")).content(
                "hmm",
                UpdateMode::Append,
                Some(Section::Thinking),
            ),
        ));

        let msg = state.message(&MessageId::from("a1")).unwrap();
        assert_eq!(msg.content, "answer");
        assert_eq!(msg.section(Section::Thinking).unwrap().content, "hmm");
        assert!(msg.section(Section::Response).unwrap().content.is_empty());
    }

    #[test]
    fn status_and_metadata_merge_without_touching_content() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(append("a1", "partial"));

        let mut delta = MessageDelta::new(MessageId::from("a1"));
        delta.metadata.model = Some("gpt".into());
        delta.metadata.server_id = Some("srv-9".into());
        state.apply(Action::UpdateMessage(delta));

        let msg = state.message(&MessageId::from("a1")).unwrap();
        assert_eq!(msg.content, "partial");
        assert_eq!(msg.metadata.model.as_deref(), Some("gpt"));
        assert_eq!(state.resolve_id("srv-9"), Some(MessageId::from("a1")));
    }

    // ── status ──────────────────────────────────────────────────────────

    #[test]
    fn is_complete_does_not_override_error() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(Action::UpdateMessage(
            MessageDelta::new(MessageId::from("a1")).failed("boom").complete(),
        ));
        let msg = state.message(&MessageId::from("a1")).unwrap();
        assert_eq!(msg.status, MessageStatus::Error);
        assert_eq!(msg.metadata.error.as_deref(), Some("boom"));
    }

    #[test]
    fn is_complete_forces_complete() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(Action::UpdateMessage(MessageDelta::new(MessageId::from("a1")).complete()));
        assert_eq!(
            state.message(&MessageId::from("a1")).unwrap().status,
            MessageStatus::COMPLETE
        );
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(Action::UpdateMessage(
            MessageDelta::new(MessageId::from("a1")).status(MessageStatus::STOPPED),
        ));
        state.apply(Action::UpdateMessage(
            MessageDelta::new(MessageId::from("a1"))
                .status(MessageStatus::Streaming)
                .complete(),
        ));
        state.apply(Action::UpdateMessage(MessageDelta::new(MessageId::from("a1")).failed("late")));
        assert_eq!(
            state.message(&MessageId::from("a1")).unwrap().status,
            MessageStatus::STOPPED
        );
    }

    // ── unknown ids ─────────────────────────────────────────────────────

    #[test]
    fn unknown_id_is_a_noop() {
        let state = reduce(ChatState::new(), append("ghost", "boo"));
        assert_eq!(state, ChatState::new());
    }

    #[test]
    fn unknown_id_with_create_inserts_placeholder() {
        let delta = MessageDelta::new(MessageId::from("srv-1"))
            .content("hi", UpdateMode::Append, None)
            .or_create(PlaceholderSpec {
                conversation_id: ConversationId::from("c"),
                role: Role::Assistant,
                created_at: t(5),
            });
        let state = reduce(ChatState::new(), Action::UpdateMessage(delta));
        let msg = state.message(&MessageId::from("srv-1")).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.status, MessageStatus::Streaming);
        assert_eq!(msg.content, "hi");
    }

    // ── ordering & queries ──────────────────────────────────────────────

    #[test]
    fn user_sorts_before_assistant_on_equal_timestamps() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a", 1)));
        state.apply(Action::AddMessage(
            Message::user(ConversationId::from("c"), "q", t(1)).with_id(MessageId::from("z")),
        ));
        state.apply(Action::AddMessage(
            Message::user(ConversationId::from("c"), "earlier", t(0)).with_id(MessageId::from("y")),
        ));

        let order: Vec<&str> = state
            .messages_for(&ConversationId::from("c"))
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(order, vec!["y", "z", "a"]);
    }

    #[test]
    fn generating_is_derived_from_status() {
        let mut state = ChatState::new();
        assert!(!state.is_generating());
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        assert!(state.is_generating());
        state.apply(Action::UpdateMessage(MessageDelta::new(MessageId::from("a1")).complete()));
        assert!(!state.is_generating());
    }

    #[test]
    fn in_flight_and_latest_queries() {
        let c = ConversationId::from("c");
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(Action::AddMessage(placeholder("c", "a2", 2)));
        state.apply(Action::AddMessage(
            Message::user(c.clone(), "q", t(1)).with_id(MessageId::from("u1")),
        ));
        state.apply(Action::UpdateMessage(MessageDelta::new(MessageId::from("a2")).complete()));

        assert_eq!(state.latest_in_flight(&c).map(|m| m.id.as_str()), Some("a1"));
        assert_eq!(state.latest_assistant(&c).map(|m| m.id.as_str()), Some("a2"));
        assert_eq!(state.last_user_message(&c).map(|m| m.id.as_str()), Some("u1"));
        assert_eq!(state.generating(), vec![MessageId::from("a1")]);
    }

    // ── conversations ───────────────────────────────────────────────────

    #[test]
    fn set_conversations_keeps_temporary_entries() {
        let temp = ConversationId::temporary();
        let mut state = ChatState::new();
        state.apply(Action::AddConversation(Conversation::provisional(
            temp.clone(),
            "Hello",
            t(0),
        )));
        state.apply(Action::SetConversations(vec![convo("a"), convo("b")]));

        let ids: Vec<&ConversationId> = state.conversations().iter().map(|c| &c.id).collect();
        assert_eq!(ids, vec![&temp, &ConversationId::from("a"), &ConversationId::from("b")]);
    }

    #[test]
    fn swap_retags_messages_entry_and_active() {
        let temp = ConversationId::temporary();
        let real = ConversationId::from("abc123");
        let mut state = ChatState::new();
        state.apply(Action::AddConversation(Conversation::provisional(
            temp.clone(),
            "Hello",
            t(0),
        )));
        state.apply(Action::SetActiveConversation(Some(temp.clone())));
        state.apply(Action::AddMessage(Message::user(temp.clone(), "Hello", t(0))));
        state.apply(Action::AddMessage(Message::assistant_placeholder(temp.clone(), t(0))));

        state.apply(Action::SwapConversationId {
            from: temp.clone(),
            to: real.clone(),
        });

        assert_eq!(state.active_conversation(), Some(&real));
        assert_eq!(state.messages_for(&real).len(), 2);
        assert!(state.messages_for(&temp).is_empty());
        assert_eq!(state.conversations().len(), 1);
        assert_eq!(state.conversations()[0].id, real);

        // A second swap from the same marker finds nothing to do.
        let before = state.clone();
        state.apply(Action::SwapConversationId { from: temp, to: real });
        assert_eq!(state, before);
    }

    #[test]
    fn swap_merges_into_existing_entry() {
        let temp = ConversationId::temporary();
        let mut state = ChatState::new();
        state.apply(Action::AddConversation(Conversation::provisional(
            temp.clone(),
            "Hello",
            t(0),
        )));
        state.apply(Action::SetConversations(vec![convo("abc123")]));
        state.apply(Action::SwapConversationId {
            from: temp,
            to: ConversationId::from("abc123"),
        });
        assert_eq!(state.conversations().len(), 1);
        assert_eq!(state.conversations()[0].title, "abc123");
    }

    #[test]
    fn remove_conversation_drops_messages_and_active() {
        let c = ConversationId::from("c");
        let mut state = ChatState::new();
        state.apply(Action::AddConversation(convo("c")));
        state.apply(Action::SetActiveConversation(Some(c.clone())));
        state.apply(Action::AddMessage(placeholder("c", "a1", 0)));
        state.apply(Action::AddMessage(placeholder("other", "a2", 0)));

        state.apply(Action::RemoveConversation(c.clone()));
        assert!(state.conversation(&c).is_none());
        assert!(state.active_conversation().is_none());
        assert_eq!(state.message_count(), 1);
    }

    #[test]
    fn set_messages_replaces_one_conversation_only() {
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(placeholder("c", "old", 0)));
        state.apply(Action::AddMessage(placeholder("d", "keep", 0)));
        state.apply(Action::SetMessages {
            conversation_id: ConversationId::from("c"),
            messages: vec![placeholder("c", "new", 1)],
        });
        assert!(state.message(&MessageId::from("old")).is_none());
        assert!(state.message(&MessageId::from("new")).is_some());
        assert!(state.message(&MessageId::from("keep")).is_some());
    }

    #[test]
    fn rename_updates_title() {
        let mut state = ChatState::new();
        state.apply(Action::AddConversation(convo("c")));
        state.apply(Action::RenameConversation {
            id: ConversationId::from("c"),
            title: "Renamed".into(),
        });
        assert_eq!(state.conversation(&ConversationId::from("c")).unwrap().title, "Renamed");
    }
}
