//! Read-only view handed to the UI layer.

use serde::Serialize;

use crate::connection::ConnectionStatus;
use crate::store::ChatState;
use crate::types::{Conversation, ConversationId, Message};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatSnapshot {
    /// Messages of the active conversation, in display order.
    pub messages: Vec<Message>,
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<ConversationId>,
    pub is_generating: bool,
    pub connection: ConnectionStatus,
}

impl ChatSnapshot {
    pub fn capture(state: &ChatState, connection: ConnectionStatus) -> Self {
        let active_conversation = state.active_conversation().cloned();
        let messages = active_conversation
            .as_ref()
            .map(|id| state.messages_for(id).into_iter().cloned().collect())
            .unwrap_or_default();
        Self {
            messages,
            conversations: state.conversations().to_vec(),
            active_conversation,
            is_generating: state.is_generating(),
            connection,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
