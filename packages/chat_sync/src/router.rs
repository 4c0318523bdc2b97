//! Update Router
//!
//! Decides which message an incoming [`UpdateFrame`] belongs to. Routing is a
//! pure function of the store snapshot and the registration table.
//!
//! ## Routing Strategy
//!
//! Rules are tried in order; the first hit wins:
//!
//! 1. **Explicit id**: the frame names a message the store knows, by client
//!    id or by the server id recorded in its metadata.
//! 2. **Registration**: the placeholder registered when the request was sent.
//!    This is the common path.
//! 3. **In flight** (heuristic): the most recent `Queued`, `Processing` or
//!    `Streaming` message of the conversation. Covers servers that omit ids
//!    mid-stream.
//! 4. **Latest assistant** (heuristic): the most recent assistant message of
//!    the conversation.
//! 5. **Placeholder**: nothing matched; the caller creates a new message so the
//!    content is not lost.
//!
//! "The conversation" is the frame's `conversation_id`, falling back to the
//! active conversation. Heuristic hits are logged at debug level and counted.

use tracing::debug;

use crate::protocol::UpdateFrame;
use crate::store::ChatState;
use crate::types::{ConversationId, MessageId};

/// Which rule resolved a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteRule {
    ExplicitId,
    Registered,
    InFlight,
    LatestAssistant,
}

impl RouteRule {
    pub fn is_heuristic(self) -> bool {
        matches!(self, RouteRule::InFlight | RouteRule::LatestAssistant)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    Existing {
        message_id: MessageId,
        rule: RouteRule,
    },
    /// No target found. `message_id` is the id the frame carried, if any.
    CreatePlaceholder {
        conversation_id: Option<ConversationId>,
        message_id: Option<String>,
    },
}

#[derive(Clone, Debug)]
struct Registration {
    message_id: MessageId,
    conversation_id: ConversationId,
}

/// Expected targets registered at send time, oldest first.
#[derive(Debug, Default)]
pub struct UpdateRouter {
    registrations: Vec<Registration>,
}

impl UpdateRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect updates for `conversation_id` to land on `message_id`.
    pub fn register(&mut self, message_id: MessageId, conversation_id: ConversationId) {
        self.registrations.retain(|r| r.message_id != message_id);
        self.registrations.push(Registration {
            message_id,
            conversation_id,
        });
    }

    pub fn release(&mut self, message_id: &MessageId) {
        self.registrations.retain(|r| r.message_id != *message_id);
    }

    /// Most recent registration for a conversation.
    pub fn expected_for(&self, conversation_id: &ConversationId) -> Option<&MessageId> {
        self.registrations
            .iter()
            .rev()
            .find(|r| r.conversation_id == *conversation_id)
            .map(|r| &r.message_id)
    }

    pub fn is_registered(&self, message_id: &MessageId) -> bool {
        self.registrations.iter().any(|r| r.message_id == *message_id)
    }

    pub fn swap_conversation(&mut self, from: &ConversationId, to: &ConversationId) {
        for registration in &mut self.registrations {
            if registration.conversation_id == *from {
                registration.conversation_id = to.clone();
            }
        }
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn route(&self, frame: &UpdateFrame, state: &ChatState) -> RouteDecision {
        if let Some(message_id) = frame.target_id.as_deref().and_then(|raw| state.resolve_id(raw)) {
            return RouteDecision::Existing {
                message_id,
                rule: RouteRule::ExplicitId,
            };
        }

        let scope = frame
            .conversation_id
            .clone()
            .or_else(|| state.active_conversation().cloned());

        if let Some(message_id) = self.registered_target(frame, scope.as_ref(), state) {
            return RouteDecision::Existing {
                message_id,
                rule: RouteRule::Registered,
            };
        }

        if let Some(conversation_id) = scope.as_ref() {
            if let Some(message) = state.latest_in_flight(conversation_id) {
                debug!(
                    message_id = %message.id,
                    conversation_id = %conversation_id,
                    "routed un-addressed frame to in-flight message"
                );
                return RouteDecision::Existing {
                    message_id: message.id.clone(),
                    rule: RouteRule::InFlight,
                };
            }
            // A frame naming an id we have never seen starts a new reply; a
            // finished one would swallow its content.
            let fresh_target = frame.target_id.is_some();
            if let Some(message) = state
                .latest_assistant(conversation_id)
                .filter(|m| !(fresh_target && m.status.is_terminal()))
            {
                debug!(
                    message_id = %message.id,
                    conversation_id = %conversation_id,
                    "routed un-addressed frame to latest assistant message"
                );
                return RouteDecision::Existing {
                    message_id: message.id.clone(),
                    rule: RouteRule::LatestAssistant,
                };
            }
        }

        RouteDecision::CreatePlaceholder {
            conversation_id: scope,
            message_id: frame.target_id.clone(),
        }
    }

    fn registered_target(
        &self,
        frame: &UpdateFrame,
        scope: Option<&ConversationId>,
        state: &ChatState,
    ) -> Option<MessageId> {
        // A real id the store has never seen is most likely the server
        // confirming a conversation we still track under a temporary marker.
        let unconfirmed = frame
            .conversation_id
            .as_ref()
            .is_some_and(|id| !id.is_temporary() && !state.has_conversation(id));

        self.registrations
            .iter()
            .rev()
            .filter(|r| {
                state
                    .message(&r.message_id)
                    .is_some_and(|m| !m.status.is_terminal())
            })
            .find(|r| match scope {
                None => true,
                Some(scope) => {
                    r.conversation_id == *scope
                        || (unconfirmed && r.conversation_id.is_temporary())
                }
            })
            .map(|r| r.message_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Action, MessageDelta};
    use crate::types::{Message, MessageStatus, Role};
    use chrono::{Duration, TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn state_with(messages: Vec<Message>) -> ChatState {
        let mut state = ChatState::new();
        for message in messages {
            state.apply(Action::AddMessage(message));
        }
        state
    }

    fn assistant(conv: &str, id: &str, secs: i64, status: MessageStatus) -> Message {
        let mut m = Message::assistant_placeholder(ConversationId::from(conv), at(secs))
            .with_id(MessageId::from(id));
        m.status = status;
        m
    }

    fn frame(target: Option<&str>, conv: Option<&str>) -> UpdateFrame {
        UpdateFrame {
            target_id: target.map(str::to_string),
            conversation_id: conv.map(ConversationId::from),
            content_fragment: Some("x".into()),
            ..Default::default()
        }
    }

    fn existing(id: &str, rule: RouteRule) -> RouteDecision {
        RouteDecision::Existing {
            message_id: MessageId::from(id),
            rule,
        }
    }

    // ── each rule in isolation ──────────────────────────────────────────

    #[test]
    fn rule1_explicit_id_wins_over_everything() {
        let state = state_with(vec![
            assistant("c", "old", 0, MessageStatus::COMPLETE),
            assistant("c", "live", 1, MessageStatus::Streaming),
        ]);
        let mut router = UpdateRouter::new();
        router.register(MessageId::from("live"), ConversationId::from("c"));

        assert_eq!(
            router.route(&frame(Some("old"), Some("c")), &state),
            existing("old", RouteRule::ExplicitId)
        );
    }

    #[test]
    fn rule1_matches_server_id_alias() {
        let mut state = state_with(vec![assistant("c", "a1", 0, MessageStatus::Streaming)]);
        let mut delta = MessageDelta::new(MessageId::from("a1"));
        delta.metadata.server_id = Some("srv-77".into());
        state.apply(Action::UpdateMessage(delta));

        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(Some("srv-77"), None), &state),
            existing("a1", RouteRule::ExplicitId)
        );
    }

    #[test]
    fn rule2_registration_beats_heuristics() {
        let state = state_with(vec![
            assistant("c", "registered", 0, MessageStatus::Processing),
            assistant("c", "newer", 5, MessageStatus::Streaming),
        ]);
        let mut router = UpdateRouter::new();
        router.register(MessageId::from("registered"), ConversationId::from("c"));

        assert_eq!(
            router.route(&frame(Some("unknown-server-id"), Some("c")), &state),
            existing("registered", RouteRule::Registered)
        );
    }

    #[test]
    fn rule2_skips_other_conversations_and_finished_targets() {
        let state = state_with(vec![
            assistant("d", "elsewhere", 0, MessageStatus::Streaming),
            assistant("c", "done", 0, MessageStatus::COMPLETE),
        ]);
        let mut router = UpdateRouter::new();
        router.register(MessageId::from("elsewhere"), ConversationId::from("d"));
        router.register(MessageId::from("done"), ConversationId::from("c"));

        // Falls through to rule 4 on the finished message.
        assert_eq!(
            router.route(&frame(None, Some("c")), &state),
            existing("done", RouteRule::LatestAssistant)
        );
    }

    #[test]
    fn rule2_temporary_registration_matches_unconfirmed_real_id() {
        let temp = ConversationId::temporary();
        let mut state = ChatState::new();
        state.apply(Action::AddMessage(
            Message::assistant_placeholder(temp.clone(), at(0)).with_id(MessageId::from("p")),
        ));
        state.apply(Action::SetActiveConversation(Some(temp.clone())));
        let mut router = UpdateRouter::new();
        router.register(MessageId::from("p"), temp);

        assert_eq!(
            router.route(&frame(None, Some("abc123")), &state),
            existing("p", RouteRule::Registered)
        );
    }

    #[test]
    fn rule3_latest_in_flight_message() {
        let state = state_with(vec![
            assistant("c", "older", 0, MessageStatus::Queued),
            assistant("c", "newer", 3, MessageStatus::Streaming),
            assistant("c", "finished", 9, MessageStatus::COMPLETE),
        ]);
        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(None, Some("c")), &state),
            existing("newer", RouteRule::InFlight)
        );
    }

    #[test]
    fn rule4_latest_assistant_message() {
        let mut state = state_with(vec![
            assistant("c", "first", 0, MessageStatus::COMPLETE),
            assistant("c", "second", 4, MessageStatus::Error),
        ]);
        state.apply(Action::AddMessage(
            Message::new(ConversationId::from("c"), Role::User, at(8))
                .with_id(MessageId::from("u")),
        ));
        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(None, Some("c")), &state),
            existing("second", RouteRule::LatestAssistant)
        );
    }

    #[test]
    fn rule4_skips_finished_reply_for_unknown_id() {
        let state = state_with(vec![assistant("c", "p", 0, MessageStatus::COMPLETE)]);
        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(Some("srv-new"), Some("c")), &state),
            RouteDecision::CreatePlaceholder {
                conversation_id: Some(ConversationId::from("c")),
                message_id: Some("srv-new".into()),
            }
        );
        // Un-addressed frames still land on it (and are then ignored as finished).
        assert_eq!(
            router.route(&frame(None, Some("c")), &state),
            existing("p", RouteRule::LatestAssistant)
        );
    }

    #[test]
    fn rule5_placeholder_when_nothing_matches() {
        let state = state_with(vec![assistant("other", "x", 0, MessageStatus::Streaming)]);
        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(Some("srv-1"), Some("c")), &state),
            RouteDecision::CreatePlaceholder {
                conversation_id: Some(ConversationId::from("c")),
                message_id: Some("srv-1".into()),
            }
        );
    }

    // ── scope ───────────────────────────────────────────────────────────

    #[test]
    fn missing_conversation_falls_back_to_active() {
        let mut state = state_with(vec![assistant("c", "live", 0, MessageStatus::Streaming)]);
        let router = UpdateRouter::new();
        assert_eq!(
            router.route(&frame(None, None), &state),
            RouteDecision::CreatePlaceholder {
                conversation_id: None,
                message_id: None,
            }
        );

        state.apply(Action::SetActiveConversation(Some(ConversationId::from("c"))));
        assert_eq!(
            router.route(&frame(None, None), &state),
            existing("live", RouteRule::InFlight)
        );
    }

    // ── registration table ──────────────────────────────────────────────

    #[test]
    fn registration_table_operations() {
        let temp = ConversationId::temporary();
        let real = ConversationId::from("abc123");
        let mut router = UpdateRouter::new();
        router.register(MessageId::from("a"), temp.clone());
        router.register(MessageId::from("b"), temp.clone());
        assert_eq!(router.expected_for(&temp), Some(&MessageId::from("b")));

        router.swap_conversation(&temp, &real);
        assert!(router.expected_for(&temp).is_none());
        assert_eq!(router.expected_for(&real), Some(&MessageId::from("b")));

        router.release(&MessageId::from("b"));
        assert_eq!(router.expected_for(&real), Some(&MessageId::from("a")));
        assert!(router.is_registered(&MessageId::from("a")));

        router.clear();
        assert!(router.is_empty());
    }
}
