//! Sync engine: router, buffer and store wired together.
//!
//! Every inbound frame is handled to completion in one call: routed, buffered,
//! and applied to the store. Time is passed in explicitly so the whole engine
//! runs deterministically under test.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::{BufferedFlush, ContentBuffer};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::protocol::{UpdateFrame, parse_frame};
use crate::router::{RouteDecision, UpdateRouter};
use crate::store::{Action, ChatState, MessageDelta, PlaceholderSpec};
use crate::types::{ConversationId, Message, MessageId, MessageStatus, Role};

pub struct SyncEngine {
    state: ChatState,
    router: UpdateRouter,
    buffer: ContentBuffer,
    /// Last time each live generation showed any sign of progress.
    activity: HashMap<MessageId, Instant>,
    stall_timeout: Option<Duration>,
    metrics: Arc<SyncMetrics>,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            state: ChatState::new(),
            router: UpdateRouter::new(),
            buffer: ContentBuffer::new(&config.buffer),
            activity: HashMap::new(),
            stall_timeout: config.generation.stall_timeout,
            metrics,
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn router(&self) -> &UpdateRouter {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn dispatch(&mut self, action: Action) {
        self.state.apply(action);
    }

    /// Expect the stream for `conversation_id` to land on `placeholder`.
    pub fn begin_generation(
        &mut self,
        placeholder: &MessageId,
        conversation_id: ConversationId,
        now: Instant,
    ) {
        self.router.register(placeholder.clone(), conversation_id);
        self.activity.insert(placeholder.clone(), now);
    }

    /// Parse and handle one raw text frame. Malformed frames are dropped.
    pub fn handle_text(&mut self, text: &str, now: Instant) -> Option<MessageId> {
        self.metrics.frame_received();
        match parse_frame(text) {
            Ok(Some(frame)) => self.handle_frame(frame, now),
            Ok(None) => None,
            Err(e) => {
                self.metrics.frame_malformed();
                warn!(error = %e, "dropping malformed frame");
                None
            }
        }
    }

    /// Route, buffer and apply one update frame. Returns the message it landed on.
    pub fn handle_frame(&mut self, frame: UpdateFrame, now: Instant) -> Option<MessageId> {
        let message_id = match self.router.route(&frame, &self.state) {
            RouteDecision::Existing { message_id, rule } => {
                self.metrics.record_route(rule);
                message_id
            }
            RouteDecision::CreatePlaceholder {
                conversation_id,
                message_id,
            } => {
                let Some(conversation_id) = conversation_id else {
                    self.metrics.frame_unroutable();
                    warn!(
                        target_id = ?frame.target_id,
                        "dropping frame with no conversation to attach to"
                    );
                    return None;
                };
                let id = message_id.map(MessageId::from).unwrap_or_default();
                self.state.apply(Action::UpdateMessage(
                    MessageDelta::new(id.clone()).or_create(PlaceholderSpec {
                        conversation_id: conversation_id.clone(),
                        role: Role::Assistant,
                        created_at: Utc::now(),
                    }),
                ));
                self.metrics.placeholder_created();
                debug!(
                    message_id = %id,
                    conversation_id = %conversation_id,
                    "created placeholder for unmatched frame"
                );
                id
            }
        };

        self.confirm_conversation(&message_id, &frame);

        let message = self.state.message(&message_id)?;
        if message.status.is_terminal() {
            self.metrics.frame_ignored_terminal();
            debug!(message_id = %message_id, "ignoring frame for finished message");
            return None;
        }
        let server_id = frame
            .target_id
            .clone()
            .filter(|raw| !message.answers_to(raw));

        self.activity.insert(message_id.clone(), now);

        if let Some(text) = frame.content_fragment.as_deref() {
            if let Some(flush) =
                self.buffer
                    .add_fragment(&message_id, frame.section, text, frame.update_mode, now)
            {
                self.apply_flush(flush);
            }
        }

        let live_status = frame.status.filter(|s| !s.is_terminal());
        if live_status.is_some() || frame.model.is_some() || server_id.is_some() {
            let mut delta = MessageDelta::new(message_id.clone());
            delta.status = live_status;
            delta.metadata.model = frame.model.clone();
            delta.metadata.server_id = server_id;
            self.state.apply(Action::UpdateMessage(delta));
        }

        if frame.is_terminal() {
            self.finish(&message_id, &frame);
        }
        Some(message_id)
    }

    /// A frame carrying a real conversation id for a message still tagged
    /// with a temporary marker completes the swap early.
    fn confirm_conversation(&mut self, message_id: &MessageId, frame: &UpdateFrame) {
        let Some(real) = frame.conversation_id.as_ref().filter(|c| !c.is_temporary()) else {
            return;
        };
        let current = match self.state.message(message_id) {
            Some(m) if m.conversation_id.is_temporary() => m.conversation_id.clone(),
            _ => return,
        };
        self.swap_conversation(&current, real);
    }

    fn finish(&mut self, message_id: &MessageId, frame: &UpdateFrame) {
        // Remainder first: no fragment may be lost behind the terminal status.
        self.flush_message(message_id);

        let mut delta = MessageDelta::new(message_id.clone());
        if let Some(error) = frame.error.as_deref() {
            delta = delta.failed(error);
        } else {
            delta.status = frame.status.filter(|s| s.is_terminal());
        }
        delta.is_complete = frame.is_complete;
        self.state.apply(Action::UpdateMessage(delta));

        self.router.release(message_id);
        self.activity.remove(message_id);
        info!(
            message_id = %message_id,
            status = ?self.state.message(message_id).map(|m| m.status),
            "generation finished"
        );
    }

    fn apply_flush(&mut self, flush: BufferedFlush) {
        self.state.apply(Action::UpdateMessage(
            MessageDelta::new(flush.message_id).content(flush.content, flush.mode, flush.section),
        ));
        self.metrics.flushed();
    }

    /// Apply every buffered batch whose deadline passed. Returns whether anything changed.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        let due = self.buffer.flush_due(now);
        let changed = !due.is_empty();
        for flush in due {
            self.apply_flush(flush);
        }
        changed
    }

    pub fn flush_message(&mut self, message_id: &MessageId) {
        for flush in self.buffer.flush(message_id) {
            self.apply_flush(flush);
        }
    }

    /// Force-complete generations that went quiet for longer than the stall timeout.
    pub fn sweep_stalled(&mut self, now: Instant) -> Vec<MessageId> {
        let Some(timeout) = self.stall_timeout else {
            return Vec::new();
        };
        let stalled: Vec<MessageId> = self
            .activity
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let annotation = SyncError::StreamTimeout(timeout).to_string();
        for id in &stalled {
            self.flush_message(id);
            let mut delta = MessageDelta::new(id.clone()).complete();
            delta.metadata.error = Some(annotation.clone());
            self.state.apply(Action::UpdateMessage(delta));
            self.router.release(id);
            self.activity.remove(id);
            self.metrics.generation_stalled();
            warn!(message_id = %id, timeout = ?timeout, "generation stalled, marked complete");
        }
        stalled
    }

    /// Mark every live generation stopped by the user.
    pub fn stop_all(&mut self) -> Vec<MessageId> {
        let live = self.state.generating();
        for id in &live {
            self.flush_message(id);
            self.state.apply(Action::UpdateMessage(
                MessageDelta::new(id.clone()).status(MessageStatus::STOPPED),
            ));
            self.router.release(id);
            self.activity.remove(id);
        }
        if !live.is_empty() {
            info!(count = live.len(), "stopped generation");
        }
        live
    }

    /// Mark messages failed, e.g. when the send request itself did not go through.
    pub fn fail_generation(&mut self, ids: &[MessageId], detail: &str) {
        for id in ids {
            self.flush_message(id);
            self.state.apply(Action::UpdateMessage(MessageDelta::new(id.clone()).failed(detail)));
            self.router.release(id);
            self.activity.remove(id);
        }
    }

    /// Retag a temporary conversation everywhere: store and registrations.
    pub fn swap_conversation(&mut self, from: &ConversationId, to: &ConversationId) {
        if from == to {
            return;
        }
        self.state.apply(Action::SwapConversationId {
            from: from.clone(),
            to: to.clone(),
        });
        self.router.swap_conversation(from, to);
        info!(from = %from, to = %to, "conversation confirmed");
    }

    /// Replace a conversation's messages with persisted history, keeping any
    /// local message that is still being produced.
    ///
    /// Unfinished persisted replies start their stall clock at `now`.
    pub fn replace_conversation_messages(
        &mut self,
        conversation_id: &ConversationId,
        persisted: Vec<Message>,
        now: Instant,
    ) {
        let preserved: Vec<Message> = self
            .state
            .messages_for(conversation_id)
            .into_iter()
            .filter(|m| m.status.is_in_flight())
            .cloned()
            .collect();

        let mut messages: Vec<Message> = persisted
            .into_iter()
            .filter(|p| !preserved.iter().any(|local| local.answers_to(p.id.as_str())))
            .collect();
        if !preserved.is_empty() {
            debug!(
                conversation_id = %conversation_id,
                count = preserved.len(),
                "keeping in-flight messages across reload"
            );
        }
        messages.extend(preserved);

        self.state.apply(Action::SetMessages {
            conversation_id: conversation_id.clone(),
            messages,
        });
        let state = &self.state;
        self.activity.retain(|id, _| state.message(id).is_some());
        for message in state.messages_for(conversation_id) {
            if message.role == Role::Assistant && !message.status.is_terminal() {
                self.activity.entry(message.id.clone()).or_insert(now);
            }
        }
    }

    pub fn remove_message(&mut self, message_id: &MessageId) {
        self.buffer.discard(message_id);
        self.router.release(message_id);
        self.activity.remove(message_id);
        self.state.apply(Action::RemoveMessage(message_id.clone()));
    }

    /// Drop a conversation and forget its generations.
    pub fn remove_conversation(&mut self, conversation_id: &ConversationId) {
        for message in self.state.messages_for(conversation_id) {
            self.buffer.discard(&message.id);
            self.router.release(&message.id);
            self.activity.remove(&message.id);
        }
        self.state
            .apply(Action::RemoveConversation(conversation_id.clone()));
    }

    /// Earliest moment the engine needs to run again: a buffer deadline or a stall check.
    pub fn next_deadline(&self) -> Option<Instant> {
        let stall = self.stall_timeout.and_then(|timeout| {
            self.activity
                .values()
                .min()
                .map(|earliest| *earliest + timeout)
        });
        match (self.buffer.next_deadline(), stall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Flush everything still buffered and drop all timers and registrations.
    pub fn dispose(&mut self) {
        for flush in self.buffer.dispose() {
            self.apply_flush(flush);
        }
        self.activity.clear();
        self.router.clear();
    }
}
