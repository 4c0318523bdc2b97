//! Conversation Lifecycle Manager
//!
//! [`ChatClient`] is the surface the UI talks to. It composes the engine, the
//! persistent connection and the REST API:
//!
//! - `send` adds the user message and an assistant placeholder immediately,
//!   then posts the request. A brand new conversation lives under a
//!   temporary marker until the server assigns its id; the swap happens in a
//!   single reducer action.
//! - `load` is single-flight. A newer load cancels the older one, and a
//!   response that arrives for a superseded load is discarded.
//! - The event loop feeds inbound frames to the engine and wakes up for
//!   buffer deadlines and stall checks.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ConversationApi;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, Subscription, Transport};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::protocol::{OutboundFrame, SendRequest};
use crate::snapshot::ChatSnapshot;
use crate::store::{Action, MessageDelta, message_order};
use crate::types::{
    Conversation, ConversationId, FileAttachment, Message, MessageId, MessageStatus, Role,
};

const PENDING_CONVERSATION: &str = "conversation is still being created";

#[derive(Default)]
struct LoadSlot {
    generation: u64,
    cancel: Option<CancellationToken>,
}

pub struct ChatClient<A, T> {
    engine: Arc<Mutex<SyncEngine>>,
    api: Arc<A>,
    connection: ConnectionManager<T>,
    snapshot_tx: Arc<watch::Sender<ChatSnapshot>>,
    load: Arc<Mutex<LoadSlot>>,
    metrics: Arc<SyncMetrics>,
    _status: Arc<Subscription>,
}

impl<A, T> Clone for ChatClient<A, T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            api: self.api.clone(),
            connection: self.connection.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
            load: self.load.clone(),
            metrics: self.metrics.clone(),
            _status: self._status.clone(),
        }
    }
}

impl<A: ConversationApi, T: Transport> ChatClient<A, T> {
    pub fn new(api: A, transport: T, config: &SyncConfig) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let engine = SyncEngine::new(config, metrics.clone());
        let connection =
            ConnectionManager::new(transport, config.connection.clone(), metrics.clone());

        let (snapshot_tx, _) = watch::channel(ChatSnapshot::default());
        let snapshot_tx = Arc::new(snapshot_tx);
        let status_tx = snapshot_tx.clone();
        let status = connection.on_status_change(move |status| {
            status_tx.send_if_modified(|snap| {
                let changed = snap.connection != status;
                snap.connection = status;
                changed
            });
        });

        Self {
            engine: Arc::new(Mutex::new(engine)),
            api: Arc::new(api),
            connection,
            snapshot_tx,
            load: Arc::new(Mutex::new(LoadSlot::default())),
            metrics,
            _status: Arc::new(status),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self, engine: &SyncEngine) {
        let next = ChatSnapshot::capture(engine.state(), self.connection.status());
        self.snapshot_tx.send_if_modified(|snap| {
            if *snap == next {
                false
            } else {
                *snap = next;
                true
            }
        });
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub async fn connect(&self, token: &str) -> bool {
        self.connection.connect(token).await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Clear the active conversation; the next send starts a new one.
    pub async fn start_new(&self) {
        let mut engine = self.engine.lock().await;
        engine.dispatch(Action::SetActiveConversation(None));
        self.publish(&engine);
        debug!("starting new conversation");
    }

    pub async fn refresh_conversations(&self) -> Result<usize, SyncError> {
        let conversations = self.api.list_conversations().await?;
        let count = conversations.len();
        let mut engine = self.engine.lock().await;
        engine.dispatch(Action::SetConversations(conversations));
        self.publish(&engine);
        Ok(count)
    }

    /// Load a conversation's history and make it active.
    ///
    /// Returns `Ok(false)` when a newer load superseded this one; nothing is applied then.
    pub async fn load(&self, conversation_id: &ConversationId) -> Result<bool, SyncError> {
        let (generation, cancel) = {
            let mut slot = self.load.lock().await;
            if let Some(previous) = slot.cancel.take() {
                previous.cancel();
            }
            slot.generation += 1;
            let cancel = CancellationToken::new();
            slot.cancel = Some(cancel.clone());
            (slot.generation, cancel)
        };

        {
            let mut engine = self.engine.lock().await;
            engine.dispatch(Action::SetActiveConversation(Some(conversation_id.clone())));
            self.publish(&engine);
        }
        info!(conversation_id = %conversation_id, "loading conversation");

        let detail = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conversation_id = %conversation_id, "load superseded");
                return Ok(false);
            }
            result = self.api.get_conversation(conversation_id) => result?,
        };

        let mut slot = self.load.lock().await;
        if slot.generation != generation {
            debug!(conversation_id = %conversation_id, "discarding stale load");
            return Ok(false);
        }
        slot.cancel = None;

        let mut engine = self.engine.lock().await;
        if engine.state().conversation(conversation_id).is_none() {
            engine.dispatch(Action::AddConversation(detail.conversation));
        }
        let count = detail.messages.len();
        engine.replace_conversation_messages(conversation_id, detail.messages, Instant::now());
        engine.dispatch(Action::SetActiveConversation(Some(conversation_id.clone())));
        self.publish(&engine);
        info!(conversation_id = %conversation_id, messages = count, "conversation loaded");
        Ok(true)
    }

    pub async fn delete(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        if !conversation_id.is_temporary() {
            self.api.delete_conversation(conversation_id).await?;
        }
        let mut engine = self.engine.lock().await;
        engine.remove_conversation(conversation_id);
        self.publish(&engine);
        info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }

    /// Rename the active conversation.
    pub async fn rename(&self, title: &str) -> Result<(), SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::Api("title must not be empty".into()));
        }
        let conversation_id = self
            .engine
            .lock()
            .await
            .state()
            .active_conversation()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;

        // An unconfirmed conversation only exists locally.
        let title = if conversation_id.is_temporary() {
            title.to_string()
        } else {
            self.api.rename_conversation(&conversation_id, title).await?.title
        };

        let mut engine = self.engine.lock().await;
        engine.dispatch(Action::RenameConversation {
            id: conversation_id,
            title,
        });
        self.publish(&engine);
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a user message. Returns the id of the assistant placeholder.
    pub async fn send(
        &self,
        content: &str,
        file: Option<FileAttachment>,
    ) -> Result<MessageId, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Send("message is empty".into()));
        }

        let now = Utc::now();
        let (conversation_id, user_id, placeholder_id) = {
            let mut engine = self.engine.lock().await;
            let conversation_id = match engine.state().active_conversation().cloned() {
                Some(id) if id.is_temporary() => {
                    return Err(SyncError::Send(PENDING_CONVERSATION.into()));
                }
                Some(id) => id,
                None => {
                    let id = ConversationId::temporary();
                    engine.dispatch(Action::AddConversation(Conversation::provisional(
                        id.clone(),
                        content,
                        now,
                    )));
                    engine.dispatch(Action::SetActiveConversation(Some(id.clone())));
                    id
                }
            };

            let user = Message::user(conversation_id.clone(), content, now)
                .with_attachment(file.clone());
            let placeholder = Message::assistant_placeholder(conversation_id.clone(), now);
            let ids = (user.id.clone(), placeholder.id.clone());
            engine.dispatch(Action::AddMessage(user));
            engine.dispatch(Action::AddMessage(placeholder));
            engine.begin_generation(&ids.1, conversation_id.clone(), Instant::now());
            self.publish(&engine);
            (conversation_id, ids.0, ids.1)
        };

        info!(conversation_id = %conversation_id, "sending message");
        self.submit(&conversation_id, content, file, Some(user_id), placeholder_id)
            .await
    }

    /// Drop the reply to the last user message and ask for a new one.
    pub async fn regenerate_last(&self) -> Result<MessageId, SyncError> {
        let (conversation_id, last_user, placeholder_id) = {
            let mut engine = self.engine.lock().await;
            let conversation_id = engine
                .state()
                .active_conversation()
                .cloned()
                .ok_or(SyncError::NoActiveConversation)?;
            if conversation_id.is_temporary() {
                return Err(SyncError::Send(PENDING_CONVERSATION.into()));
            }
            let last_user = engine
                .state()
                .last_user_message(&conversation_id)
                .cloned()
                .ok_or_else(|| SyncError::Send("no user message to regenerate".into()))?;

            let trailing: Vec<MessageId> = engine
                .state()
                .messages_for(&conversation_id)
                .into_iter()
                .filter(|m| m.role == Role::Assistant && message_order(m, &last_user).is_gt())
                .map(|m| m.id.clone())
                .collect();
            for id in &trailing {
                engine.remove_message(id);
            }

            let placeholder = Message::assistant_placeholder(conversation_id.clone(), Utc::now());
            let placeholder_id = placeholder.id.clone();
            engine.dispatch(Action::AddMessage(placeholder));
            engine.begin_generation(&placeholder_id, conversation_id.clone(), Instant::now());
            self.publish(&engine);
            debug!(replaced = trailing.len(), "regenerating last reply");
            (conversation_id, last_user, placeholder_id)
        };

        self.submit(
            &conversation_id,
            &last_user.content,
            last_user.metadata.attachment.clone(),
            None,
            placeholder_id,
        )
        .await
    }

    async fn submit(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        file: Option<FileAttachment>,
        user_id: Option<MessageId>,
        placeholder_id: MessageId,
    ) -> Result<MessageId, SyncError> {
        let request = SendRequest {
            content: content.to_string(),
            conversation_id: (!conversation_id.is_temporary()).then(|| conversation_id.to_string()),
            file,
            assistant_message_id: placeholder_id.to_string(),
        };

        match self.api.create_message(&request).await {
            Ok(response) => {
                let mut engine = self.engine.lock().await;
                if let Some(user_id) = user_id {
                    engine.dispatch(Action::UpdateMessage(
                        MessageDelta::new(user_id).status(MessageStatus::COMPLETE),
                    ));
                }
                if let Some(server_id) = response.message_id {
                    let mut delta = MessageDelta::new(placeholder_id.clone());
                    delta.metadata.server_id = Some(server_id);
                    engine.dispatch(Action::UpdateMessage(delta));
                }
                let confirmed = ConversationId::from(response.conversation_id);
                // A frame may already have carried the real id; then this is a no-op.
                if conversation_id.is_temporary()
                    && engine.state().has_conversation(conversation_id)
                {
                    engine.swap_conversation(conversation_id, &confirmed);
                }
                self.publish(&engine);
                Ok(placeholder_id)
            }
            Err(e) => {
                let detail = match e {
                    SyncError::Send(detail) => detail,
                    other => other.to_string(),
                };
                warn!(conversation_id = %conversation_id, error = %detail, "send failed");
                let mut engine = self.engine.lock().await;
                let failed: Vec<MessageId> = user_id.into_iter().chain([placeholder_id]).collect();
                engine.fail_generation(&failed, &detail);
                self.publish(&engine);
                Err(SyncError::Send(detail))
            }
        }
    }

    /// Stop every running generation. Content received so far is kept.
    pub async fn stop(&self) -> Vec<MessageId> {
        let (stopped, conversations) = {
            let mut engine = self.engine.lock().await;
            let stopped = engine.stop_all();
            self.publish(&engine);
            let conversations: BTreeSet<String> = stopped
                .iter()
                .filter_map(|id| engine.state().message(id))
                .map(|m| &m.conversation_id)
                .filter(|id| !id.is_temporary())
                .map(ConversationId::to_string)
                .collect();
            (stopped, conversations)
        };
        if stopped.is_empty() {
            return stopped;
        }

        // Best effort; the local state is already final.
        let frames: Vec<OutboundFrame> = if conversations.is_empty() {
            vec![OutboundFrame::StopGeneration {
                conversation_id: None,
            }]
        } else {
            conversations
                .into_iter()
                .map(|id| OutboundFrame::StopGeneration {
                    conversation_id: Some(id),
                })
                .collect()
        };
        for frame in &frames {
            if let Err(e) = self.connection.send(frame).await {
                debug!(error = %e, "stop frame not delivered");
            }
        }
        stopped
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    /// Handle one raw frame from the connection.
    pub async fn ingest(&self, text: &str) -> Option<MessageId> {
        let mut engine = self.engine.lock().await;
        let target = engine.handle_text(text, Instant::now());
        self.publish(&engine);
        target
    }

    /// Apply due buffer flushes and force-complete stalled generations.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut engine = self.engine.lock().await;
        engine.flush_due(now);
        engine.sweep_stalled(now);
        self.publish(&engine);
    }

    /// Flush whatever is still buffered and forget pending work.
    pub async fn dispose(&self) {
        let mut engine = self.engine.lock().await;
        engine.dispose();
        self.publish(&engine);
    }

    /// Drive the client until `cancel` fires: inbound frames, buffer deadlines, stall checks.
    pub fn spawn_event_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        let subscription = self.connection.subscribe(move |text| {
            let _ = frames_tx.send(text.to_string());
        });
        // Any state change may add a deadline (a new generation, a buffered batch).
        let mut changes = self.snapshot_tx.subscribe();
        let client = self.clone();

        tokio::spawn(async move {
            let _subscription = subscription;
            loop {
                let deadline = client.engine.lock().await.next_deadline();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames_rx.recv() => match frame {
                        Some(text) => {
                            client.ingest(&text).await;
                        }
                        None => break,
                    },
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until(deadline) => client.tick().await,
                }
            }
            client.dispose().await;
            info!("event loop stopped");
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
