use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::api::{ConversationApi, ConversationDetail};
use crate::connection::{Transport, TransportEvent, TransportLink};
use crate::error::SyncError;
use crate::protocol::{SendRequest, SendResponse};
use crate::types::{Conversation, ConversationId, Message};

/// Conversation id the fake backend assigns to new conversations.
pub const NEW_CONVERSATION_ID: &str = "abc123";

// =============================================================================
// Fake REST backend
// =============================================================================

#[derive(Default)]
struct FakeApiInner {
    requests: Mutex<Vec<SendRequest>>,
    fail_send: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    conversations: Mutex<Vec<Conversation>>,
    details: Mutex<HashMap<ConversationId, (ConversationDetail, Duration)>>,
    deleted: Mutex<Vec<ConversationId>>,
    renamed: Mutex<Vec<(ConversationId, String)>>,
}

/// In-memory stand-in for the conversation API. Clones share state, so a
/// test can keep one handle while the client owns another.
#[derive(Clone, Default)]
pub struct FakeApi {
    inner: Arc<FakeApiInner>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<SendRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.inner.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Hold create-message responses for `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.inner.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.inner.conversations.lock().unwrap() = conversations;
    }

    /// Serve `messages` for `id` after `delay`.
    pub fn put_conversation(&self, id: &str, messages: Vec<Message>, delay: Duration) {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::from(id),
            title: format!("Conversation {id}"),
            created_at: now,
            updated_at: now,
        };
        self.inner.details.lock().unwrap().insert(
            conversation.id.clone(),
            (
                ConversationDetail {
                    conversation,
                    messages,
                },
                delay,
            ),
        );
    }

    pub fn deleted(&self) -> Vec<ConversationId> {
        self.inner.deleted.lock().unwrap().clone()
    }

    pub fn renamed(&self) -> Vec<(ConversationId, String)> {
        self.inner.renamed.lock().unwrap().clone()
    }
}

impl ConversationApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        Ok(self.inner.conversations.lock().unwrap().clone())
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail, SyncError> {
        let entry = self.inner.details.lock().unwrap().get(id).cloned();
        let Some((detail, delay)) = entry else {
            return Err(SyncError::Api(format!("conversation {id} not found")));
        };
        tokio::time::sleep(delay).await;
        Ok(detail)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), SyncError> {
        self.inner.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn rename_conversation(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<Conversation, SyncError> {
        self.inner
            .renamed
            .lock()
            .unwrap()
            .push((id.clone(), title.to_string()));
        let now = Utc::now();
        Ok(Conversation {
            id: id.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn create_message(&self, request: &SendRequest) -> Result<SendResponse, SyncError> {
        let count = {
            let mut requests = self.inner.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let delay = *self.inner.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_send.load(Ordering::SeqCst) {
            return Err(SyncError::Send("server returned 500".into()));
        }
        Ok(SendResponse {
            conversation_id: request
                .conversation_id
                .clone()
                .unwrap_or_else(|| NEW_CONVERSATION_ID.to_string()),
            message_id: Some(format!("srv-{count}")),
        })
    }
}

// =============================================================================
// Channel transport
// =============================================================================

/// The far end of a [`ChannelTransport`] link.
pub struct Peer {
    /// Frames the client wrote.
    pub outbound: mpsc::Receiver<String>,
    /// Push frames (or a close) to the client.
    pub inbound: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct ChannelTransportInner {
    opens: AtomicUsize,
    fail: AtomicBool,
    hang: AtomicBool,
    urls: Mutex<Vec<String>>,
    peers: Mutex<Vec<Peer>>,
}

/// Transport backed by in-process channels.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    inner: Arc<ChannelTransportInner>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Make `open` never resolve, to exercise the connect timeout.
    pub fn set_hang(&self, hang: bool) {
        self.inner.hang.store(hang, Ordering::SeqCst);
    }

    pub fn last_url(&self) -> Option<String> {
        self.inner.urls.lock().unwrap().last().cloned()
    }

    /// The most recently opened link's far end.
    pub fn take_peer(&self) -> Option<Peer> {
        self.inner.peers.lock().unwrap().pop()
    }
}

impl Transport for ChannelTransport {
    fn open(&self, url: &str) -> impl Future<Output = Result<TransportLink, SyncError>> + Send {
        let inner = self.inner.clone();
        let url = url.to_string();
        async move {
            inner.opens.fetch_add(1, Ordering::SeqCst);
            inner.urls.lock().unwrap().push(url);
            // Let concurrent callers pile up on the same attempt.
            tokio::task::yield_now().await;
            if inner.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if inner.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Connection("connection refused".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            inner.peers.lock().unwrap().push(Peer {
                outbound: out_rx,
                inbound: in_tx,
            });
            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
