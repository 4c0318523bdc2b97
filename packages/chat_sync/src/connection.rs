//! Connection Manager: the single persistent link to the chat backend.
//!
//! Owns at most one physical connection per token. Concurrent `connect` calls
//! share the attempt already in flight. An unexpected close schedules
//! reconnection with exponential backoff until the attempt budget runs out,
//! at which point the status becomes [`ConnectionStatus::Failed`].
//!
//! The socket itself sits behind [`Transport`]; see
//! [`WsTransport`](crate::transport::WsTransport) for the WebSocket one.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::protocol::OutboundFrame;

// =============================================================================
// Transport seam
// =============================================================================

/// Opens one physical connection.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str) -> impl Future<Output = Result<TransportLink, SyncError>> + Send;
}

/// Both halves of an open connection.
pub struct TransportLink {
    /// Text frames to write. Dropping every sender closes the socket.
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { reason: Option<String> },
}

// =============================================================================
// Status & backoff
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection gave up. Only an explicit `connect` leaves this state.
    Failed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Exponential backoff: base, 2×base, 4×base, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self
            .policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// =============================================================================
// Listener registry
// =============================================================================

type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    frames: Vec<(u64, FrameHandler)>,
    status: Vec<(u64, StatusHandler)>,
}

impl Listeners {
    fn remove(&mut self, id: u64) {
        self.frames.retain(|(i, _)| *i != id);
        self.status.retain(|(i, _)| *i != id);
    }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Listeners>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Listener panics must not wedge the manager.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Manager
// =============================================================================

struct ActiveLink {
    token: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

struct PendingConnect {
    token: String,
    future: Shared<BoxFuture<'static, bool>>,
}

struct LinkState {
    status: ConnectionStatus,
    token: Option<String>,
    link: Option<ActiveLink>,
    /// Bumped by every new attempt and by `disconnect`; stale attempts compare against it.
    generation: u64,
    /// Bumped by every installed link; stale close events compare against it.
    session: u64,
    pending: Option<PendingConnect>,
    retry: Option<CancellationToken>,
    backoff: Backoff,
}

struct Inner<T> {
    transport: T,
    config: ConnectionConfig,
    metrics: Arc<SyncMetrics>,
    state: Mutex<LinkState>,
    listeners: Arc<Mutex<Listeners>>,
}

pub struct ConnectionManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: ConnectionConfig, metrics: Arc<SyncMetrics>) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                metrics,
                state: Mutex::new(LinkState {
                    status: ConnectionStatus::Disconnected,
                    token: None,
                    link: None,
                    generation: 0,
                    session: 0,
                    pending: None,
                    retry: None,
                    backoff,
                }),
                listeners: Arc::new(Mutex::new(Listeners::default())),
            }),
        }
    }

    /// Open the connection for `token`. Returns whether it is connected.
    ///
    /// Never errors: a missing token, a timeout, or a transport failure all
    /// yield `false` and leave the manager disconnected.
    pub async fn connect(&self, token: &str) -> bool {
        if token.is_empty() {
            warn!("connect called without a token");
            return false;
        }

        let (future, started) = {
            let mut st = lock(&self.inner.state);
            if let Some(link) = &st.link {
                if link.token == token {
                    return true;
                }
            }
            match &st.pending {
                Some(pending) if pending.token == token => (pending.future.clone(), false),
                _ => {
                    st.generation += 1;
                    let generation = st.generation;
                    st.token = Some(token.to_string());
                    if let Some(retry) = st.retry.take() {
                        retry.cancel();
                    }
                    let future = self
                        .inner
                        .clone()
                        .first_attempt(token.to_string(), generation)
                        .boxed()
                        .shared();
                    st.pending = Some(PendingConnect {
                        token: token.to_string(),
                        future: future.clone(),
                    });
                    (future, true)
                }
            }
        };

        if started {
            self.inner.set_status(ConnectionStatus::Connecting);
        }
        future.await
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    /// Close the connection and stop any reconnection in progress.
    pub fn disconnect(&self) {
        let (link, retry) = {
            let mut st = lock(&self.inner.state);
            st.token = None;
            st.generation += 1;
            st.pending = None;
            st.backoff.reset();
            (st.link.take(), st.retry.take())
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(link) = link {
            link.cancel.cancel();
            info!("disconnected");
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), SyncError> {
        let text = serde_json::to_string(frame)?;
        let outbound = lock(&self.inner.state)
            .link
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(SyncError::NotConnected)?;
        outbound
            .send(text)
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    /// Receive every inbound text frame.
    pub fn subscribe(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.frames.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }

    /// Receive every status transition, in order.
    pub fn on_status_change(
        &self,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.status.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }
}

impl<T: Transport> Inner<T> {
    fn endpoint_url(&self, token: &str) -> Result<String, SyncError> {
        let mut url = reqwest::Url::parse(&self.config.url)
            .map_err(|e| SyncError::Connection(format!("invalid url {}: {e}", self.config.url)))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.into())
    }

    async fn first_attempt(self: Arc<Self>, token: String, generation: u64) -> bool {
        let outcome = self.open_link(&token, generation).await;

        let current = {
            let mut st = lock(&self.state);
            if st.pending.as_ref().is_some_and(|p| p.token == token)
                && st.generation == generation
            {
                st.pending = None;
            }
            st.generation == generation
        };

        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "connection failed");
                if current {
                    self.set_status(ConnectionStatus::Disconnected);
                }
                false
            }
        }
    }

    async fn open_link(self: &Arc<Self>, token: &str, generation: u64) -> Result<(), SyncError> {
        let url = self.endpoint_url(token)?;
        let timeout = self.config.connect_timeout;
        let link = tokio::time::timeout(timeout, self.transport.open(&url))
            .await
            .map_err(|_| SyncError::Connection(format!("timed out after {timeout:?}")))??;
        self.install(token, link, generation)
    }

    fn install(
        self: &Arc<Self>,
        token: &str,
        link: TransportLink,
        generation: u64,
    ) -> Result<(), SyncError> {
        let cancel = CancellationToken::new();
        let session = {
            let mut st = lock(&self.state);
            if st.generation != generation {
                return Err(SyncError::Connection("superseded by a newer attempt".into()));
            }
            if let Some(old) = st.link.take() {
                old.cancel.cancel();
            }
            st.session += 1;
            st.backoff.reset();
            st.link = Some(ActiveLink {
                token: token.to_string(),
                outbound: link.outbound.clone(),
                cancel: cancel.clone(),
            });
            st.session
        };

        self.metrics.connection_opened();
        info!(session, "connected");

        tokio::spawn(self.clone().read_loop(link.inbound, session, cancel.clone()));
        tokio::spawn(heartbeat(
            link.outbound,
            self.config.heartbeat_interval,
            cancel,
        ));

        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<TransportEvent>,
        session: u64,
        cancel: CancellationToken,
    ) {
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => self.dispatch(&text),
                    Some(TransportEvent::Closed { reason }) => break reason,
                    None => break None,
                },
            }
        };
        self.handle_close(session, reason);
    }

    fn dispatch(&self, text: &str) {
        let handlers: Vec<FrameHandler> = lock(&self.listeners)
            .frames
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(text);
        }
    }

    fn handle_close(self: &Arc<Self>, session: u64, reason: Option<String>) {
        let token = {
            let mut st = lock(&self.state);
            if st.session != session || st.link.is_none() {
                return;
            }
            if let Some(link) = st.link.take() {
                link.cancel.cancel();
            }
            st.token.clone()
        };

        let Some(token) = token else {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };

        info!(reason = ?reason, "connection lost, will attempt reconnection");
        let retry = CancellationToken::new();
        {
            let mut st = lock(&self.state);
            if let Some(previous) = st.retry.replace(retry.clone()) {
                previous.cancel();
            }
        }
        tokio::spawn(self.clone().reconnect_loop(token, retry));
    }

    async fn reconnect_loop(self: Arc<Self>, token: String, retry: CancellationToken) {
        loop {
            let next = {
                let mut st = lock(&self.state);
                // An explicit connect or disconnect now owns the backoff and status.
                if retry.is_cancelled() || st.link.is_some() {
                    return;
                }
                st.backoff.next_delay().map(|d| (d, st.backoff.attempt()))
            };
            let Some((delay, attempt)) = next else {
                warn!("reconnection attempts exhausted");
                self.set_status(ConnectionStatus::Failed);
                return;
            };
            self.set_status(ConnectionStatus::Reconnecting { attempt });

            tokio::select! {
                _ = retry.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let generation = {
                let mut st = lock(&self.state);
                if retry.is_cancelled()
                    || st.token.as_deref() != Some(token.as_str())
                    || st.link.is_some()
                {
                    return;
                }
                st.generation += 1;
                st.generation
            };

            self.metrics.reconnect_attempted();
            info!(attempt, "reconnection attempt");
            match self.open_link(&token, generation).await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return;
                }
                Err(e) if retry.is_cancelled() => {
                    debug!(attempt, error = %e, "reconnect attempt superseded");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = {
            let mut st = lock(&self.state);
            if st.status == next {
                false
            } else {
                st.status = next;
                true
            }
        };
        if !changed {
            return;
        }
        debug!(status = ?next, "connection status changed");
        let handlers: Vec<StatusHandler> = lock(&self.listeners)
            .status
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(next);
        }
    }
}

/// Send a ping on a fixed interval until cancelled. Missing pongs are not
/// treated as failure; the transport's close event is authoritative.
async fn heartbeat(outbound: mpsc::Sender<String>, period: Duration, cancel: CancellationToken) {
    let ping = match serde_json::to_string(&OutboundFrame::Ping) {
        Ok(ping) => ping,
        Err(e) => {
            warn!(error = %e, "failed to encode heartbeat");
            return;
        }
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if outbound.send(ping.clone()).await.is_err() {
                    break;
                }
            }
        }
    }
}
