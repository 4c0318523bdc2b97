//! Sync metrics for diagnosis
//!
//! Counters for the recoverable paths (routing fallbacks, dropped frames,
//! reconnects, stalled generations) that are not errors but are worth seeing.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::router::RouteRule;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Frame metrics
    /// Text frames received from the connection
    pub frames_received: AtomicU64,
    /// Frames dropped as malformed
    pub frames_malformed: AtomicU64,
    /// Frames addressed to a message already in a terminal state
    pub frames_ignored_terminal: AtomicU64,
    /// Frames that could not be attached to any conversation
    pub frames_unroutable: AtomicU64,

    // Routing metrics
    pub routed_explicit: AtomicU64,
    pub routed_registered: AtomicU64,
    /// Heuristic fallback: latest in-flight message of the conversation
    pub routed_in_flight: AtomicU64,
    /// Heuristic fallback: latest assistant message of the conversation
    pub routed_latest_assistant: AtomicU64,
    pub placeholders_created: AtomicU64,

    // Buffer metrics
    pub flushes: AtomicU64,

    // Connection metrics
    pub connections_opened: AtomicU64,
    pub reconnect_attempts: AtomicU64,

    // Liveness
    pub stalled_generations: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_ignored_terminal(&self) {
        self.frames_ignored_terminal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_unroutable(&self) {
        self.frames_unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route(&self, rule: RouteRule) {
        let counter = match rule {
            RouteRule::ExplicitId => &self.routed_explicit,
            RouteRule::Registered => &self.routed_registered,
            RouteRule::InFlight => &self.routed_in_flight,
            RouteRule::LatestAssistant => &self.routed_latest_assistant,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn placeholder_created(&self) {
        self.placeholders_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_stalled(&self) {
        self.stalled_generations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_ignored_terminal: self.frames_ignored_terminal.load(Ordering::Relaxed),
            frames_unroutable: self.frames_unroutable.load(Ordering::Relaxed),
            routed_explicit: self.routed_explicit.load(Ordering::Relaxed),
            routed_registered: self.routed_registered.load(Ordering::Relaxed),
            routed_in_flight: self.routed_in_flight.load(Ordering::Relaxed),
            routed_latest_assistant: self.routed_latest_assistant.load(Ordering::Relaxed),
            placeholders_created: self.placeholders_created.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            stalled_generations: self.stalled_generations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters (for serialization/logging)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_ignored_terminal: u64,
    pub frames_unroutable: u64,
    pub routed_explicit: u64,
    pub routed_registered: u64,
    pub routed_in_flight: u64,
    pub routed_latest_assistant: u64,
    pub placeholders_created: u64,
    pub flushes: u64,
    pub connections_opened: u64,
    pub reconnect_attempts: u64,
    pub stalled_generations: u64,
}

impl MetricsSnapshot {
    /// Frames resolved by a heuristic rather than an id or registration.
    pub fn heuristic_routes(&self) -> u64 {
        self.routed_in_flight + self.routed_latest_assistant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_counters_are_separate() {
        let m = SyncMetrics::new();
        m.record_route(RouteRule::ExplicitId);
        m.record_route(RouteRule::InFlight);
        m.record_route(RouteRule::LatestAssistant);
        m.record_route(RouteRule::LatestAssistant);

        let snap = m.snapshot();
        assert_eq!(snap.routed_explicit, 1);
        assert_eq!(snap.routed_registered, 0);
        assert_eq!(snap.heuristic_routes(), 3);
    }
}
