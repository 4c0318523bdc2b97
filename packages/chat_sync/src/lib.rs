//! Chat Sync
//!
//! Client-side synchronization engine for streaming chat conversations.
//! A persistent connection delivers incremental `message_update` frames; the
//! engine routes each frame to the message it belongs to, batches content
//! fragments, and applies them to a normalized store through a reducer.
//! [`ChatClient`] layers the conversation lifecycle on top: optimistic sends,
//! temporary-to-real id swaps, single-flight loads, stop and regenerate.

pub mod api;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use api::{ConversationApi, HttpConversationApi};
pub use config::{FileConfig, SyncConfig};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::SyncError;
pub use lifecycle::ChatClient;
pub use snapshot::ChatSnapshot;
pub use transport::WsTransport;
pub use types::*;
