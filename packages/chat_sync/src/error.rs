//! Error taxonomy for the sync engine.
//!
//! Reducer actions never fail. Connection failures surface as a status flag
//! rather than an error; routing fallbacks are not errors at all.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Endpoint unreachable, handshake rejected, or timed out.
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not connected")]
    NotConnected,

    /// The create-message request did not go through.
    #[error("send failed: {0}")]
    Send(String),

    #[error("no terminal frame received within {0:?}")]
    StreamTimeout(Duration),

    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("api request failed: {0}")]
    Api(String),

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::NotConnected => "not_connected",
            Self::Send(_) => "send",
            Self::StreamTimeout(_) => "stream_timeout",
            Self::Parse(_) => "parse",
            Self::Api(_) => "api",
            Self::NoActiveConversation => "no_active_conversation",
            Self::Config(_) => "config",
        }
    }

    /// Connection-class errors are retried in the background and never block the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Api(err.to_string())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(SyncError::NotConnected.error_code(), "not_connected");
        assert_eq!(
            SyncError::StreamTimeout(Duration::from_secs(300)).error_code(),
            "stream_timeout"
        );
        assert_eq!(SyncError::Send("boom".into()).error_code(), "send");
    }

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(SyncError::Connection("refused".into()).is_transient());
        assert!(SyncError::NotConnected.is_transient());
        assert!(!SyncError::Send("500".into()).is_transient());
        assert!(!SyncError::NoActiveConversation.is_transient());
    }

    #[test]
    fn parse_errors_convert() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "parse");
        assert!(err.to_string().starts_with("malformed frame"));
    }

    // -- from_reqwest --

    #[tokio::test]
    async fn from_reqwest_connect_error_is_connection() {
        // Nothing listens on port 1
        let err = reqwest::get("http://127.0.0.1:1/api/conversations")
            .await
            .unwrap_err();
        assert!(matches!(SyncError::from_reqwest(err), SyncError::Connection(_)));
    }

    // -- from_tungstenite --

    #[test]
    fn from_tungstenite_is_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = SyncError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(err.is_transient());
        assert!(err.to_string().contains("refused"));
    }
}
