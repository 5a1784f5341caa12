//! Error types shared by the session, the backend and the configuration layer.

use std::time::Duration;

use thiserror::Error;

use crate::message::ConversationId;

/// Failures surfaced by the chat core. All of them are local to one
/// conversation; none poisons the session.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation {0} is not open locally")]
    UnknownConversation(ConversationId),

    #[error("a history request is already in flight for conversation {0}")]
    ConcurrentLoadRejected(ConversationId),

    #[error("conversation {0} has no older history")]
    HistoryExhausted(ConversationId),

    #[error("history fetch for conversation {conversation} failed: {source}")]
    HistoryFetchFailed {
        conversation: ConversationId,
        #[source]
        source: FetchError,
    },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid conversation reference: {0}")]
    InvalidReference(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChatError {
    /// Whether retrying the same request later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HistoryFetchFailed { .. } | Self::ConcurrentLoadRejected(_) | Self::Transport(_)
        )
    }
}

/// A failed REST call. Cloneable so it can travel inside backend events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Http(String),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Http(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed: {0}")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a configuration directory")]
    NoConfigDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server url {url}: {reason}")]
    InvalidServer { url: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
