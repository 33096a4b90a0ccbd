//! Error types for the sync layer.

use thiserror::Error;

/// Errors that can occur while talking to the Verdant backend.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Authentication was rejected by the REST API or the push channel.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entity not found.
    #[error("not found: {resource}/{id}")]
    NotFound { resource: String, id: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Non-success response from the REST API.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The identity handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A topic string could not be parsed.
    #[error(transparent)]
    InvalidTopic(#[from] crate::topic::TopicError),

    /// The connection manager was shut down.
    #[error("connection closed")]
    Closed,

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Whether this error came from the transport or a deadline rather than
    /// from the server rejecting the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::WebSocket(_) | SyncError::Timeout(_) | SyncError::Handshake(_)
        )
    }
}
