//! Client error types.

use busrpc_protocol::ErrorCode;
use busrpc_transport::TransportError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] busrpc_protocol::ProtocolError),

    #[error("client transport not open")]
    NotOpen,

    #[error("client transport already open")]
    AlreadyOpen,

    #[error("broker not connected")]
    NotConnected,

    #[error("request too large: {size} bytes (limit {limit})")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("a request is already in flight on this transport")]
    RequestInFlight,

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server returned an empty reply")]
    EmptyReply,

    #[error("correlation id mismatch: expected {expected}, got {actual}")]
    CorrelationMismatch { expected: String, actual: String },

    #[error("server error: {code} - {message}")]
    ServerError {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_retryable(),
            ClientError::NotConnected => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::EmptyReply => true,
            ClientError::ServerError { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
