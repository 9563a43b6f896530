//! Transport error types.

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not open")]
    NotOpen,

    #[error("transport already open")]
    AlreadyOpen,

    #[error("transport already subscribed")]
    AlreadySubscribed,

    #[error("invalid topic: topic must not be empty")]
    InvalidTopic,

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("broker not connected")]
    NotConnected,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] busrpc_protocol::ProtocolError),
}

impl TransportError {
    /// Wraps a broker client error.
    pub fn broker(err: impl std::fmt::Display) -> Self {
        TransportError::Broker(err.to_string())
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::NotConnected | TransportError::Broker(_))
    }
}
