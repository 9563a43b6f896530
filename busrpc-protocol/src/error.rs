//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or envelope handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes (need at least 4)")]
    FrameTooShort(usize),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected message type: expected '{expected}', got '{actual}'")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Stable error codes returned in error responses.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No handler is registered for the requested operation.
    UnknownMethod,
    /// The request could not be understood by the handler.
    BadRequest,
    /// The handler failed while processing the request.
    InternalError,
}

impl ErrorCode {
    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnknownMethod => write!(f, "UNKNOWN_METHOD"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
