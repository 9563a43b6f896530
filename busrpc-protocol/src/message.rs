//! JSON envelopes for requests, responses and scope events.

use crate::context::Context;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Request message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Correlation id of the calling context.
    pub id: String,

    /// Operation to invoke.
    pub op: String,

    /// Request headers copied from the calling context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Operation-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op: op.into(),
            headers: HashMap::new(),
            params: Value::Object(Default::default()),
        }
    }

    /// Builds a request carrying the context's correlation id and headers.
    pub fn from_context(ctx: &Context, op: impl Into<String>) -> Self {
        Self::new(ctx.correlation_id(), op).with_headers(ctx.request_headers().clone())
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// Whether this error is retryable.
    pub retryable: bool,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
        }
    }
}

/// Response message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Correlation id this response answers.
    pub id: String,

    /// Response status.
    pub status: ResponseStatus,

    /// Response headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Result payload (for successful responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error details (for error responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            headers: HashMap::new(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Error,
            headers: HashMap::new(),
            result: None,
            error: Some(error),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

/// Event published on a pub/sub scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Message type, always "event".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Correlation id of the publishing context.
    pub id: String,

    /// Scope operation the event belongs to.
    pub op: String,

    /// Headers copied from the publishing context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Event body.
    #[serde(default)]
    pub body: Value,
}

impl Event {
    pub fn new(ctx: &Context, op: impl Into<String>, body: Value) -> Self {
        Self {
            msg_type: "event".to_string(),
            id: ctx.correlation_id().to_string(),
            op: op.into(),
            headers: ctx.request_headers().clone(),
            body,
        }
    }

    /// Rebuilds the publisher's context on the subscriber side.
    pub fn context(&self) -> Context {
        Context::from_headers(self.headers.clone())
    }
}
