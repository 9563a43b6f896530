//! Per-call context.
//!
//! A [`Context`] travels with exactly one RPC invocation or published event.
//! Request headers are set by the caller before dispatch and shipped inside the
//! envelope; response headers are filled in once the call completes.

use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the correlation id.
pub const CID_HEADER: &str = "_cid";

/// Header carrying the caller's timeout in milliseconds.
pub const TIMEOUT_HEADER: &str = "_timeout";

/// Per-call correlation object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
}

impl Context {
    /// Creates a context with a fresh random correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Creates a context with the given correlation id.
    pub fn with_correlation_id(cid: impl Into<String>) -> Self {
        let mut request_headers = HashMap::new();
        request_headers.insert(CID_HEADER.to_string(), cid.into());
        Self {
            request_headers,
            response_headers: HashMap::new(),
        }
    }

    /// Rebuilds a context from received request headers.
    ///
    /// A missing correlation id is replaced by a fresh one.
    pub fn from_headers(headers: HashMap<String, String>) -> Self {
        let mut ctx = Self {
            request_headers: headers,
            response_headers: HashMap::new(),
        };
        if !ctx.request_headers.contains_key(CID_HEADER) {
            ctx.request_headers.insert(
                CID_HEADER.to_string(),
                uuid::Uuid::new_v4().simple().to_string(),
            );
        }
        ctx
    }

    /// Returns the correlation id.
    pub fn correlation_id(&self) -> &str {
        self.request_headers
            .get(CID_HEADER)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Sets the call timeout, shipped to the server as a header.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.request_headers.insert(
            TIMEOUT_HEADER.to_string(),
            timeout.as_millis().to_string(),
        );
    }

    /// Builder-style variant of [`Context::set_timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Returns the call timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.request_headers
            .get(TIMEOUT_HEADER)
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
    }

    /// Adds a request header. Reserved headers cannot be overwritten this way.
    pub fn add_request_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if is_reserved(&name) {
            return;
        }
        self.request_headers.insert(name, value.into());
    }

    /// Returns a request header.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name).map(String::as_str)
    }

    /// Returns all request headers, including reserved ones.
    pub fn request_headers(&self) -> &HashMap<String, String> {
        &self.request_headers
    }

    /// Adds a response header.
    pub fn add_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.insert(name.into(), value.into());
    }

    /// Returns a response header.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers.get(name).map(String::as_str)
    }

    /// Returns all response headers.
    pub fn response_headers(&self) -> &HashMap<String, String> {
        &self.response_headers
    }

    /// Replaces the response headers with those received in a reply.
    pub fn set_response_headers(&mut self, headers: HashMap<String, String>) {
        self.response_headers = headers;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn is_reserved(name: &str) -> bool {
    name == CID_HEADER || name == TIMEOUT_HEADER
}
