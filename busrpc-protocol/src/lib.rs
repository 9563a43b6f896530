//! # busrpc-protocol
//!
//! Wire protocol shared by busrpc clients, servers and pub/sub scopes.
//!
//! This crate provides:
//! - Length-prefixed binary framing
//! - Per-call [`Context`] with correlation id, timeout and headers
//! - JSON request/response/event envelopes
//! - The [`PayloadCodec`] seam and its JSON implementation
//! - Error codes and protocol constants

pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{JsonCodec, PayloadCodec};
pub use context::Context;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FRAME_HEADER_SIZE};
pub use message::{Event, Request, Response, ResponseError, ResponseStatus};

/// Default prefix applied to every pub/sub topic.
pub const DEFAULT_TOPIC_PREFIX: &str = "busrpc.";

/// Prefix used when generating reply inboxes.
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX.";

/// Maximum message size accepted by a default NATS server (1 MiB).
pub const NATS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
