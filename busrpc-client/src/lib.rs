//! # busrpc-client
//!
//! Client library for busrpc.
//!
//! This crate provides:
//! - [`AsyncClientTransport`]: request/reply correlation over a private inbox
//! - [`Client`]: envelope encoding, caller-owned timeouts and error mapping

pub mod client;
pub mod error;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use error::ClientError;
pub use transport::{AsyncClientTransport, PendingReply};
