//! Broker connection abstraction.
//!
//! A broker routes opaque messages by subject. It has no notion of calls,
//! replies or flow control; those are built on top by the client and server.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

/// A message delivered by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject, if the publisher asked for one.
    pub reply: Option<String>,
    /// Raw message payload (a frame).
    pub payload: Bytes,
}

impl BrokerMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// A live subscription on a broker subject.
#[async_trait]
pub trait Subscription: Send {
    /// Subject (or pattern) this subscription listens on.
    fn subject(&self) -> &str;

    /// Waits for the next message. Returns `None` once the subscription ends.
    async fn next(&mut self) -> Option<BrokerMessage>;

    /// Stops delivery.
    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}

/// Connection to a subject-routed message broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Returns whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Maximum payload the broker accepts, or 0 when unbounded.
    fn max_payload(&self) -> usize;

    /// Returns a fresh, unique reply subject.
    fn new_inbox(&self) -> String;

    /// Publishes a message with no reply subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Publishes a message carrying a reply subject.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Subscribes to a subject, optionally as a member of a queue group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Flushes buffered outbound messages to the broker.
    async fn flush(&self) -> Result<(), TransportError>;
}
