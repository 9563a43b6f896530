//! Pub/sub scopes.
//!
//! A scope is a named event stream. Its operations map onto topics of the form
//! `{prefix}{Scope}.{op}`; the transport then applies its own topic prefix.
//! Every publisher and every subscription acquires a dedicated transport from
//! the provider's factories.

use crate::error::TransportError;
use crate::handler::{BoxError, MessageHandler};
use crate::publisher::{PublisherTransport, PublisherTransportFactory};
use crate::subscriber::{SubscriberTransport, SubscriberTransportFactory};
use busrpc_protocol::{Context, Event, Frame, PayloadCodec};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

const DELIMITER: &str = ".";

/// Supplies transports and a codec to scope publishers and subscribers.
#[derive(Clone)]
pub struct ScopeProvider {
    publishers: Arc<dyn PublisherTransportFactory>,
    subscribers: Arc<dyn SubscriberTransportFactory>,
    codec: Arc<dyn PayloadCodec>,
}

impl ScopeProvider {
    pub fn new(
        publishers: Arc<dyn PublisherTransportFactory>,
        subscribers: Arc<dyn SubscriberTransportFactory>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        Self {
            publishers,
            subscribers,
            codec,
        }
    }

    /// Creates a publisher for `scope` with its own transport.
    pub fn publisher(&self, scope: impl Into<String>, prefix: impl Into<String>) -> ScopePublisher {
        ScopePublisher {
            scope: scope.into(),
            prefix: prefix.into(),
            transport: self.publishers.create(),
            codec: Arc::clone(&self.codec),
        }
    }

    /// Creates a subscriber for `scope`.
    pub fn subscriber(
        &self,
        scope: impl Into<String>,
        prefix: impl Into<String>,
    ) -> ScopeSubscriber {
        ScopeSubscriber {
            scope: scope.into(),
            prefix: prefix.into(),
            transports: Arc::clone(&self.subscribers),
            codec: Arc::clone(&self.codec),
        }
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }
}

fn scope_topic(prefix: &str, scope: &str, op: &str) -> String {
    format!("{prefix}{scope}{DELIMITER}{op}")
}

/// Publishes events on one scope.
pub struct ScopePublisher {
    scope: String,
    prefix: String,
    transport: Box<dyn PublisherTransport>,
    codec: Arc<dyn PayloadCodec>,
}

impl ScopePublisher {
    pub async fn open(&self) -> Result<(), TransportError> {
        self.transport.open().await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Topic an operation is published on, before transport prefixing.
    pub fn topic(&self, op: &str) -> String {
        scope_topic(&self.prefix, &self.scope, op)
    }

    /// Publishes an event for `op`.
    pub async fn publish(&self, ctx: &Context, op: &str, body: Value) -> Result<(), TransportError> {
        let event = Event::new(ctx, op, body);
        let payload = self.codec.encode_event(&event)?;
        let frame = Frame::encode(&payload)?.freeze();
        self.transport.publish(&self.topic(op), frame).await
    }
}

/// Handler for scope events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, ctx: Context, body: Value) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn on_event(&self, ctx: Context, body: Value) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(ctx, body))
    }
}

/// Subscribes to operations on one scope.
pub struct ScopeSubscriber {
    scope: String,
    prefix: String,
    transports: Arc<dyn SubscriberTransportFactory>,
    codec: Arc<dyn PayloadCodec>,
}

impl ScopeSubscriber {
    pub fn topic(&self, op: &str) -> String {
        scope_topic(&self.prefix, &self.scope, op)
    }

    /// Subscribes to `op`, decoding each frame into an [`Event`].
    ///
    /// Events that fail to decode are reported as handler errors.
    pub async fn subscribe<H>(&self, op: &str, handler: H) -> Result<ScopeSubscription, TransportError>
    where
        H: EventHandler + 'static,
    {
        let topic = self.topic(op);
        let codec = Arc::clone(&self.codec);
        let handler = Arc::new(handler);
        let callback = move |payload: Bytes| -> BoxFuture<'static, Result<(), BoxError>> {
            match codec.decode_event(&payload) {
                Ok(event) => handler.on_event(event.context(), event.body),
                Err(e) => Box::pin(async move { Err::<(), BoxError>(Box::new(e)) }),
            }
        };

        let transport = self.transports.create();
        transport
            .subscribe(&topic, Arc::new(callback) as Arc<dyn MessageHandler>)
            .await?;
        Ok(ScopeSubscription { topic, transport })
    }
}

/// An active scope subscription. It owns its transport.
pub struct ScopeSubscription {
    topic: String,
    transport: Box<dyn SubscriberTransport>,
}

impl ScopeSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_subscribed(&self) -> bool {
        self.transport.is_subscribed()
    }

    pub async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.transport.unsubscribe().await
    }
}
