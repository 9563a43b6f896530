//! NATS broker adapter.

use crate::broker::{BrokerConnection, BrokerMessage, Subscription};
use crate::error::TransportError;
use async_nats::connection::State;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::info;

/// [`BrokerConnection`] backed by an `async-nats` client.
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
}

impl NatsConnection {
    /// Wraps an existing client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Connects to a NATS server.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(TransportError::broker)?;
        info!(url, "connected to NATS");
        Ok(Self::new(client))
    }

    /// Connects with an explicit connection timeout.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(TransportError::broker)?;
        info!(url, timeout_ms = timeout.as_millis() as u64, "connected to NATS");
        Ok(Self::new(client))
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(TransportError::broker)
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(TransportError::broker)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let subscriber = match queue_group {
            Some(queue) if !queue.is_empty() => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            _ => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(TransportError::broker)?;

        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            subscriber,
        }))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client.flush().await.map_err(TransportError::broker)
    }
}

struct NatsSubscription {
    subject: String,
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next(&mut self) -> Option<BrokerMessage> {
        let message = self.subscriber.next().await?;
        Some(BrokerMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            payload: message.payload,
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(TransportError::broker)
    }
}
