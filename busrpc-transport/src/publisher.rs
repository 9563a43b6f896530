//! Publisher transports.

use crate::broker::BrokerConnection;
use crate::error::TransportError;
use crate::topic::TopicFormatter;
use async_trait::async_trait;
use busrpc_protocol::NATS_MAX_MESSAGE_SIZE;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Publishes frames to topics.
///
/// `open` and `close` are idempotent. `publish` validates, in order: the topic
/// is non-empty, the transport is open, and the payload fits the size limit.
#[async_trait]
pub trait PublisherTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Largest payload accepted by `publish`, or 0 when unbounded.
    fn publish_size_limit(&self) -> usize;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Creates publisher transports.
pub trait PublisherTransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn PublisherTransport>;
}

/// Checks a payload against a publish size limit (0 = unlimited).
pub(crate) fn check_size(size: usize, limit: usize) -> Result<(), TransportError> {
    if limit > 0 && size > limit {
        return Err(TransportError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Fire-and-forget publisher over a subject-routed broker.
pub struct BrokerPublisherTransport {
    conn: Arc<dyn BrokerConnection>,
    topics: TopicFormatter,
    size_limit: usize,
    open: AtomicBool,
}

impl BrokerPublisherTransport {
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self {
            conn,
            topics: TopicFormatter::default(),
            size_limit: NATS_MAX_MESSAGE_SIZE,
            open: AtomicBool::new(false),
        }
    }

    pub fn with_topics(mut self, topics: TopicFormatter) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = size_limit;
        self
    }
}

#[async_trait]
impl PublisherTransport for BrokerPublisherTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            debug!("publisher transport already open");
            return Ok(());
        }
        if !self.conn.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.open.store(true, Ordering::SeqCst);
        info!(prefix = self.topics.prefix(), "publisher transport opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            debug!("publisher transport already closed");
            return Ok(());
        }
        if self.conn.is_connected() {
            self.conn.flush().await?;
        }
        info!("publisher transport closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.conn.is_connected()
    }

    fn publish_size_limit(&self) -> usize {
        self.size_limit
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let subject = self.topics.format(topic)?;
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        check_size(payload.len(), self.size_limit)?;
        self.conn.publish(&subject, payload).await
    }
}

/// Factory for [`BrokerPublisherTransport`].
pub struct BrokerPublisherTransportFactory {
    conn: Arc<dyn BrokerConnection>,
    topics: TopicFormatter,
    size_limit: usize,
}

impl BrokerPublisherTransportFactory {
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self {
            conn,
            topics: TopicFormatter::default(),
            size_limit: NATS_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topics = TopicFormatter::new(prefix);
        self
    }

    pub fn with_size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = size_limit;
        self
    }
}

impl PublisherTransportFactory for BrokerPublisherTransportFactory {
    fn create(&self) -> Box<dyn PublisherTransport> {
        Box::new(
            BrokerPublisherTransport::new(Arc::clone(&self.conn))
                .with_topics(self.topics.clone())
                .with_size_limit(self.size_limit),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn setup() -> (Arc<MemoryBroker>, BrokerPublisherTransport) {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerPublisherTransport::new(broker.clone());
        (broker, transport)
    }

    #[tokio::test]
    async fn test_publish_formats_topic() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();
        transport
            .publish("v1.music.AlbumWinners.Winner", Bytes::from_static(b"\0\0\0\0"))
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "busrpc.v1.music.AlbumWinners.Winner");
        assert!(published[0].reply.is_none());
    }

    #[tokio::test]
    async fn test_empty_topic_rejected_in_any_state() {
        let (_broker, transport) = setup();
        assert!(matches!(
            transport.publish("", Bytes::new()).await,
            Err(TransportError::InvalidTopic)
        ));
        transport.open().await.unwrap();
        assert!(matches!(
            transport.publish("", Bytes::new()).await,
            Err(TransportError::InvalidTopic)
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_open() {
        let (broker, transport) = setup();
        assert!(matches!(
            transport.publish("foo", Bytes::new()).await,
            Err(TransportError::NotOpen)
        ));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let broker = Arc::new(MemoryBroker::with_max_payload(0));
        let transport = BrokerPublisherTransport::new(broker.clone()).with_size_limit(8);
        transport.open().await.unwrap();

        let result = transport.publish("foo", Bytes::from(vec![0u8; 9])).await;
        assert!(matches!(
            result,
            Err(TransportError::PayloadTooLarge { size: 9, limit: 8 })
        ));
        assert!(transport.publish("foo", Bytes::from(vec![0u8; 8])).await.is_ok());

        let unlimited = BrokerPublisherTransport::new(broker).with_size_limit(0);
        unlimited.open().await.unwrap();
        assert!(unlimited
            .publish("foo", Bytes::from(vec![0u8; 4 * 1024 * 1024]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_open_close_idempotent() {
        let (_broker, transport) = setup();
        transport.open().await.unwrap();
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_requires_connection() {
        let (broker, transport) = setup();
        broker.set_connected(false);
        assert!(matches!(
            transport.open().await,
            Err(TransportError::NotConnected)
        ));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_factory_creates_independent_transports() {
        let broker = Arc::new(MemoryBroker::new());
        let factory = BrokerPublisherTransportFactory::new(broker)
            .with_topic_prefix("app.")
            .with_size_limit(16);
        let a = factory.create();
        let b = factory.create();
        a.open().await.unwrap();
        assert!(a.is_open());
        assert!(!b.is_open());
        assert_eq!(b.publish_size_limit(), 16);
    }
}
