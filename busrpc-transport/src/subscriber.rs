//! Subscriber transports.

use crate::broker::{BrokerConnection, Subscription};
use crate::error::TransportError;
use crate::handler::{deliver, MessageHandler};
use crate::topic::TopicFormatter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives frames published to a topic.
///
/// One transport carries at most one subscription at a time.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Subscribes to `topic`, invoking `handler` for each delivered frame.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;

    /// Stops delivery. Unsubscribing when not subscribed is a no-op.
    async fn unsubscribe(&self) -> Result<(), TransportError>;

    fn is_subscribed(&self) -> bool;
}

/// Creates subscriber transports.
pub trait SubscriberTransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn SubscriberTransport>;
}

struct ActiveSubscription {
    subject: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Subscriber over a subject-routed broker.
///
/// Brokers of this family do not acknowledge deliveries, so a handler failure
/// means the message is gone.
pub struct BrokerSubscriberTransport {
    conn: Arc<dyn BrokerConnection>,
    topics: TopicFormatter,
    queue_group: Option<String>,
    active: Mutex<Option<ActiveSubscription>>,
    subscribed: Arc<AtomicBool>,
}

impl BrokerSubscriberTransport {
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self {
            conn,
            topics: TopicFormatter::default(),
            queue_group: None,
            active: Mutex::new(None),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_topics(mut self, topics: TopicFormatter) -> Self {
        self.topics = topics;
        self
    }

    /// Joins a queue group. An empty name means broadcast delivery.
    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        let queue_group = queue_group.into();
        self.queue_group = (!queue_group.is_empty()).then_some(queue_group);
        self
    }
}

#[async_trait]
impl SubscriberTransport for BrokerSubscriberTransport {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let subject = self.topics.format(topic)?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.as_ref() {
            if !previous.task.is_finished() {
                return Err(TransportError::AlreadySubscribed);
            }
            debug!(subject = %previous.subject, "replacing subscription ended by broker");
            active.take();
        }
        if !self.conn.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let subscription = self
            .conn
            .subscribe(&subject, self.queue_group.as_deref())
            .await?;

        let (stop, stop_rx) = oneshot::channel();
        let subscribed = Arc::clone(&self.subscribed);
        subscribed.store(true, Ordering::SeqCst);
        let task = tokio::spawn(delivery_loop(
            subscription,
            subject.clone(),
            handler,
            stop_rx,
            subscribed,
        ));

        info!(
            subject = %subject,
            queue_group = ?self.queue_group,
            "subscribed"
        );
        *active = Some(ActiveSubscription {
            subject,
            stop,
            task,
        });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let Some(active) = self.active.lock().await.take() else {
            warn!("unsubscribe called on a transport that is not subscribed");
            return Ok(());
        };

        let _ = active.stop.send(());
        if let Err(e) = active.task.await {
            warn!(subject = %active.subject, error = %e, "delivery task ended abnormally");
        }
        self.subscribed.store(false, Ordering::SeqCst);
        info!(subject = %active.subject, "unsubscribed");
        Ok(())
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }
}

async fn delivery_loop(
    mut subscription: Box<dyn Subscription>,
    subject: String,
    handler: Arc<dyn MessageHandler>,
    mut stop: oneshot::Receiver<()>,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            message = subscription.next() => match message {
                Some(message) => {
                    deliver(handler.as_ref(), &subject, message.payload).await;
                }
                None => {
                    debug!(subject = %subject, "subscription closed by broker");
                    break;
                }
            },
        }
    }

    subscribed.store(false, Ordering::SeqCst);
    if let Err(e) = subscription.unsubscribe().await {
        warn!(subject = %subject, error = %e, "failed to unsubscribe");
    }
}

/// Factory for [`BrokerSubscriberTransport`].
pub struct BrokerSubscriberTransportFactory {
    conn: Arc<dyn BrokerConnection>,
    topics: TopicFormatter,
    queue_group: Option<String>,
}

impl BrokerSubscriberTransportFactory {
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self {
            conn,
            topics: TopicFormatter::default(),
            queue_group: None,
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topics = TopicFormatter::new(prefix);
        self
    }

    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }
}

impl SubscriberTransportFactory for BrokerSubscriberTransportFactory {
    fn create(&self) -> Box<dyn SubscriberTransport> {
        let mut transport =
            BrokerSubscriberTransport::new(Arc::clone(&self.conn)).with_topics(self.topics.clone());
        if let Some(queue_group) = &self.queue_group {
            transport = transport.with_queue_group(queue_group.clone());
        }
        Box::new(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxError;
    use crate::memory::MemoryBroker;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |payload: Bytes| {
            let _ = tx.send(payload);
            async { Ok::<(), BoxError>(()) }
        };
        (Arc::new(handler), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_subscribe_delivers_decoded_frames() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (handler, mut rx) = channel_handler();

        transport.subscribe("foo", handler).await.unwrap();
        assert!(transport.is_subscribed());
        assert_eq!(broker.subscribers_on("busrpc.foo"), 1);

        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 3, b'a', b'b', b'c']))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Some(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_short_frames_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (handler, mut rx) = channel_handler();
        transport.subscribe("foo", handler).await.unwrap();

        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 1]))
            .await
            .unwrap();
        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();

        // Only the well-formed (empty) frame reaches the handler.
        assert_eq!(recv(&mut rx).await, Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_subscribe_twice_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (handler, _rx) = channel_handler();

        transport.subscribe("foo", handler.clone()).await.unwrap();
        assert!(matches!(
            transport.subscribe("foo", handler).await,
            Err(TransportError::AlreadySubscribed)
        ));
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker);
        let (handler, _rx) = channel_handler();
        assert!(matches!(
            transport.subscribe("", handler).await,
            Err(TransportError::InvalidTopic)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_connected(false);
        let transport = BrokerSubscriberTransport::new(broker);
        let (handler, _rx) = channel_handler();
        assert!(matches!(
            transport.subscribe("foo", handler).await,
            Err(TransportError::NotConnected)
        ));
        assert!(!transport.is_subscribed());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (handler, _rx) = channel_handler();

        // Not subscribed yet: no-op.
        transport.unsubscribe().await.unwrap();

        transport.subscribe("foo", handler.clone()).await.unwrap();
        transport.unsubscribe().await.unwrap();
        assert!(!transport.is_subscribed());
        assert_eq!(broker.subscription_count(), 0);

        // Can subscribe again after unsubscribing.
        transport.subscribe("bar", handler).await.unwrap();
        assert!(transport.is_subscribed());
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_delivery() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |payload: Bytes| {
            let _ = tx.send(payload.clone());
            async move {
                if payload.as_ref() == b"bad" {
                    return Err::<(), BoxError>("rejected".into());
                }
                Ok(())
            }
        };
        transport.subscribe("foo", Arc::new(handler)).await.unwrap();

        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 3, b'b', b'a', b'd']))
            .await
            .unwrap();
        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 2, b'o', b'k']))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, Some(Bytes::from_static(b"bad")));
        assert_eq!(recv(&mut rx).await, Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_resubscribe_after_broker_closes_subscription() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = BrokerSubscriberTransport::new(broker.clone());
        let (handler, mut rx) = channel_handler();
        transport.subscribe("foo", handler.clone()).await.unwrap();
        assert!(transport.is_subscribed());

        broker.close_subscriptions();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while transport.is_subscribed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!transport.is_subscribed());
        // Let the delivery task run to completion.
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.subscribe("foo", handler).await.unwrap();
        assert!(transport.is_subscribed());
        assert_eq!(broker.subscribers_on("busrpc.foo"), 1);

        broker
            .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 2, b'o', b'k']))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_queue_group_load_balances() {
        let broker = Arc::new(MemoryBroker::new());
        let factory = BrokerSubscriberTransportFactory::new(broker.clone()).with_queue_group("q");
        let a = factory.create();
        let b = factory.create();
        let (ha, mut ra) = channel_handler();
        let (hb, mut rb) = channel_handler();
        a.subscribe("foo", ha).await.unwrap();
        b.subscribe("foo", hb).await.unwrap();

        for _ in 0..2 {
            broker
                .publish("busrpc.foo", Bytes::from_static(&[0, 0, 0, 0]))
                .await
                .unwrap();
        }

        assert!(recv(&mut ra).await.is_some());
        assert!(recv(&mut rb).await.is_some());
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_err());
    }
}
