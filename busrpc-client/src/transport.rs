//! Request/reply correlation over a private inbox.
//!
//! Each [`AsyncClientTransport`] subscribes to its own inbox when opened and
//! sends every request with that inbox as the reply subject. Replies are
//! matched to callers by transport identity, so one transport carries at most
//! one outstanding request; a second request while one is pending fails with
//! [`ClientError::RequestInFlight`].
//!
//! The slot stays armed until the [`PendingReply`] is dropped, so a late reply
//! to an earlier, abandoned request reaches the current caller as an extra
//! reply it can skip with [`PendingReply::next_reply`].

use crate::error::ClientError;
use busrpc_protocol::{Context, Frame};
use busrpc_transport::{BrokerConnection, Subscription};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// The single outstanding request, tagged with a sequence number so a stale
/// [`PendingReply`] never clears a newer entry.
type PendingSlot = parking_lot::Mutex<Option<(u64, mpsc::UnboundedSender<Bytes>)>>;

struct OpenState {
    inbox: String,
    stop: oneshot::Sender<()>,
    reader: JoinHandle<()>,
}

/// Client transport correlating replies through an exclusive inbox.
pub struct AsyncClientTransport {
    conn: Arc<dyn BrokerConnection>,
    state: Mutex<Option<OpenState>>,
    open: AtomicBool,
    pending: Arc<PendingSlot>,
    next_seq: AtomicU64,
}

impl AsyncClientTransport {
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self {
            conn,
            state: Mutex::new(None),
            open: AtomicBool::new(false),
            pending: Arc::new(parking_lot::Mutex::new(None)),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Subscribes to a fresh inbox and starts dispatching replies.
    pub async fn open(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ClientError::AlreadyOpen);
        }
        if !self.conn.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let inbox = self.conn.new_inbox();
        let subscription = self.conn.subscribe(&inbox, None).await?;
        let (stop, stop_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(subscription, Arc::clone(&self.pending), stop_rx));

        tracing::debug!("Client transport opened, inbox={}", inbox);
        *state = Some(OpenState {
            inbox,
            stop,
            reader,
        });
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Unsubscribes from the inbox. Any waiting caller observes
    /// [`ClientError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let Some(state) = self.state.lock().await.take() else {
            tracing::debug!("Client transport already closed");
            return Ok(());
        };
        self.open.store(false, Ordering::SeqCst);

        let _ = state.stop.send(());
        if let Err(e) = state.reader.await {
            tracing::warn!("Reply reader for {} ended abnormally: {}", state.inbox, e);
        }

        if self.pending.lock().take().is_some() {
            tracing::debug!("Abandoning in-flight request on close");
        }
        tracing::debug!("Client transport closed, inbox={}", state.inbox);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns the reply inbox while open.
    pub async fn inbox(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|s| s.inbox.clone())
    }

    /// Largest request frame the broker accepts, or 0 when unbounded.
    pub fn request_size_limit(&self) -> usize {
        self.conn.max_payload()
    }

    fn check_size(&self, frame: &Bytes) -> Result<(), ClientError> {
        let limit = self.request_size_limit();
        if limit > 0 && frame.len() > limit {
            return Err(ClientError::RequestTooLarge {
                size: frame.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Publishes `frame` to `subject` with this transport's inbox as reply
    /// subject and returns a future resolving to the reply payload.
    ///
    /// The transport does not time out requests; callers bound the wait.
    pub async fn request(
        &self,
        ctx: &Context,
        subject: &str,
        frame: Bytes,
    ) -> Result<PendingReply, ClientError> {
        let inbox = self
            .state
            .lock()
            .await
            .as_ref()
            .map(|s| s.inbox.clone())
            .ok_or(ClientError::NotOpen)?;
        self.check_size(&frame)?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(ClientError::RequestInFlight);
            }
            *pending = Some((seq, tx));
        }

        let reply = PendingReply {
            rx,
            seq,
            pending: Arc::clone(&self.pending),
        };

        tracing::debug!(
            "Sending request cid={} subject={} ({} bytes)",
            ctx.correlation_id(),
            subject,
            frame.len()
        );
        // On failure `reply` is dropped, which releases the slot.
        self.conn.publish_with_reply(subject, &inbox, frame).await?;
        Ok(reply)
    }

    /// Publishes `frame` to `subject` without expecting a reply.
    pub async fn oneway(&self, ctx: &Context, subject: &str, frame: Bytes) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotOpen);
        }
        self.check_size(&frame)?;
        tracing::debug!(
            "Sending one-way request cid={} subject={}",
            ctx.correlation_id(),
            subject
        );
        self.conn.publish(subject, frame).await?;
        Ok(())
    }
}

/// Reply to an outstanding request.
///
/// Resolves to the first reply payload with its length prefix removed.
/// Dropping it abandons the request.
pub struct PendingReply {
    rx: mpsc::UnboundedReceiver<Bytes>,
    seq: u64,
    pending: Arc<PendingSlot>,
}

impl PendingReply {
    /// Waits for the next reply delivered to the inbox while this request is
    /// outstanding.
    pub async fn next_reply(&mut self) -> Result<Bytes, ClientError> {
        self.rx.recv().await.ok_or(ClientError::ConnectionClosed)
    }
}

impl Future for PendingReply {
    type Output = Result<Bytes, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|reply| reply.ok_or(ClientError::ConnectionClosed))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if matches!(pending.as_ref(), Some((seq, _)) if *seq == self.seq) {
            pending.take();
        }
    }
}

async fn read_loop(
    mut subscription: Box<dyn Subscription>,
    pending: Arc<PendingSlot>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            message = subscription.next() => match message {
                Some(message) => dispatch_reply(&pending, message.payload),
                None => {
                    tracing::debug!("Inbox subscription closed by broker");
                    break;
                }
            },
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        tracing::warn!("Failed to unsubscribe from inbox: {}", e);
    }
}

fn dispatch_reply(pending: &PendingSlot, data: Bytes) {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Dropping malformed reply: {}", e);
            return;
        }
    };

    match pending.lock().as_ref() {
        Some((_, tx)) => {
            let _ = tx.send(frame.payload);
        }
        None => {
            tracing::debug!(
                "No request awaiting reply, dropping {} bytes",
                frame.payload.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrpc_transport::MemoryBroker;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryBroker>, AsyncClientTransport) {
        let broker = Arc::new(MemoryBroker::new());
        let transport = AsyncClientTransport::new(broker.clone());
        (broker, transport)
    }

    async fn reply_to_last(broker: &MemoryBroker, frame: &'static [u8]) {
        let request = broker.published().pop().unwrap();
        broker
            .publish(&request.reply.unwrap(), Bytes::from_static(frame))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_subscribes_to_inbox() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let inbox = transport.inbox().await.unwrap();
        assert_eq!(broker.subscribers_on(&inbox), 1);
        assert!(matches!(
            transport.open().await,
            Err(ClientError::AlreadyOpen)
        ));
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_open_requires_connection() {
        let (broker, transport) = setup();
        broker.set_connected(false);
        assert!(matches!(
            transport.open().await,
            Err(ClientError::NotConnected)
        ));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (broker, transport) = setup();
        transport.close().await.unwrap();
        transport.open().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();
        let inbox = transport.inbox().await.unwrap();

        let ctx = Context::new();
        let pending = transport
            .request(&ctx, "svc", Bytes::from_static(&[0, 0, 0, 2, b'h', b'i']))
            .await
            .unwrap();

        let request = &broker.published_to("svc")[0];
        assert_eq!(request.reply.as_deref(), Some(inbox.as_str()));

        reply_to_last(&broker, &[0, 0, 0, 2, b'o', b'k']).await;
        let reply = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn test_pending_reply_wakes_on_delivery() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();

        let pending = transport
            .request(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        let mut pending = tokio_test::task::spawn(pending);
        tokio_test::assert_pending!(pending.poll());

        reply_to_last(&broker, &[0, 0, 0, 1, b'x']).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pending.is_woken() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let reply = tokio_test::assert_ready_ok!(pending.poll());
        assert_eq!(reply, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_slot_stays_armed_for_extra_replies() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();

        let mut pending = transport
            .request(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        let inbox = broker.published_to("svc")[0].reply.clone().unwrap();
        for reply in [&b"\x00\x00\x00\x05stale"[..], &b"\x00\x00\x00\x05fresh"[..]] {
            broker
                .publish(&inbox, Bytes::copy_from_slice(reply))
                .await
                .unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(2), pending.next_reply())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Bytes::from_static(b"stale"));
        let second = tokio::time::timeout(Duration::from_secs(2), pending.next_reply())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_request_requires_open() {
        let (_broker, transport) = setup();
        let result = transport
            .request(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await;
        assert!(matches!(result, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let broker = Arc::new(MemoryBroker::with_max_payload(8));
        let transport = AsyncClientTransport::new(broker.clone());
        transport.open().await.unwrap();

        let result = transport
            .request(&Context::new(), "svc", Bytes::from(vec![0u8; 9]))
            .await;
        assert!(matches!(
            result,
            Err(ClientError::RequestTooLarge { size: 9, limit: 8 })
        ));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_second_request_in_flight_rejected() {
        let (_broker, transport) = setup();
        transport.open().await.unwrap();
        let ctx = Context::new();

        let first = transport
            .request(&ctx, "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        let second = transport
            .request(&ctx, "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await;
        assert!(matches!(second, Err(ClientError::RequestInFlight)));

        // Abandoning the first request frees the transport.
        drop(first);
        assert!(transport
            .request(&ctx, "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_short_reply_dropped() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();

        let pending = transport
            .request(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        reply_to_last(&broker, &[0, 0]).await;

        // The malformed reply never reaches the caller, who times out instead.
        let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_fails_waiter() {
        let (_broker, transport) = setup();
        transport.open().await.unwrap();

        let pending = transport
            .request(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        transport.close().await.unwrap();
        assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oneway_has_no_reply_subject() {
        let (broker, transport) = setup();
        transport.open().await.unwrap();
        transport
            .oneway(&Context::new(), "svc", Bytes::from_static(&[0, 0, 0, 0]))
            .await
            .unwrap();
        let published = broker.published_to("svc");
        assert_eq!(published.len(), 1);
        assert!(published[0].reply.is_none());
    }
}
