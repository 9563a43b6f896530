//! Subscriber callbacks.
//!
//! Handlers receive frame payloads with the length prefix already removed.
//! Whatever a handler returns or raises stays at the transport boundary: it is
//! logged and only decides whether a durable broker acknowledges the delivery.

use busrpc_protocol::Frame;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every message delivered to a subscription.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, payload: Bytes) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn on_message(&self, payload: Bytes) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(payload))
    }
}

/// Result of handing one delivery to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Handler completed successfully.
    Handled,
    /// Frame was shorter than its length prefix; handler not invoked.
    Malformed,
    /// Handler returned an error or panicked.
    Failed,
}

/// Decodes a frame and runs the handler, containing errors and panics.
pub(crate) async fn deliver(handler: &dyn MessageHandler, topic: &str, data: Bytes) -> Delivery {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(topic, error = %e, "dropping malformed frame");
            return Delivery::Malformed;
        }
    };

    let result = AssertUnwindSafe(async { handler.on_message(frame.payload).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => Delivery::Handled,
        Ok(Err(e)) => {
            tracing::error!(topic, error = %e, "message handler failed");
            Delivery::Failed
        }
        Err(_) => {
            tracing::error!(topic, "message handler panicked");
            Delivery::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_deliver_strips_prefix() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |payload: Bytes| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(payload);
                Ok::<(), BoxError>(())
            }
        };

        let outcome = deliver(&handler, "t", Bytes::from_static(&[0, 0, 0, 2, b'h', b'i'])).await;
        assert_eq!(outcome, Delivery::Handled);
        assert_eq!(seen.lock().as_slice(), &[Bytes::from_static(b"hi")]);
    }

    #[tokio::test]
    async fn test_short_frame_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = move |_payload: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        };

        let outcome = deliver(&handler, "t", Bytes::from_static(&[0, 0, 1])).await;
        assert_eq!(outcome, Delivery::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_contained() {
        let failing = |_payload: Bytes| async { Err::<(), BoxError>("boom".into()) };
        let outcome = deliver(&failing, "t", Bytes::from_static(&[0, 0, 0, 0])).await;
        assert_eq!(outcome, Delivery::Failed);

        let panicking = |payload: Bytes| async move {
            if payload.is_empty() {
                panic!("handler exploded");
            }
            Ok::<(), BoxError>(())
        };
        let outcome = deliver(&panicking, "t", Bytes::from_static(&[0, 0, 0, 0])).await;
        assert_eq!(outcome, Delivery::Failed);
    }
}
