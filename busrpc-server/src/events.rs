//! Request lifecycle hooks.

use crate::properties::{ReceivedAt, RequestProperties};
use std::time::{Duration, Instant};

/// Hooks invoked as each request moves through the server.
///
/// Implementations must not panic; they run on the broker delivery path and
/// on worker tasks.
pub trait ServerEventHandler: Send + Sync {
    /// Called when a valid request is taken off the broker, before admission.
    fn on_request_received(&self, props: &mut RequestProperties);

    /// Called on the worker, before the processor runs.
    fn on_request_started(&self, props: &mut RequestProperties);

    /// Called on the worker, after the processor finishes.
    fn on_request_ended(&self, props: &mut RequestProperties);
}

/// Records receipt time and warns when a request waited longer than the high
/// watermark before a worker picked it up.
#[derive(Debug, Clone)]
pub struct DefaultServerEventHandler {
    high_watermark: Duration,
}

impl DefaultServerEventHandler {
    pub fn new(high_watermark: Duration) -> Self {
        Self { high_watermark }
    }

    pub fn high_watermark(&self) -> Duration {
        self.high_watermark
    }

    /// Returns the queueing delay if it exceeds the high watermark.
    pub fn excess_delay(&self, props: &RequestProperties) -> Option<Duration> {
        let ReceivedAt(received) = props.get::<ReceivedAt>()?;
        let waited = received.elapsed();
        (waited > self.high_watermark).then_some(waited)
    }
}

impl ServerEventHandler for DefaultServerEventHandler {
    fn on_request_received(&self, props: &mut RequestProperties) {
        props.insert(ReceivedAt(Instant::now()));
    }

    fn on_request_started(&self, props: &mut RequestProperties) {
        if let Some(waited) = self.excess_delay(props) {
            tracing::warn!(
                "request spent {} ms in the transport buffer, your consumer might be backed up",
                waited.as_millis()
            );
        }
    }

    fn on_request_ended(&self, _props: &mut RequestProperties) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_receipt_time() {
        let handler = DefaultServerEventHandler::new(Duration::from_secs(5));
        let mut props = RequestProperties::new();
        handler.on_request_received(&mut props);
        assert!(props.contains::<ReceivedAt>());
        assert!(handler.excess_delay(&props).is_none());
    }

    #[test]
    fn test_detects_backed_up_consumer() {
        let handler = DefaultServerEventHandler::new(Duration::from_millis(100));
        let mut props = RequestProperties::new();
        props.insert(ReceivedAt(Instant::now() - Duration::from_millis(250)));

        let waited = handler.excess_delay(&props).unwrap();
        assert!(waited >= Duration::from_millis(250));
        handler.on_request_started(&mut props);
    }

    #[test]
    fn test_missing_receipt_time_is_ignored() {
        let handler = DefaultServerEventHandler::new(Duration::ZERO);
        let mut props = RequestProperties::new();
        assert!(handler.excess_delay(&props).is_none());
        handler.on_request_started(&mut props);
        handler.on_request_ended(&mut props);
    }
}
