//! Concurrent server runtime.
//!
//! A [`Server`] subscribes to one or more service subjects, hands each
//! request frame to an [`Executor`], runs the application [`Processor`] on a
//! worker and publishes the output frame to the request's reply subject.
//!
//! `serve` and `stop` may be called from different tasks, in any order and any
//! number of times. They rendezvous on a [`Phaser`]: `stop` waits until every
//! active `serve` has unsubscribed, drains the executor, then releases the
//! `serve` calls that are waiting for shutdown to complete.

use crate::error::ServerError;
use crate::events::{DefaultServerEventHandler, ServerEventHandler};
use crate::executor::{Executor, WorkerPool};
use crate::metrics::Metrics;
use crate::phaser::Phaser;
use crate::processor::{OutputBuffer, Processor, ProcessorError};
use crate::properties::{ReceivedAt, ReplyTo, RequestProperties, ServiceSubject};
use busrpc_protocol::FRAME_HEADER_SIZE;
use busrpc_transport::{BrokerConnection, BrokerMessage, Subscription};
use bytes::Bytes;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Default number of workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default admission queue length.
pub const DEFAULT_QUEUE_LEN: usize = 64;

/// Default queueing delay that triggers a backpressure warning.
pub const DEFAULT_HIGH_WATERMARK: Duration = Duration::from_millis(5000);

/// Default grace period for draining in-flight requests on stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Service subjects to subscribe to.
    pub subjects: Vec<String>,
    /// Queue group shared by load-balanced servers. `None` means every server
    /// receives every request.
    pub queue_group: Option<String>,
    /// Number of workers in the default pool.
    pub worker_count: usize,
    /// Admission queue length of the default pool.
    pub queue_len: usize,
    /// Queueing delay above which the default event handler warns.
    pub high_watermark: Duration,
    /// How long `stop` waits for in-flight requests before aborting them.
    pub stop_timeout: Duration,
    /// Replaces the default worker pool. `worker_count` and `queue_len` are
    /// ignored when set.
    pub executor: Option<Arc<dyn Executor>>,
    /// Replaces the default event handler. `high_watermark` is ignored when set.
    pub event_handler: Option<Arc<dyn ServerEventHandler>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("subjects", &self.subjects)
            .field("queue_group", &self.queue_group)
            .field("worker_count", &self.worker_count)
            .field("queue_len", &self.queue_len)
            .field("high_watermark", &self.high_watermark)
            .field("stop_timeout", &self.stop_timeout)
            .field("custom_executor", &self.executor.is_some())
            .field("custom_event_handler", &self.event_handler.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            queue_group: None,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_len: DEFAULT_QUEUE_LEN,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            executor: None,
            event_handler: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subjects: subjects.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    pub fn with_high_watermark(mut self, high_watermark: Duration) -> Self {
        self.high_watermark = high_watermark;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_event_handler(mut self, event_handler: Arc<dyn ServerEventHandler>) -> Self {
        self.event_handler = Some(event_handler);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.subjects.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one subject is required".to_string(),
            ));
        }
        if self.subjects.iter().any(|s| s.is_empty()) {
            return Err(ServerError::InvalidConfig(
                "subjects cannot be empty".to_string(),
            ));
        }
        if self.queue_group.as_deref() == Some("") {
            return Err(ServerError::InvalidConfig(
                "queue group cannot be empty".to_string(),
            ));
        }
        if self.executor.is_none() && (self.worker_count == 0 || self.queue_len == 0) {
            return Err(ServerError::InvalidConfig(
                "worker_count and queue_len must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Valid requests taken off the broker.
    pub requests_received: AtomicU64,
    /// Requests accepted by the executor.
    pub requests_admitted: AtomicU64,
    /// Messages dropped before admission (no reply subject, short frame).
    pub requests_discarded: AtomicU64,
    /// Requests dropped because the server stopped while they waited for
    /// admission, or the executor refused them.
    pub requests_abandoned: AtomicU64,
    /// Requests whose processor run finished, successfully or not.
    pub requests_completed: AtomicU64,
    pub processor_errors: AtomicU64,
    pub responses_published: AtomicU64,
    pub publish_errors: AtomicU64,
}

/// State shared by the delivery loops and the worker tasks.
struct Dispatcher {
    conn: Arc<dyn BrokerConnection>,
    processor: Arc<dyn Processor>,
    executor: Arc<dyn Executor>,
    events: Arc<dyn ServerEventHandler>,
    metrics: Option<Arc<Metrics>>,
    stats: Arc<ServerStats>,
}

/// Decrements the in-flight gauge when the task finishes or is dropped.
struct InFlight(Option<Arc<Metrics>>);

impl InFlight {
    fn start(metrics: Option<Arc<Metrics>>) -> Self {
        if let Some(ref m) = metrics {
            m.requests_in_flight.inc();
        }
        Self(metrics)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(ref m) = self.0 {
            m.requests_in_flight.dec();
        }
    }
}

impl Dispatcher {
    fn discard(&self, reason: &'static str) {
        self.stats.requests_discarded.fetch_add(1, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.requests_discarded_total.with_label_values(&[reason]).inc();
        }
    }

    /// Validates a delivered message and submits it to the executor.
    ///
    /// Waits while the executor is saturated.
    async fn admit(self: &Arc<Self>, message: BrokerMessage) {
        let BrokerMessage {
            subject,
            reply,
            payload,
        } = message;

        let Some(reply) = reply.filter(|r| !r.is_empty()) else {
            tracing::warn!("Discarding invalid request on {}: no reply subject", subject);
            self.discard("no_reply");
            return;
        };
        if payload.len() < FRAME_HEADER_SIZE {
            tracing::warn!(
                "Discarding invalid request frame on {}: {} bytes",
                subject,
                payload.len()
            );
            self.discard("short_frame");
            return;
        }

        let mut props = RequestProperties::new();
        props.insert(ReplyTo(reply.clone()));
        props.insert(ServiceSubject(subject));
        self.events.on_request_received(&mut props);
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let in_flight = InFlight::start(self.metrics.clone());
        let dispatcher = Arc::clone(self);
        let task = Box::pin(async move {
            let _in_flight = in_flight;
            dispatcher.execute(reply, payload, props).await;
        });

        match self.executor.submit(task).await {
            Ok(()) => {
                self.stats.requests_admitted.fetch_add(1, Ordering::Relaxed);
                if let Some(ref m) = self.metrics {
                    m.requests_total.inc();
                }
            }
            Err(e) => {
                tracing::warn!("Request rejected by executor: {}", e);
                self.stats.requests_abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Runs the processor for one admitted request.
    async fn execute(&self, reply: String, frame: Bytes, mut props: RequestProperties) {
        self.events.on_request_started(&mut props);
        if let (Some(m), Some(ReceivedAt(received))) = (&self.metrics, props.get::<ReceivedAt>()) {
            m.queue_wait.observe(received.elapsed().as_secs_f64());
        }

        let input = frame.slice(FRAME_HEADER_SIZE..);
        let mut output = OutputBuffer::new(self.conn.max_payload());
        let started = Instant::now();
        let result = AssertUnwindSafe(self.processor.process(input, &mut output, &props))
            .catch_unwind()
            .await;
        if let Some(ref m) = self.metrics {
            m.request_duration.observe(started.elapsed().as_secs_f64());
        }
        self.stats.requests_completed.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(Ok(())) => {
                if output.is_empty() {
                    tracing::trace!("Processor produced no output, not replying");
                } else {
                    self.reply(&reply, output.into_frame()).await;
                }
            }
            Ok(Err(ProcessorError::Protocol(msg))) => {
                tracing::error!("Protocol error processing request: {}", msg);
                self.processor_failed("protocol");
            }
            Ok(Err(ProcessorError::Runtime(msg))) => {
                tracing::error!("Runtime error processing request: {}", msg);
                self.processor_failed("runtime");
                self.reply(&reply, output.into_frame()).await;
            }
            Err(_) => {
                tracing::error!("Processor panicked while handling request");
                self.processor_failed("panic");
                self.reply(&reply, output.into_frame()).await;
            }
        }

        self.events.on_request_ended(&mut props);
    }

    fn processor_failed(&self, kind: &'static str) {
        self.stats.processor_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.processor_errors_total.with_label_values(&[kind]).inc();
        }
    }

    async fn reply(&self, subject: &str, frame: Bytes) {
        match self.conn.publish(subject, frame).await {
            Ok(()) => {
                self.stats.responses_published.fetch_add(1, Ordering::Relaxed);
                if let Some(ref m) = self.metrics {
                    m.responses_total.inc();
                }
            }
            Err(e) => {
                tracing::error!("Failed to publish response to {}: {}", subject, e);
                self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(ref m) = self.metrics {
                    m.publish_errors_total.inc();
                }
            }
        }
    }
}

async fn wait_for_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|fired| *fired).await;
}

/// Feeds one subscription into the dispatcher until `stop` fires.
async fn delivery_loop(
    mut subscription: Box<dyn Subscription>,
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
) {
    let subject = subscription.subject().to_string();
    loop {
        let message = tokio::select! {
            biased;
            _ = wait_for_signal(&mut stop) => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("Subscription on {} closed by broker", subject);
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = dispatcher.admit(message) => {}
            _ = wait_for_signal(&mut stop) => {
                tracing::warn!("Abandoning request on {} waiting for admission", subject);
                dispatcher.stats.requests_abandoned.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        tracing::warn!("Failed to unsubscribe from {}: {}", subject, e);
    }
    tracing::debug!("Unsubscribed from {}", subject);
}

/// Request/reply server over a broker connection.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    phaser: Phaser,
    shutdown: watch::Sender<bool>,
    serving: AtomicUsize,
}

impl Server {
    /// Creates a server. Fails if the configuration is invalid.
    pub fn new(
        conn: Arc<dyn BrokerConnection>,
        processor: Arc<dyn Processor>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let executor = config.executor.clone().unwrap_or_else(|| {
            Arc::new(WorkerPool::new(config.worker_count, config.queue_len)) as Arc<dyn Executor>
        });
        let events = config.event_handler.clone().unwrap_or_else(|| {
            Arc::new(DefaultServerEventHandler::new(config.high_watermark))
                as Arc<dyn ServerEventHandler>
        });
        let dispatcher = Arc::new(Dispatcher {
            conn,
            processor,
            executor,
            events,
            metrics: config.metrics.clone(),
            stats: Arc::new(ServerStats::default()),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            dispatcher,
            phaser: Phaser::new(),
            shutdown,
            serving: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.dispatcher.stats
    }

    /// Returns whether any `serve` call is active.
    pub fn is_running(&self) -> bool {
        self.serving.load(Ordering::SeqCst) > 0
    }

    /// Returns whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Serves requests until [`stop`](Self::stop) is called, then waits for
    /// the executor to drain before returning.
    pub async fn serve(&self) -> Result<(), ServerError> {
        self.serve_until(futures::future::pending()).await
    }

    /// Serves requests until `stop` is called or `interrupt` completes.
    ///
    /// An interrupted call unsubscribes and returns at once, leaving the
    /// executor and any other `serve` calls untouched.
    pub async fn serve_until<F>(&self, interrupt: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let registration = self.phaser.register_guard();
        let mut shutdown = self.shutdown.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut loops = Vec::with_capacity(self.config.subjects.len());
        for subject in &self.config.subjects {
            let subscription = match self
                .dispatcher
                .conn
                .subscribe(subject, self.config.queue_group.as_deref())
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    tracing::error!("Failed to subscribe to {}: {}", subject, e);
                    stop_tx.send_replace(true);
                    for handle in loops {
                        let _ = handle.await;
                    }
                    return Err(e.into());
                }
            };
            loops.push(tokio::spawn(delivery_loop(
                subscription,
                Arc::clone(&self.dispatcher),
                stop_rx.clone(),
            )));
        }

        self.serving.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {:?} (queue group: {})",
            self.config.subjects,
            self.config.queue_group.as_deref().unwrap_or("none")
        );

        tokio::pin!(interrupt);
        let stopped = tokio::select! {
            _ = wait_for_signal(&mut shutdown) => true,
            _ = &mut interrupt => false,
        };

        stop_tx.send_replace(true);
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!("Delivery task failed: {}", e);
            }
        }
        self.serving.fetch_sub(1, Ordering::SeqCst);

        if stopped {
            // Unsubscribed; wait for stop to drain the executor.
            registration.arrive_and_await_advance().await;
            registration.arrive_and_await_advance().await;
            tracing::info!("Server stopped");
        } else {
            tracing::info!("Serve interrupted, unsubscribed from {:?}", self.config.subjects);
        }
        Ok(())
    }

    /// Stops the server.
    ///
    /// Signals every `serve` call, waits for them to unsubscribe, then drains
    /// the executor for up to the stop timeout before aborting what remains.
    /// Safe to call before `serve` and more than once.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let registration = self.phaser.register_guard();
        if !self.shutdown.send_replace(true) {
            tracing::info!("Stopping server");
        }

        registration.arrive_and_await_advance().await;

        let executor = &self.dispatcher.executor;
        executor.shutdown();
        if !executor.await_termination(self.config.stop_timeout).await {
            tracing::warn!(
                "In-flight requests did not finish within {:?}, aborting",
                self.config.stop_timeout
            );
            executor.shutdown_now();
        }
        Ok(())
    }
}
