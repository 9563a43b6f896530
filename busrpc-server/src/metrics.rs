//! Prometheus metrics for the busrpc server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Queue wait histogram buckets (in seconds).
const QUEUE_WAIT_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Prometheus metrics for the busrpc server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Requests admitted to the worker pool.
    pub requests_total: Counter,
    /// Inbound messages discarded before processing, by reason.
    pub requests_discarded_total: CounterVec,
    /// Processor failures by kind (`protocol`, `runtime`, `panic`).
    pub processor_errors_total: CounterVec,
    /// Responses published.
    pub responses_total: Counter,
    /// Responses that failed to publish.
    pub publish_errors_total: Counter,
    /// Requests admitted but not yet finished.
    pub requests_in_flight: Gauge,
    /// Time between receipt and dispatch to a worker.
    pub queue_wait: Histogram,
    /// Processor run time.
    pub request_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = Counter::with_opts(Opts::new(
            "busrpc_requests_total",
            "Total requests admitted to the worker pool",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_discarded_total = CounterVec::new(
            Opts::new(
                "busrpc_requests_discarded_total",
                "Inbound messages discarded before processing by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(requests_discarded_total.clone()))?;

        let processor_errors_total = CounterVec::new(
            Opts::new(
                "busrpc_processor_errors_total",
                "Processor failures by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(processor_errors_total.clone()))?;

        let responses_total = Counter::with_opts(Opts::new(
            "busrpc_responses_total",
            "Total responses published",
        ))?;
        registry.register(Box::new(responses_total.clone()))?;

        let publish_errors_total = Counter::with_opts(Opts::new(
            "busrpc_publish_errors_total",
            "Total responses that failed to publish",
        ))?;
        registry.register(Box::new(publish_errors_total.clone()))?;

        let requests_in_flight = Gauge::with_opts(Opts::new(
            "busrpc_requests_in_flight",
            "Requests admitted but not yet finished",
        ))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "busrpc_queue_wait_seconds",
                "Time requests spend between receipt and dispatch",
            )
            .buckets(QUEUE_WAIT_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(queue_wait.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "busrpc_request_duration_seconds",
                "Processor run time in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_discarded_total,
            processor_errors_total,
            responses_total,
            publish_errors_total,
            requests_in_flight,
            queue_wait,
            request_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(status: StatusCode, content_type: Option<&'static str>, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => respond(
            StatusCode::OK,
            Some("text/plain; version=0.0.4; charset=utf-8"),
            metrics.encode(),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, None, "OK"),
        _ => respond(StatusCode::NOT_FOUND, None, "Not Found"),
    }
}
