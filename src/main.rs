//! busrpc - diagnostic RPC server
//!
//! Answers `ping` and `echo` requests on the configured NATS subjects.

use busrpc_protocol::Context;
use busrpc_server::{run_metrics_server, Config, MethodError, MethodProcessor, Metrics, Server};
use busrpc_transport::NatsConnection;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn diagnostics() -> MethodProcessor {
    MethodProcessor::new()
        .with_method("ping", |_ctx: Context, _params: Value| async {
            Ok::<Value, MethodError>(json!({ "pong": true }))
        })
        .with_method("echo", |ctx: Context, params: Value| async move {
            tracing::debug!("echo cid={}", ctx.correlation_id());
            Ok::<Value, MethodError>(params)
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if BUSRPC_CONFIG is set, then env overrides)
    let config_path = std::env::var("BUSRPC_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting busrpc server");
    tracing::info!("  Broker: {}", config.broker.url);
    tracing::info!("  Subjects: {}", config.server.subjects.join(", "));
    tracing::info!(
        "  Queue group: {}",
        config.server.queue_group.as_deref().unwrap_or("none")
    );
    tracing::info!(
        "  Workers: {} (queue length {})",
        config.server.worker_count,
        config.server.queue_len
    );

    let conn = NatsConnection::connect_with_timeout(
        &config.broker.url,
        config.broker.connect_timeout(),
    )
    .await?;

    let (metrics_shutdown, _) = broadcast::channel(1);
    let mut server_config = config.server.to_server_config();
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        tracing::info!("  Metrics: http://{}/metrics", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(
        Arc::new(conn),
        Arc::new(diagnostics()),
        server_config,
    )?);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        if let Err(e) = shutdown_server.stop().await {
            tracing::error!("Failed to stop server: {}", e);
        }
    });

    // Serve (blocks until stopped and drained)
    server.serve().await?;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
