//! Command execution.

use crate::Commands;
use busrpc_client::{Client, ClientConfig};
use busrpc_protocol::{Context, JsonCodec};
use busrpc_transport::{
    BoxError, BrokerConnection, BrokerPublisherTransportFactory,
    BrokerSubscriberTransportFactory, ScopeProvider,
};
use colored::Colorize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    conn: Arc<dyn BrokerConnection>,
    cmd: Commands,
    timeout: Duration,
    topic_prefix: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Request {
            subject,
            op,
            params,
            headers,
        } => {
            let params = params
                .map(|p| parse_json_arg(&p))
                .transpose()?
                .unwrap_or_else(|| json!({}));
            let client = open_client(conn, timeout).await?;

            let mut ctx = Context::new();
            for (name, value) in headers {
                ctx.add_request_header(name, value);
            }
            let result = client.call(&mut ctx, &subject, &op, params).await;
            client.close().await?;

            let result = result?;
            let mut output = format_json(&result);
            if !ctx.response_headers().is_empty() {
                let mut names: Vec<_> = ctx.response_headers().iter().collect();
                names.sort();
                for (name, value) in names {
                    output.push_str(&format!("\n{} {}: {}", "<".dimmed(), name, value));
                }
            }
            Ok(output)
        }

        Commands::Ping { subject } => {
            let client = open_client(conn, timeout).await?;
            let started = Instant::now();
            let result = client.ping(&subject).await;
            client.close().await?;
            result?;
            Ok(format!(
                "{} from {} in {:.1} ms",
                "PONG".green(),
                subject.cyan(),
                started.elapsed().as_secs_f64() * 1000.0
            ))
        }

        Commands::Publish {
            scope,
            op,
            body,
            prefix,
        } => {
            let body = body
                .map(|b| parse_json_arg(&b))
                .transpose()?
                .unwrap_or(Value::Null);
            let publisher = scope_provider(conn, topic_prefix, None).publisher(scope, prefix);
            publisher.open().await?;
            let ctx = Context::new();
            let result = publisher.publish(&ctx, &op, body).await;
            publisher.close().await?;
            result?;

            Ok(format!(
                "{} {} on {} (cid: {})",
                "Published".green(),
                op.cyan(),
                publisher.topic(&op),
                ctx.correlation_id()
            ))
        }

        Commands::Subscribe { .. } => unreachable!(),
    }
}

/// Prints each event on `{prefix}{scope}.{op}` as a JSON line until Ctrl+C.
pub async fn subscribe(
    conn: Arc<dyn BrokerConnection>,
    topic_prefix: &str,
    scope: &str,
    prefix: &str,
    op: &str,
    queue: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = scope_provider(conn, topic_prefix, queue).subscriber(scope, prefix);
    let subscription = subscriber
        .subscribe(op, move |ctx: Context, body: Value| {
            let _ = tx.send(json!({
                "cid": ctx.correlation_id(),
                "headers": ctx.request_headers(),
                "body": body,
            }));
            async { Ok::<(), BoxError>(()) }
        })
        .await?;

    eprintln!(
        "{} {}{}",
        "Subscribed to".green(),
        topic_prefix,
        subscription.topic().cyan()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => println!("{}", event),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping subscription...".dimmed());
                break;
            }
        }
    }

    subscription.unsubscribe().await?;
    Ok(())
}

async fn open_client(
    conn: Arc<dyn BrokerConnection>,
    timeout: Duration,
) -> Result<Client, Box<dyn std::error::Error>> {
    let client = Client::with_config(conn, ClientConfig::new().with_request_timeout(timeout));
    client.open().await?;
    Ok(client)
}

fn scope_provider(
    conn: Arc<dyn BrokerConnection>,
    topic_prefix: &str,
    queue: Option<String>,
) -> ScopeProvider {
    let publishers = BrokerPublisherTransportFactory::new(conn.clone()).with_topic_prefix(topic_prefix);
    let mut subscribers = BrokerSubscriberTransportFactory::new(conn).with_topic_prefix(topic_prefix);
    if let Some(queue) = queue {
        subscribers = subscribers.with_queue_group(queue);
    }
    ScopeProvider::new(
        Arc::new(publishers),
        Arc::new(subscribers),
        Arc::new(JsonCodec::new()),
    )
}

/// Parses a `key=value` header argument.
pub fn parse_header(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("invalid header '{}', expected key=value", arg)),
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
