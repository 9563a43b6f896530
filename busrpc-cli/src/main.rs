//! busrpc-cli - Command-line interface for busrpc
//!
//! Sends requests to busrpc services and publishes or watches scope events.

mod commands;

use busrpc_protocol::DEFAULT_TOPIC_PREFIX;
use busrpc_transport::{BrokerConnection, NatsConnection};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "busrpc-cli")]
#[command(about = "Command-line interface for busrpc services and scopes")]
#[command(version)]
struct Cli {
    /// NATS server URL
    #[arg(short = 's', long, env = "BUSRPC_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// Request and connection timeout in seconds
    #[arg(short, long, env = "BUSRPC_TIMEOUT", default_value = "5")]
    timeout: u64,

    /// Prefix applied to scope topics by the transport
    #[arg(long, default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Invoke an operation on a service and print the result
    Request {
        /// Service subject
        subject: String,

        /// Operation name
        op: String,

        /// Params JSON (or @file.json to read from file)
        #[arg(short, long)]
        params: Option<String>,

        /// Request header as key=value (repeatable)
        #[arg(short = 'H', long = "header", value_parser = commands::parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Ping a service
    Ping {
        /// Service subject
        subject: String,
    },

    /// Publish an event on a scope
    Publish {
        /// Scope name
        scope: String,

        /// Operation name
        op: String,

        /// Event body JSON (or @file.json to read from file)
        #[arg(short, long)]
        body: Option<String>,

        /// Scope prefix placed before the scope name
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Print events published on a scope until interrupted
    Subscribe {
        /// Scope name
        scope: String,

        /// Operation name
        op: String,

        /// Queue group to share events with other subscribers
        #[arg(short, long)]
        queue: Option<String>,

        /// Scope prefix placed before the scope name
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);

    let conn: Arc<dyn BrokerConnection> =
        match NatsConnection::connect_with_timeout(&cli.nats_url, timeout).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                eprintln!("{}: {}", "Connection failed".red(), e);
                std::process::exit(1);
            }
        };

    match cli.command {
        Commands::Subscribe {
            scope,
            op,
            queue,
            prefix,
        } => {
            // Streams events until Ctrl+C
            if let Err(e) =
                commands::subscribe(conn, &cli.topic_prefix, &scope, &prefix, &op, queue).await
            {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        cmd => {
            let result = commands::execute(conn.clone(), cmd, timeout, &cli.topic_prefix).await;
            if let Err(e) = conn.flush().await {
                tracing::warn!("Failed to flush connection: {}", e);
            }

            match result {
                Ok(output) => {
                    println!("{}", output);
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
