//! # busrpc-server
//!
//! Concurrent request/reply server for busrpc.
//!
//! This crate provides:
//! - The [`Server`] runtime: subscriptions, admission, dispatch and replies
//! - A bounded [`WorkerPool`] behind the [`Executor`] trait
//! - Request lifecycle hooks and typed per-request properties
//! - The [`Processor`] boundary and a method-dispatch implementation
//! - Phaser-based shutdown coordination between `serve` and `stop`
//! - Prometheus metrics and YAML/env configuration

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod method;
pub mod metrics;
pub mod phaser;
pub mod processor;
pub mod properties;
pub mod server;

pub use config::{BrokerConfig, Config, ConfigError, MetricsConfig, ServerSection};
pub use error::ServerError;
pub use events::{DefaultServerEventHandler, ServerEventHandler};
pub use executor::{Executor, ExecutorError, Task, WorkerPool};
pub use method::{MethodError, MethodHandler, MethodProcessor};
pub use metrics::{run_metrics_server, Metrics};
pub use phaser::Phaser;
pub use processor::{OutputBuffer, Processor, ProcessorError};
pub use properties::{ReceivedAt, ReplyTo, RequestProperties, ServiceSubject};
pub use server::{Server, ServerConfig, ServerStats};
