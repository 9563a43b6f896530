//! # busrpc-transport
//!
//! Broker plumbing for busrpc.
//!
//! This crate provides:
//! - The [`BrokerConnection`] abstraction over subject-routed brokers
//! - An in-process [`MemoryBroker`] with queue groups and wildcards
//! - A NATS adapter (feature `nats`) and durable AMQP transports (feature `amqp`)
//! - Publisher/subscriber transports with topic formatting and frame handling
//! - Scope providers for named pub/sub event streams

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;
pub mod error;
pub mod handler;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod publisher;
pub mod scope;
pub mod subscriber;
pub mod topic;

#[cfg(feature = "amqp")]
pub use amqp::{
    AmqpConfig, AmqpPublisherTransport, AmqpPublisherTransportFactory, AmqpSubscriberTransport,
    AmqpSubscriberTransportFactory,
};
pub use broker::{BrokerConnection, BrokerMessage, Subscription};
pub use error::TransportError;
pub use handler::{BoxError, MessageHandler};
pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsConnection;
pub use publisher::{
    BrokerPublisherTransport, BrokerPublisherTransportFactory, PublisherTransport,
    PublisherTransportFactory,
};
pub use scope::{EventHandler, ScopeProvider, ScopePublisher, ScopeSubscriber, ScopeSubscription};
pub use subscriber::{
    BrokerSubscriberTransport, BrokerSubscriberTransportFactory, SubscriberTransport,
    SubscriberTransportFactory,
};
pub use topic::TopicFormatter;
