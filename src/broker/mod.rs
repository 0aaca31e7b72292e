//! Transport bindings.
//!
//! This module contains:
//! - `Broker` trait: connection lifecycle, delivery and bindings
//! - `InboundHandler` trait: callback invoked once per received message
//! - Implementations: in-memory, AMQP (RabbitMQ), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::DEFAULT_ERROR_DELIMITER;
use crate::envelope::Envelope;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "memory")]
pub mod memory;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpBrokerConfig};
#[cfg(feature = "memory")]
pub use memory::{InMemoryBroker, InMemoryTransport};
pub use mock::{BrokerCall, MockBroker};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Broker not started")]
    NotStarted,

    #[error("Broker already started")]
    AlreadyStarted,
}

/// Callback a broker invokes for each inbound message.
///
/// `Ok` means the message was dealt with and may be acknowledged. `Err`
/// leaves acknowledgement policy (nack, requeue, drop) to the broker.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>>;
}

/// Interface to a message transport.
///
/// Implementations:
/// - `InMemoryBroker`: in-process queues and exchanges
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MockBroker`: call recorder for testing
///
/// `send` and `publish` may be called concurrently from several tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Begin consuming from this broker's endpoint, invoking `handler` once
    /// per message. Returns once consumption is established or has failed
    /// to start; consumption continues in the background until `stop`.
    async fn start(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;

    /// Release transport resources.
    async fn stop(&self) -> Result<()>;

    /// Point-to-point delivery to `destination`.
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<()>;

    /// Fan-out delivery to every subscriber of this endpoint.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Bind this endpoint to messages published by `endpoint`. An empty
    /// `message_name` binds every message.
    async fn subscribe(&self, endpoint: &str, message_name: &str) -> Result<()>;

    /// This broker's receiving address. Empty for send-only brokers.
    fn endpoint(&self) -> &str;

    /// Queue that failed messages are forwarded to. Brokers that declare
    /// their own error queue must report that exact name here.
    fn error_endpoint(&self) -> String {
        error_endpoint(self.endpoint(), DEFAULT_ERROR_DELIMITER)
    }
}

/// Name of the error endpoint paired with `endpoint`.
pub fn error_endpoint(endpoint: &str, delimiter: &str) -> String {
    format!("{}{}error", endpoint, delimiter)
}
