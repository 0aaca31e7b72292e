//! ezbus - transport-agnostic message bus
//!
//! Send and publish typed messages, dispatch inbound messages to handlers
//! by name, retry failed handling a bounded number of times and forward
//! what still fails to an error endpoint.
//!
//! The bus sits between two injected collaborators:
//! - a [`Broker`](broker::Broker) that owns the transport (in-memory,
//!   RabbitMQ, or a mock)
//! - a [`Router`](router::Router) that maps message names to handlers

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod message;
pub mod retry;
pub mod router;
pub mod subscription;
pub mod utils;

pub use bus::{Bus, BusError, BusState, ServiceBus};
pub use envelope::{Envelope, Headers};
pub use message::{Message, MessageDescriptor};
pub use router::{MessageRouter, Router, RouterError};
