//! Logging port for the bus core.
//!
//! The bus reports what it does through a [`BusLogger`] handed to it at
//! construction. The default [`NoopLogger`] discards everything;
//! [`TracingLogger`] forwards to `tracing` with structured fields.

use tracing::{debug, error, info, warn};

/// Something worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent<'a> {
    /// Broker started for `endpoint`.
    Started { endpoint: &'a str },
    /// A registered subscription was applied to the broker.
    Subscribed {
        endpoint: &'a str,
        message_name: &'a str,
    },
    /// Startup finished; the bus is consuming.
    Running {
        endpoint: &'a str,
        subscriptions: usize,
    },
    /// `go` returned after shutdown.
    Parked,
    /// Broker resources released.
    Stopped,
    /// One handling attempt failed and may be retried.
    HandlerFailed {
        message_name: &'a str,
        attempt: u32,
        error: &'a str,
    },
    /// Message had no handler and was dropped.
    Discarded {
        message_name: &'a str,
        reason: &'a str,
    },
    /// Message exhausted its retries and was forwarded to the error endpoint.
    DeadLettered {
        message_name: &'a str,
        error_endpoint: &'a str,
        error: &'a str,
    },
    /// Forwarding to the error endpoint failed.
    DeadLetterFailed {
        message_name: &'a str,
        error_endpoint: &'a str,
        error: &'a str,
    },
    /// Host name could not be resolved; `SendingHost` omitted.
    HostnameUnavailable { error: &'a str },
}

/// Sink for [`BusEvent`]s. Must not block.
pub trait BusLogger: Send + Sync {
    fn log(&self, event: &BusEvent<'_>);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl BusLogger for NoopLogger {
    fn log(&self, _event: &BusEvent<'_>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl BusLogger for TracingLogger {
    fn log(&self, event: &BusEvent<'_>) {
        match *event {
            BusEvent::Started { endpoint } => info!(endpoint = %endpoint, "Broker started"),
            BusEvent::Subscribed {
                endpoint,
                message_name,
            } => info!(endpoint = %endpoint, message_name = %message_name, "Subscribed"),
            BusEvent::Running {
                endpoint,
                subscriptions,
            } => info!(endpoint = %endpoint, subscriptions, "Bus is on the go"),
            BusEvent::Parked => info!("Bus is parked"),
            BusEvent::Stopped => info!("Bus stopped"),
            BusEvent::HandlerFailed {
                message_name,
                attempt,
                error,
            } => warn!(message_name = %message_name, attempt, error = %error, "Handler failed"),
            BusEvent::Discarded {
                message_name,
                reason,
            } => warn!(message_name = %message_name, reason = %reason, "Message discarded"),
            BusEvent::DeadLettered {
                message_name,
                error_endpoint,
                error,
            } => error!(
                message_name = %message_name,
                error_endpoint = %error_endpoint,
                error = %error,
                "Failed to handle message, forwarded to error endpoint"
            ),
            BusEvent::DeadLetterFailed {
                message_name,
                error_endpoint,
                error,
            } => error!(
                message_name = %message_name,
                error_endpoint = %error_endpoint,
                error = %error,
                "Failed to forward message to error endpoint"
            ),
            BusEvent::HostnameUnavailable { error } => {
                debug!(error = %error, "Host name unavailable, omitting SendingHost")
            }
        }
    }
}
