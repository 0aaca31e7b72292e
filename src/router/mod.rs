//! Message-name keyed dispatch.
//!
//! The bus only relies on the [`Router`] contract: dispatch an envelope by
//! message name, and report a missing handler as
//! [`RouterError::HandlerNotFound`] so it can be discarded instead of
//! retried. [`MessageRouter`] is the in-process implementation.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::envelope::Envelope;
use crate::message::Message;
use crate::retry::Retryable;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`Router::receive`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// No handler is registered for the message name. Permanent.
    #[error("no handler registered for message '{message_name}'")]
    HandlerNotFound { message_name: String },

    /// A handler failed. The message is the handler's error text.
    #[error("{0}")]
    Handling(String),
}

impl RouterError {
    pub fn not_found(message_name: impl Into<String>) -> Self {
        Self::HandlerNotFound {
            message_name: message_name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HandlerNotFound { .. })
    }
}

impl Retryable for RouterError {
    fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }
}

/// Dispatches received envelopes to application handlers.
#[async_trait]
pub trait Router: Send + Sync {
    /// Dispatch `envelope` to the handlers registered for `message_name`.
    ///
    /// Must return [`RouterError::HandlerNotFound`] when nothing is
    /// registered under the name. Any other error is retried by the bus.
    async fn receive(&self, message_name: &str, envelope: &Envelope) -> Result<(), RouterError>;
}

/// Handler for envelopes routed by name.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(envelope))
    }
}

/// Handler that decodes the body into `M` before calling `f`.
struct TypedHandler<M, F> {
    f: F,
    _message: std::marker::PhantomData<fn() -> M>,
}

impl<M, F, Fut> MessageHandler for TypedHandler<M, F>
where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        match envelope.decode::<M>() {
            Ok(message) => Box::pin((self.f)(message)),
            Err(e) => {
                let err: HandlerError = format!("failed to decode body: {}", e).into();
                Box::pin(async move { Err(err) })
            }
        }
    }
}

/// In-process router keyed by message name.
///
/// Handlers are registered before the router is handed to a bus. All
/// handlers for a name run in registration order; the first failure is
/// reported after the rest have run. A panicking handler is reported as a
/// [`RouterError::Handling`] error.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `M`'s message name.
    pub fn handle<M, F, Fut>(&mut self, f: F) -> &mut Self
    where
        M: Message + DeserializeOwned,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = TypedHandler {
            f,
            _message: std::marker::PhantomData,
        };
        self.handle_raw(M::descriptor().name, handler)
    }

    /// Register an envelope-level handler under an explicit message name.
    pub fn handle_raw(
        &mut self,
        message_name: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        let message_name = message_name.into();
        debug!(message_name = %message_name, "Registered message handler");
        self.handlers
            .entry(message_name)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Number of handlers registered under `message_name`.
    pub fn handler_count(&self, message_name: &str) -> usize {
        self.handlers.get(message_name).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Router for MessageRouter {
    async fn receive(&self, message_name: &str, envelope: &Envelope) -> Result<(), RouterError> {
        let handlers = match self.handlers.get(message_name) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => return Err(RouterError::not_found(message_name)),
        };

        let envelope = Arc::new(envelope.clone());
        let mut first_error = None;

        for handler in handlers {
            let envelope = Arc::clone(&envelope);
            let outcome = AssertUnwindSafe(async move { handler.handle(envelope).await })
                .catch_unwind()
                .await;

            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => RouterError::Handling(e.to_string()),
                Err(panic) => {
                    RouterError::Handling(format!("handler panicked: {}", panic_message(&*panic)))
                }
            };
            error!(message_name = %message_name, error = %err, "Handler failed");
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
