//! Inbound dispatch.
//!
//! Runs the router under the retry policy and settles the outcome:
//! 1. success → `Ok`, the broker acknowledges
//! 2. no handler → logged and discarded, `Ok`
//! 3. retries exhausted → `Error` header set, forwarded to the error
//!    endpoint; only a failed forward is returned to the broker

use std::sync::Arc;

use futures::future::BoxFuture;

use super::logger::{BusEvent, BusLogger};
use crate::broker::{self, Broker, InboundHandler};
use crate::envelope::{headers, Envelope};
use crate::retry::RetryPolicy;
use crate::router::{Router, RouterError};

/// Inbound half of a bus. Holds no mutable state; safe to run
/// concurrently for different messages.
pub(crate) struct Dispatcher {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) retry: RetryPolicy,
    pub(crate) logger: Arc<dyn BusLogger>,
}

impl Dispatcher {
    pub(crate) async fn dispatch(&self, mut envelope: Envelope) -> broker::Result<()> {
        let message_name = envelope.message_name().to_string();

        let mut attempt = 0u32;
        let outcome = self
            .retry
            .execute(|| {
                attempt += 1;
                let attempt = attempt;
                let (router, logger) = (&self.router, &self.logger);
                let (envelope, message_name) = (&envelope, &message_name);
                async move {
                    let result = router.receive(message_name, envelope).await;
                    if let Err(ref e @ RouterError::Handling(_)) = result {
                        logger.log(&BusEvent::HandlerFailed {
                            message_name,
                            attempt,
                            error: &e.to_string(),
                        });
                    }
                    result
                }
            })
            .await;

        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(e @ RouterError::HandlerNotFound { .. }) => {
                self.logger.log(&BusEvent::Discarded {
                    message_name: &message_name,
                    reason: &e.to_string(),
                });
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        envelope.set_header(headers::ERROR, err.as_str());
        let error_endpoint = self.broker.error_endpoint();

        match self.broker.send(&error_endpoint, envelope).await {
            Ok(()) => {
                self.logger.log(&BusEvent::DeadLettered {
                    message_name: &message_name,
                    error_endpoint: &error_endpoint,
                    error: &err,
                });
                Ok(())
            }
            Err(e) => {
                self.logger.log(&BusEvent::DeadLetterFailed {
                    message_name: &message_name,
                    error_endpoint: &error_endpoint,
                    error: &e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// Shared handle registered with the broker.
pub(crate) struct DispatcherHandle(pub(crate) Arc<Dispatcher>);

impl InboundHandler for DispatcherHandle {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, broker::Result<()>> {
        let dispatcher = Arc::clone(&self.0);
        Box::pin(async move { dispatcher.dispatch(envelope).await })
    }
}
