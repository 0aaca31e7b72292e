//! Mock broker implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{error_endpoint, Broker, BrokerError, InboundHandler, Result};
use crate::config::DEFAULT_ERROR_DELIMITER;
use crate::envelope::Envelope;

/// One recorded call into the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Start,
    Stop,
    Send {
        destination: String,
        envelope: Envelope,
    },
    Publish {
        envelope: Envelope,
    },
    Subscribe {
        endpoint: String,
        message_name: String,
    },
}

/// Mock broker recording every call in order.
pub struct MockBroker {
    endpoint: String,
    error_delimiter: String,
    calls: RwLock<Vec<BrokerCall>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    fail_on_start: RwLock<bool>,
    fail_send_to: RwLock<Option<String>>,
    fail_on_publish: RwLock<bool>,
}

impl MockBroker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            error_delimiter: DEFAULT_ERROR_DELIMITER.to_string(),
            calls: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            fail_on_start: RwLock::new(false),
            fail_send_to: RwLock::new(None),
            fail_on_publish: RwLock::new(false),
        }
    }

    /// Delimiter reported through `error_endpoint`.
    pub fn with_error_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.error_delimiter = delimiter.into();
        self
    }

    pub async fn set_fail_on_start(&self, fail: bool) {
        *self.fail_on_start.write().await = fail;
    }

    /// Make sends to `destination` fail. `None` clears.
    pub async fn set_fail_send_to(&self, destination: Option<&str>) {
        *self.fail_send_to.write().await = destination.map(str::to_string);
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.calls.read().await.clone()
    }

    /// Recorded `(destination, envelope)` pairs of `send` calls.
    pub async fn sends(&self) -> Vec<(String, Envelope)> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Send {
                    destination,
                    envelope,
                } => Some((destination.clone(), envelope.clone())),
                _ => None,
            })
            .collect()
    }

    /// Recorded envelopes of `publish` calls.
    pub async fn published(&self) -> Vec<Envelope> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish { envelope } => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded `(endpoint, message_name)` pairs of `subscribe` calls.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Subscribe {
                    endpoint,
                    message_name,
                } => Some((endpoint.clone(), message_name.clone())),
                _ => None,
            })
            .collect()
    }

    /// Deliver an inbound message through the handler passed to `start`.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotStarted)?;
        handler.handle(envelope).await
    }

    async fn record(&self, call: BrokerCall) {
        self.calls.write().await.push(call);
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn start(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        self.record(BrokerCall::Start).await;
        if *self.fail_on_start.read().await {
            return Err(BrokerError::Connection("Mock start failure".to_string()));
        }
        *self.handler.write().await = Some(handler);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record(BrokerCall::Stop).await;
        *self.handler.write().await = None;
        Ok(())
    }

    async fn send(&self, destination: &str, envelope: Envelope) -> Result<()> {
        self.record(BrokerCall::Send {
            destination: destination.to_string(),
            envelope,
        })
        .await;
        if self.fail_send_to.read().await.as_deref() == Some(destination) {
            return Err(BrokerError::Send(format!(
                "Mock send failure to {}",
                destination
            )));
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.record(BrokerCall::Publish { envelope }).await;
        if *self.fail_on_publish.read().await {
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, endpoint: &str, message_name: &str) -> Result<()> {
        self.record(BrokerCall::Subscribe {
            endpoint: endpoint.to_string(),
            message_name: message_name.to_string(),
        })
        .await;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn error_endpoint(&self) -> String {
        error_endpoint(&self.endpoint, &self.error_delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Headers;
    use futures::future::BoxFuture;

    struct AcceptAll;
    impl InboundHandler for AcceptAll {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_mock_records_calls_in_order() {
        let broker = MockBroker::new("orders");
        broker.start(Arc::new(AcceptAll)).await.unwrap();
        broker.subscribe("billing", "").await.unwrap();
        broker.send("billing", Envelope::default()).await.unwrap();
        broker.publish(Envelope::default()).await.unwrap();
        broker.stop().await.unwrap();

        let calls = broker.calls().await;
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[0], BrokerCall::Start);
        assert_eq!(calls[4], BrokerCall::Stop);
        assert_eq!(broker.subscriptions().await, vec![("billing".to_string(), String::new())]);
        assert_eq!(broker.sends().await.len(), 1);
        assert_eq!(broker.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_fail_send_to_destination() {
        let broker = MockBroker::new("orders");
        broker.set_fail_send_to(Some("bad")).await;

        assert!(broker.send("good", Envelope::default()).await.is_ok());
        assert!(matches!(
            broker.send("bad", Envelope::default()).await,
            Err(BrokerError::Send(_))
        ));
        // Failed sends are still recorded.
        assert_eq!(broker.sends().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_deliver_requires_start() {
        let broker = MockBroker::new("orders");
        let envelope = Envelope::new(Headers::new(), Vec::new());
        assert_eq!(
            broker.deliver(envelope.clone()).await,
            Err(BrokerError::NotStarted)
        );

        broker.start(Arc::new(AcceptAll)).await.unwrap();
        assert_eq!(broker.deliver(envelope).await, Ok(()));
    }
}
