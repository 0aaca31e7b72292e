//! In-memory broker for standalone mode and tests.
//!
//! A shared [`InMemoryTransport`] plays the role of the message server:
//! - every started endpoint owns a queue, an error queue and an exchange
//!   named after it
//! - `send` enqueues directly on the destination queue
//! - `publish` routes through the publisher's exchange by message name;
//!   an empty binding key matches every message
//!
//! Each queue receives a routed message at most once, whatever the number
//! of matching bindings. Handler failures are logged and the message is
//! dropped (negative acknowledgement without requeue).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{error_endpoint, Broker, BrokerError, InboundHandler, Result};
use crate::config::DEFAULT_ERROR_DELIMITER;
use crate::envelope::Envelope;

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    async fn push(&self, envelope: Envelope) {
        self.messages.lock().await.push_back(envelope);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.messages.lock().await.pop_front() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    key: String,
}

impl Binding {
    fn matches(&self, message_name: &str) -> bool {
        self.key.is_empty() || self.key == message_name
    }
}

/// Shared in-process message server.
#[derive(Default)]
pub struct InMemoryTransport {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    bindings: RwLock<HashMap<String, Vec<Binding>>>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare a queue. Idempotent.
    pub async fn declare_queue(&self, name: &str) {
        self.queues
            .write()
            .await
            .entry(name.to_string())
            .or_default();
    }

    /// Remove and return every message waiting on `queue`.
    pub async fn drain(&self, queue: &str) -> Vec<Envelope> {
        match self.queue(queue).await {
            Some(q) => q.messages.lock().await.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Number of messages waiting on `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        match self.queue(queue).await {
            Some(q) => q.messages.lock().await.len(),
            None => 0,
        }
    }

    async fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    async fn enqueue(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let q = self
            .queue(queue)
            .await
            .ok_or_else(|| BrokerError::UnknownEndpoint(queue.to_string()))?;
        q.push(envelope).await;
        Ok(())
    }

    async fn bind(&self, exchange: &str, queue: &str, key: &str) {
        self.bindings
            .write()
            .await
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                queue: queue.to_string(),
                key: key.to_string(),
            });
    }

    /// Deliver to every queue bound to `exchange` for the message name.
    /// Returns the number of queues reached.
    async fn route(&self, exchange: &str, envelope: Envelope) -> usize {
        let message_name = envelope.message_name().to_string();
        let mut targets: Vec<String> = self
            .bindings
            .read()
            .await
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.matches(&message_name))
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();
        targets.sort();
        targets.dedup();

        let mut delivered = 0;
        for target in targets {
            if let Some(q) = self.queue(&target).await {
                q.push(envelope.clone()).await;
                delivered += 1;
            }
        }
        delivered
    }
}

struct Consumer {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Broker bound to one endpoint of an [`InMemoryTransport`].
pub struct InMemoryBroker {
    transport: Arc<InMemoryTransport>,
    endpoint: String,
    error_delimiter: String,
    consumer: Mutex<Option<Consumer>>,
}

impl InMemoryBroker {
    /// Broker receiving on `endpoint`.
    pub fn new(transport: Arc<InMemoryTransport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            error_delimiter: DEFAULT_ERROR_DELIMITER.to_string(),
            consumer: Mutex::new(None),
        }
    }

    /// Broker that only sends and publishes.
    pub fn send_only(transport: Arc<InMemoryTransport>) -> Self {
        Self::new(transport, String::new())
    }

    /// Delimiter used when declaring the error queue.
    pub fn with_error_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.error_delimiter = delimiter.into();
        self
    }

    pub fn transport(&self) -> &Arc<InMemoryTransport> {
        &self.transport
    }

    fn spawn_consumer(
        &self,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: watch::Receiver<bool>,
        queue: Arc<Queue>,
    ) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    envelope = queue.pop() => {
                        let message_name = envelope.message_name().to_string();
                        debug!(endpoint = %endpoint, message_name = %message_name, "Received message");
                        if let Err(e) = handler.handle(envelope).await {
                            warn!(
                                endpoint = %endpoint,
                                message_name = %message_name,
                                error = %e,
                                "Handler rejected message, dropping"
                            );
                        }
                    }
                }
            }
            info!(endpoint = %endpoint, "In-memory consumer stopped");
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn start(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(BrokerError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);

        if self.endpoint.is_empty() {
            *consumer = Some(Consumer {
                shutdown,
                task: None,
            });
            info!("In-memory broker started (send-only)");
            return Ok(());
        }

        self.transport.declare_queue(&self.endpoint).await;
        self.transport
            .declare_queue(&Broker::error_endpoint(self))
            .await;
        let queue = self
            .transport
            .queue(&self.endpoint)
            .await
            .ok_or_else(|| BrokerError::UnknownEndpoint(self.endpoint.clone()))?;

        let task = self.spawn_consumer(handler, shutdown_rx, queue);
        *consumer = Some(Consumer {
            shutdown,
            task: Some(task),
        });

        info!(endpoint = %self.endpoint, "In-memory broker started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .await
            .take()
            .ok_or(BrokerError::NotStarted)?;

        let _ = consumer.shutdown.send(true);
        if let Some(task) = consumer.task {
            if let Err(e) = task.await {
                warn!(endpoint = %self.endpoint, error = %e, "Consumer task ended abnormally");
            }
        }
        Ok(())
    }

    async fn send(&self, destination: &str, envelope: Envelope) -> Result<()> {
        self.transport.enqueue(destination, envelope).await?;
        debug!(destination = %destination, "Sent message");
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(BrokerError::Publish(
                "send-only broker has no exchange to publish on".to_string(),
            ));
        }
        let message_name = envelope.message_name().to_string();
        let delivered = self.transport.route(&self.endpoint, envelope).await;
        debug!(
            exchange = %self.endpoint,
            message_name = %message_name,
            queues = delivered,
            "Published message"
        );
        Ok(())
    }

    async fn subscribe(&self, endpoint: &str, message_name: &str) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(BrokerError::Subscribe(
                "send-only broker has no queue to bind".to_string(),
            ));
        }
        self.transport
            .bind(endpoint, &self.endpoint, message_name)
            .await;
        debug!(
            exchange = %endpoint,
            queue = %self.endpoint,
            message_name = %message_name,
            "Bound queue to exchange"
        );
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
    use crate::envelope::{headers, Headers};
    use futures::future::BoxFuture;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn named(name: &str) -> Envelope {
        let mut h = Headers::new();
        h.insert(headers::MESSAGE_NAME.to_string(), name.to_string());
        Envelope::new(h, b"{}".to_vec())
    }

    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<Envelope>,
        fail: bool,
    }

    impl InboundHandler for ForwardingHandler {
        fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
            let _ = self.tx.send(envelope);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(BrokerError::Send("downstream".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn forwarding(fail: bool) -> (Arc<dyn InboundHandler>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ForwardingHandler { tx, fail }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed")
    }

    #[tokio::test]
    async fn test_start_declares_queue_and_error_queue() {
        let transport = InMemoryTransport::new();
        let broker = InMemoryBroker::new(transport.clone(), "orders").with_error_delimiter("-");
        let (handler, _rx) = forwarding(false);
        assert_eq!(broker.error_endpoint(), "orders-error");
        broker.start(handler).await.unwrap();

        broker.send("orders-error", named("X")).await.unwrap();
        assert_eq!(transport.depth("orders-error").await, 1);
        assert!(matches!(
            broker.send("orders.error", named("X")).await,
            Err(BrokerError::UnknownEndpoint(_))
        ));
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_delivers_to_consumer() {
        let transport = InMemoryTransport::new();
        let receiver = InMemoryBroker::new(transport.clone(), "billing");
        let sender = InMemoryBroker::send_only(transport.clone());
        let (handler, mut rx) = forwarding(false);
        receiver.start(handler).await.unwrap();

        sender.send("billing", named("Invoice")).await.unwrap();

        assert_eq!(recv(&mut rx).await.message_name(), "Invoice");
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_endpoint_fails() {
        let broker = InMemoryBroker::send_only(InMemoryTransport::new());
        let err = broker.send("nowhere", named("X")).await.unwrap_err();
        assert_eq!(err, BrokerError::UnknownEndpoint("nowhere".to_string()));
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding() {
        let transport = InMemoryTransport::new();
        let publisher = InMemoryBroker::new(transport.clone(), "orders");
        let narrow = InMemoryBroker::new(transport.clone(), "shipping");
        let wide = InMemoryBroker::new(transport.clone(), "audit");
        for b in [&publisher, &narrow, &wide] {
            transport.declare_queue(b.endpoint()).await;
        }

        narrow.subscribe("orders", "OrderPlaced").await.unwrap();
        wide.subscribe("orders", "").await.unwrap();

        publisher.publish(named("OrderPlaced")).await.unwrap();
        publisher.publish(named("OrderCancelled")).await.unwrap();

        assert_eq!(transport.depth("shipping").await, 1);
        assert_eq!(transport.depth("audit").await, 2);
        assert_eq!(transport.depth("orders").await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_bindings_deliver_once() {
        let transport = InMemoryTransport::new();
        let publisher = InMemoryBroker::new(transport.clone(), "orders");
        let subscriber = InMemoryBroker::new(transport.clone(), "shipping");
        transport.declare_queue("shipping").await;

        subscriber.subscribe("orders", "OrderPlaced").await.unwrap();
        subscriber.subscribe("orders", "OrderPlaced").await.unwrap();
        subscriber.subscribe("orders", "").await.unwrap();

        publisher.publish(named("OrderPlaced")).await.unwrap();
        assert_eq!(transport.depth("shipping").await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = InMemoryBroker::new(InMemoryTransport::new(), "lonely");
        broker.publish(named("Anything")).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_only_cannot_publish_or_subscribe() {
        let broker = InMemoryBroker::send_only(InMemoryTransport::new());
        assert!(matches!(
            broker.publish(named("X")).await,
            Err(BrokerError::Publish(_))
        ));
        assert!(matches!(
            broker.subscribe("orders", "").await,
            Err(BrokerError::Subscribe(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_drops_message_and_continues() {
        let transport = InMemoryTransport::new();
        let broker = InMemoryBroker::new(transport.clone(), "q");
        let (handler, mut rx) = forwarding(true);
        broker.start(handler).await.unwrap();

        broker.send("q", named("First")).await.unwrap();
        broker.send("q", named("Second")).await.unwrap();

        assert_eq!(recv(&mut rx).await.message_name(), "First");
        assert_eq!(recv(&mut rx).await.message_name(), "Second");
        broker.stop().await.unwrap();
        assert_eq!(transport.depth("q").await, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let broker = InMemoryBroker::new(InMemoryTransport::new(), "q");
        assert_eq!(broker.stop().await, Err(BrokerError::NotStarted));

        let (handler, _rx) = forwarding(false);
        broker.start(handler.clone()).await.unwrap();
        assert_eq!(broker.start(handler).await, Err(BrokerError::AlreadyStarted));
        broker.stop().await.unwrap();
        assert_eq!(broker.stop().await, Err(BrokerError::NotStarted));
    }

    #[tokio::test]
    async fn test_messages_wait_after_stop() {
        let transport = InMemoryTransport::new();
        let broker = InMemoryBroker::new(transport.clone(), "q");
        let (handler, _rx) = forwarding(false);
        broker.start(handler).await.unwrap();
        broker.stop().await.unwrap();

        broker.send("q", named("Late")).await.unwrap();
        let drained = transport.drain("q").await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message_name(), "Late");
    }
}
