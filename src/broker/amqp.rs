//! AMQP (RabbitMQ) broker implementation.
//!
//! Topology per endpoint:
//! - durable queue named after the endpoint (consumed)
//! - durable error queue `<endpoint><delimiter>error`
//! - durable topic exchange named after the endpoint (published to)
//!
//! `send` uses the default exchange with the destination as routing key.
//! `publish` uses the endpoint's exchange with the MessageName header as
//! routing key. `subscribe` binds this queue to another endpoint's exchange;
//! an empty message name binds with `#`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{error_endpoint, Broker, BrokerError, InboundHandler, Result};
use crate::codec::CONTENT_TYPE;
use crate::envelope::{Envelope, Headers};

pub use crate::config::AmqpBrokerConfig;

/// Binding key matching every message on a topic exchange.
const WILDCARD_BINDING: &str = "#";

/// Consumer tag announced to the server.
const CONSUMER_TAG: &str = "ezbus-consumer";

struct Consumer {
    channel: Channel,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Broker state after `start`. Send-only brokers have no consumer.
struct Running {
    consumer: Option<Consumer>,
}

/// AMQP broker using RabbitMQ.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpBrokerConfig,
    running: Mutex<Option<Running>>,
}

impl AmqpBroker {
    /// Create a broker. No connection is made until `start`.
    pub fn new(config: AmqpBrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        Ok(Self {
            pool,
            config,
            running: Mutex::new(None),
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_queue(channel: &Channel, name: &str) -> Result<()> {
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to declare queue {}: {}", name, e)))?;

        info!(
            queue = %name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    /// Declare the endpoint topology and start consuming.
    async fn setup_consumer(&self, queue: &str, handler: Arc<dyn InboundHandler>) -> Result<Consumer> {
        let channel = self.get_channel().await?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to set QoS: {}", e)))?;

        Self::declare_queue(&channel, queue).await?;
        Self::declare_queue(&channel, &Broker::error_endpoint(self)).await?;

        channel
            .exchange_declare(
                queue,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to declare exchange: {}", e)))?;
        info!(exchange = %queue, "Exchange declared");

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to start consumer: {}", e)))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::consume(
            consumer,
            handler,
            shutdown_rx,
            queue.to_string(),
        ));

        Ok(Consumer {
            channel,
            shutdown,
            task,
        })
    }

    async fn consume(
        mut consumer: lapin::Consumer,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: watch::Receiver<bool>,
        queue: String,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => Self::process_delivery(delivery, &handler).await,
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error");
                        break;
                    }
                    None => {
                        info!(queue = %queue, "Consumer stream ended");
                        break;
                    }
                }
            }
        }
    }

    /// Hand one delivery to the handler; ack on success, nack with requeue
    /// on failure.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: &Arc<dyn InboundHandler>) {
        let headers = extract_headers(delivery.properties.headers().as_ref());
        let envelope = Envelope::new(headers, delivery.data.clone());
        let message_name = envelope.message_name().to_string();

        debug!(
            routing_key = %delivery.routing_key,
            message_name = %message_name,
            "Received message"
        );

        match handler.handle(envelope).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                warn!(message_name = %message_name, error = %e, "Handler failed, requeueing");
                let options = BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                };
                if let Err(e) = delivery.nack(options).await {
                    error!(error = %e, "Failed to nack message");
                }
            }
        }
    }

    async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> std::result::Result<(), String> {
        let channel = self.get_channel().await.map_err(|e| e.to_string())?;

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(2) // persistent
            .with_headers(to_field_table(&envelope.headers));

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| format!("Failed to publish: {}", e))?;

        confirm
            .await
            .map_err(|e| format!("Publish confirmation failed: {}", e))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BrokerError::AlreadyStarted);
        }

        let consumer = match self.config.queue.as_deref() {
            Some(queue) if !queue.is_empty() => Some(self.setup_consumer(queue, handler).await?),
            _ => {
                // Verify connectivity for send-only brokers.
                let channel = self.get_channel().await?;
                let _ = channel.close(200, "connectivity check").await;
                None
            }
        };
        *running = Some(Running { consumer });

        info!(url = %self.config.url, endpoint = %self.endpoint(), "RabbitMQ broker started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(BrokerError::NotStarted)?;

        if let Some(consumer) = running.consumer {
            let _ = consumer.shutdown.send(true);
            if let Err(e) = consumer.task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
            consumer
                .channel
                .close(200, "broker stopped")
                .await
                .map_err(|e| BrokerError::Connection(format!("Channel close: {}", e)))?;
        }
        self.pool.close();

        info!("RabbitMQ broker stopped");
        Ok(())
    }

    async fn send(&self, destination: &str, envelope: Envelope) -> Result<()> {
        self.publish_to("", destination, envelope)
            .await
            .map_err(BrokerError::Send)
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let routing_key = envelope.message_name().to_string();
        self.publish_to(self.endpoint(), &routing_key, envelope)
            .await
            .map_err(BrokerError::Publish)
    }

    async fn subscribe(&self, endpoint: &str, message_name: &str) -> Result<()> {
        let queue = self.endpoint();
        if queue.is_empty() {
            return Err(BrokerError::Subscribe(
                "send-only broker has no queue to bind".to_string(),
            ));
        }

        let routing_key = if message_name.is_empty() {
            WILDCARD_BINDING
        } else {
            message_name
        };

        let channel = self.get_channel().await?;
        channel
            .queue_bind(
                queue,
                endpoint,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            exchange = %endpoint,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    fn endpoint(&self) -> &str {
        self.config.queue.as_deref().unwrap_or_default()
    }

    fn error_endpoint(&self) -> String {
        error_endpoint(self.endpoint(), &self.config.error_delimiter)
    }
}

/// Encode envelope headers as an AMQP header table.
fn to_field_table(headers: &Headers) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(v.clone().into()),
            )
        })
        .collect();
    FieldTable::from(table)
}

/// Decode an AMQP header table. Values that are not strings are skipped.
fn extract_headers(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        };
        match value {
            Some(v) => {
                headers.insert(key.as_str().to_string(), v);
            }
            None => debug!(header = %key.as_str(), "Skipping non-string header"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::headers;

    #[test]
    fn test_header_table_round_trip() {
        let mut h = Headers::new();
        h.insert(headers::MESSAGE_NAME.to_string(), "OrderPlaced".to_string());
        h.insert(headers::DESTINATION.to_string(), "billing".to_string());

        let table = to_field_table(&h);
        assert_eq!(table.inner().len(), 2);
        assert_eq!(extract_headers(Some(&table)), h);
    }

    #[test]
    fn test_non_string_headers_skipped() {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from("MessageName".to_string()),
            AMQPValue::LongString("Ping".to_string().into()),
        );
        table.insert(
            ShortString::from("x-death-count".to_string()),
            AMQPValue::LongLongInt(3),
        );

        let headers = extract_headers(Some(&FieldTable::from(table)));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("MessageName").map(String::as_str), Some("Ping"));
    }

    #[test]
    fn test_missing_table_is_empty() {
        assert!(extract_headers(None).is_empty());
    }

    #[test]
    fn test_send_only_endpoint_is_empty() {
        let broker = AmqpBroker::new(AmqpBrokerConfig::default()).unwrap();
        assert_eq!(broker.endpoint(), "");

        let broker = AmqpBroker::new(AmqpBrokerConfig::for_queue("orders")).unwrap();
        assert_eq!(broker.endpoint(), "orders");
    }

    #[test]
    fn test_error_endpoint_follows_config() {
        let broker = AmqpBroker::new(AmqpBrokerConfig::for_queue("orders")).unwrap();
        assert_eq!(broker.error_endpoint(), "orders.error");

        let config = AmqpBrokerConfig {
            error_delimiter: "-".to_string(),
            ..AmqpBrokerConfig::for_queue("orders")
        };
        let broker = AmqpBroker::new(config).unwrap();
        assert_eq!(broker.error_endpoint(), "orders-error");
    }
}
