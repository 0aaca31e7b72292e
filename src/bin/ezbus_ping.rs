//! ezbus-ping: bus round-trip demo
//!
//! Subscribes to its own `Ping` messages, then alternates between sending
//! a ping to itself and publishing one, every second, until Ctrl-C.
//!
//! ## Configuration
//! - EZBUS_CONFIG: YAML config file (optional)
//! - EZBUS__AMQP__QUEUE: consume from RabbitMQ instead of the in-memory
//!   transport (requires the `amqp` feature)
//! - EZBUS_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(feature = "amqp")]
use ezbus::broker::AmqpBroker;
use ezbus::broker::{Broker, InMemoryBroker, InMemoryTransport};
use ezbus::config::Config;
use ezbus::router::HandlerError;
use ezbus::utils::bootstrap::init_tracing;
use ezbus::{Bus, Message, MessageDescriptor, MessageRouter};

const ENDPOINT: &str = "ezbus-ping";
const INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

impl Message for Ping {
    fn descriptor() -> MessageDescriptor {
        MessageDescriptor::new("Ping", "ezbus.diagnostics.Ping")
    }
}

#[cfg_attr(not(feature = "amqp"), allow(unused_variables))]
fn broker(config: &Config) -> Result<Arc<dyn Broker>, Box<dyn std::error::Error>> {
    #[cfg(feature = "amqp")]
    if config.amqp.queue.is_some() {
        return Ok(Arc::new(AmqpBroker::new(config.amqp.clone())?));
    }

    let transport = InMemoryTransport::new();
    Ok(Arc::new(InMemoryBroker::new(transport, ENDPOINT)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let broker = broker(&config)?;
    let endpoint = broker.endpoint().to_string();

    let mut router = MessageRouter::new();
    router.handle(|ping: Ping| async move {
        info!(seq = ping.seq, "Pong");
        Ok::<(), HandlerError>(())
    });

    let mut bus = Bus::new(broker, Arc::new(router)).with_config(config.bus);
    bus.enable_logger();
    bus.subscribe_message(endpoint.as_str(), Ping::descriptor().name)?;

    let bus = Arc::new(bus);
    let go = tokio::spawn({
        let bus = Arc::clone(&bus);
        async move { bus.go().await }
    });
    bus.ready().await?;

    info!(endpoint = %endpoint, "ezbus-ping started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(INTERVAL);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                seq += 1;
                let ping = Ping { seq };
                let result = if seq % 2 == 0 {
                    bus.publish(&ping).await
                } else {
                    bus.send(&endpoint, &ping).await
                };
                if let Err(e) = result {
                    warn!(seq, error = %e, "Failed to deliver ping");
                }
            }
        }
    }

    info!("Shutting down");
    bus.stop().await?;
    go.await??;

    Ok(())
}
