//! Bus orchestrator.
//!
//! This module contains:
//! - `Bus`: outbound send/publish, subscription replay, inbound dispatch
//! - Capability traits (`StarterStopper`, `Sender`, `Publisher`,
//!   `Subscriber`, `EnableLogger`) and their union `ServiceBus`
//! - `HeaderBuilder`: outbound header construction
//! - `BusLogger`: injected logging port
//!
//! The bus owns no transport. Everything on the wire goes through the
//! injected [`Broker`]; everything inbound is dispatched through the
//! injected [`Router`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::broker::{Broker, BrokerError};
use crate::codec;
use crate::config::BusConfig;
use crate::envelope::Envelope;
use crate::message::Message;
use crate::router::{MessageRouter, Router};
use crate::subscription::SubscriptionRegistry;

mod dispatch;
pub mod headers;
pub mod logger;

use dispatch::{Dispatcher, DispatcherHandle};

// Re-exports
pub use headers::{HeaderBuilder, HostResolver, SystemHost};
pub use logger::{BusEvent, BusLogger, NoopLogger, TracingLogger};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("Broker failed to start: {0}")]
    Start(#[source] BrokerError),

    #[error("Subscription failed: {0}")]
    Subscribe(#[source] BrokerError),

    #[error("Bus is not running")]
    NotStarted,

    #[error("Bus already started")]
    AlreadyStarted,
}

// ============================================================================
// Capabilities
// ============================================================================

/// Lifecycle control.
#[async_trait]
pub trait StarterStopper: Send + Sync {
    /// Start consuming and wait until stopped.
    async fn go(&self) -> Result<()>;

    /// Stop consuming and release the transport.
    async fn stop(&self) -> Result<()>;
}

/// Point-to-point delivery.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send<M: Message>(&self, destination: &str, message: &M) -> Result<()>;
}

/// Fan-out delivery.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish<M: Message>(&self, message: &M) -> Result<()>;
}

/// Subscription registration, before start.
pub trait Subscriber {
    /// Subscribe to every message published by `endpoint`.
    fn subscribe(&mut self, endpoint: &str) -> Result<()>;

    /// Subscribe to `message_name` messages published by `endpoint`.
    fn subscribe_message(&mut self, endpoint: &str, message_name: &str) -> Result<()>;
}

/// Switch the bus to `tracing` output.
pub trait EnableLogger {
    fn enable_logger(&mut self);
}

/// The full capability set.
pub trait ServiceBus: StarterStopper + Sender + Publisher + Subscriber + EnableLogger {}

impl<T> ServiceBus for T where T: StarterStopper + Sender + Publisher + Subscriber + EnableLogger {}

// ============================================================================
// Bus
// ============================================================================

/// Lifecycle state of a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Accepting subscriptions; `go` not yet called.
    Idle,
    /// `go` is starting the broker and replaying subscriptions.
    Starting,
    /// Consuming.
    Running,
    /// `stop` is releasing the broker.
    Stopping,
    /// Terminal.
    Stopped,
}

/// Message bus over an injected broker and router.
///
/// ```ignore
/// let mut router = MessageRouter::new();
/// router.handle(|order: OrderPlaced| async move { ship(order).await });
///
/// let mut bus = Bus::new(broker, Arc::new(router));
/// bus.subscribe("orders")?;
///
/// let bus = Arc::new(bus);
/// tokio::spawn({
///     let bus = bus.clone();
///     async move { bus.go().await }
/// });
/// bus.ready().await?;
/// bus.send("billing", &Invoice { .. }).await?;
/// bus.stop().await?;
/// ```
pub struct Bus {
    broker: Arc<dyn Broker>,
    router: Arc<dyn Router>,
    subscriptions: SubscriptionRegistry,
    config: BusConfig,
    header_builder: HeaderBuilder,
    logger: Arc<dyn BusLogger>,
    state: watch::Sender<BusState>,
}

impl Bus {
    pub fn new(broker: Arc<dyn Broker>, router: Arc<dyn Router>) -> Self {
        let (state, _) = watch::channel(BusState::Idle);
        Self {
            broker,
            router,
            subscriptions: SubscriptionRegistry::new(),
            config: BusConfig::default(),
            header_builder: HeaderBuilder::default(),
            logger: Arc::new(NoopLogger),
            state,
        }
    }

    /// Bus that can only send and publish. The broker is started at once
    /// and the bus is left running; inbound messages have no handlers.
    pub async fn send_only(broker: Arc<dyn Broker>) -> Result<Self> {
        let bus = Self::new(broker, Arc::new(MessageRouter::new()));
        bus.state.send_replace(BusState::Starting);

        if let Err(e) = bus.broker.start(bus.inbound_handler()).await {
            bus.state.send_replace(BusState::Stopped);
            return Err(BusError::Start(e));
        }

        bus.state.send_replace(BusState::Running);
        bus.logger.log(&BusEvent::Started {
            endpoint: bus.broker.endpoint(),
        });
        Ok(bus)
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn BusLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_header_builder(mut self, header_builder: HeaderBuilder) -> Self {
        self.header_builder = header_builder;
        self
    }

    pub fn state(&self) -> BusState {
        *self.state.borrow()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Receiving address of the underlying broker.
    pub fn endpoint(&self) -> &str {
        self.broker.endpoint()
    }

    /// Resolves once `go` has finished starting. Errors if the bus stopped
    /// or failed to start instead.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, BusState::Running | BusState::Stopping | BusState::Stopped))
            .await
            .map(|s| *s)
            .map_err(|_| BusError::NotStarted)?;
        match state {
            BusState::Running => Ok(()),
            _ => Err(BusError::NotStarted),
        }
    }

    /// Start the broker, replay subscriptions in registration order, then
    /// wait until [`Bus::stop`] is called.
    pub async fn go(&self) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == BusState::Idle {
                *state = BusState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BusError::AlreadyStarted);
        }

        if let Err(e) = self.broker.start(self.inbound_handler()).await {
            self.state.send_replace(BusState::Stopped);
            return Err(BusError::Start(e));
        }
        let endpoint = self.broker.endpoint();
        self.logger.log(&BusEvent::Started { endpoint });

        for subscription in self.subscriptions.iter() {
            if let Err(e) = self
                .broker
                .subscribe(&subscription.endpoint, &subscription.message_name)
                .await
            {
                // The broker is already consuming; release it before bailing.
                if self.broker.stop().await.is_ok() {
                    self.logger.log(&BusEvent::Stopped);
                }
                self.state.send_replace(BusState::Stopped);
                return Err(BusError::Subscribe(e));
            }
            self.logger.log(&BusEvent::Subscribed {
                endpoint: &subscription.endpoint,
                message_name: &subscription.message_name,
            });
        }

        let mut rx = self.state.subscribe();
        self.state.send_if_modified(|state| {
            if *state == BusState::Starting {
                *state = BusState::Running;
                true
            } else {
                false
            }
        });
        self.logger.log(&BusEvent::Running {
            endpoint,
            subscriptions: self.subscriptions.len(),
        });

        // The sender lives in `self`, so this only resolves on `Stopped`.
        let _ = rx.wait_for(|s| *s == BusState::Stopped).await;

        self.logger.log(&BusEvent::Parked);
        Ok(())
    }

    /// Stop a running bus. Fails without touching the broker if the bus is
    /// not running. Called while [`Bus::go`] is still starting, it waits
    /// for startup to settle first.
    pub async fn stop(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != BusState::Starting).await;

        let claimed = self.state.send_if_modified(|state| {
            if *state == BusState::Running {
                *state = BusState::Stopping;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BusError::NotStarted);
        }

        let result = self.broker.stop().await;
        self.state.send_replace(BusState::Stopped);

        result?;
        self.logger.log(&BusEvent::Stopped);
        Ok(())
    }

    /// Serialize `message` and deliver it to `destination`. Single attempt.
    pub async fn send<M: Message>(&self, destination: &str, message: &M) -> Result<()> {
        let body = codec::encode(message)?;
        let headers =
            self.header_builder
                .build(M::descriptor(), Some(destination), self.logger.as_ref());
        self.broker
            .send(destination, Envelope::new(headers, body))
            .await?;
        Ok(())
    }

    /// Serialize `message` and publish it to this endpoint's subscribers.
    /// Single attempt.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        let body = codec::encode(message)?;
        let headers = self
            .header_builder
            .build(M::descriptor(), None, self.logger.as_ref());
        self.broker.publish(Envelope::new(headers, body)).await?;
        Ok(())
    }

    /// Subscribe to every message published by `endpoint`.
    pub fn subscribe(&mut self, endpoint: impl Into<String>) -> Result<()> {
        self.ensure_idle()?;
        self.subscriptions.subscribe(endpoint);
        Ok(())
    }

    /// Subscribe to `message_name` messages published by `endpoint`.
    pub fn subscribe_message(
        &mut self,
        endpoint: impl Into<String>,
        message_name: impl Into<String>,
    ) -> Result<()> {
        self.ensure_idle()?;
        self.subscriptions.subscribe_message(endpoint, message_name);
        Ok(())
    }

    /// Route logging to `tracing`.
    pub fn enable_logger(&mut self) {
        self.logger = Arc::new(TracingLogger);
    }

    /// Run one inbound message through retry, discard and dead-letter
    /// handling, exactly as the broker callback does.
    pub async fn handle(&self, envelope: Envelope) -> Result<()> {
        self.dispatcher().dispatch(envelope).await?;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state() {
            BusState::Idle => Ok(()),
            _ => Err(BusError::AlreadyStarted),
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            broker: Arc::clone(&self.broker),
            router: Arc::clone(&self.router),
            retry: self.config.retry.clone(),
            logger: Arc::clone(&self.logger),
        }
    }

    fn inbound_handler(&self) -> Arc<DispatcherHandle> {
        Arc::new(DispatcherHandle(Arc::new(self.dispatcher())))
    }
}

// ============================================================================
// Capability impls
// ============================================================================

#[async_trait]
impl StarterStopper for Bus {
    async fn go(&self) -> Result<()> {
        Bus::go(self).await
    }

    async fn stop(&self) -> Result<()> {
        Bus::stop(self).await
    }
}

#[async_trait]
impl Sender for Bus {
    async fn send<M: Message>(&self, destination: &str, message: &M) -> Result<()> {
        Bus::send(self, destination, message).await
    }
}

#[async_trait]
impl Publisher for Bus {
    async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        Bus::publish(self, message).await
    }
}

impl Subscriber for Bus {
    fn subscribe(&mut self, endpoint: &str) -> Result<()> {
        Bus::subscribe(self, endpoint)
    }

    fn subscribe_message(&mut self, endpoint: &str, message_name: &str) -> Result<()> {
        Bus::subscribe_message(self, endpoint, message_name)
    }
}

impl EnableLogger for Bus {
    fn enable_logger(&mut self) {
        Bus::enable_logger(self)
    }
}
