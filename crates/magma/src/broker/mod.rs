//! Message broker abstraction.
//!
//! The bridge only needs three things from a broker: named publish targets
//! (exchanges), named subscribable queues, and topic-style bindings between
//! them. Any broker offering those can sit behind these traits; `MemoryBroker`
//! is the in-process implementation.

pub mod memory;
pub mod pattern;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use memory::{BrokerStats, MemoryBroker};
pub use pattern::{PatternError, RoutingPattern};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("invalid binding pattern: {0}")]
    InvalidPattern(#[from] PatternError),
}

/// A message as handed to a queue consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

/// Stream of deliveries for one consumer. Ends when the broker shuts down.
pub type Subscription = BoxStream<'static, Delivery>;

/// Named publish target.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, routing_key: &str, body: Bytes) -> Result<(), BrokerError>;
}

/// Named, subscribable buffer fed by one or more exchanges.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Route messages published to `exchange` whose routing key matches
    /// `pattern` into this queue.
    async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), BrokerError>;

    /// Start consuming. Several subscriptions on one queue share its messages
    /// round-robin.
    async fn subscribe(&self) -> Result<Subscription, BrokerError>;
}

/// Connection to a broker. Declarations are idempotent on the broker side;
/// callers memoize handles through `TopologyCache`.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str) -> Result<Arc<dyn Exchange>, BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError>;
}
