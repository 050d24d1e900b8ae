//! Topology cache: memoized broker exchanges and queues.
//!
//! Handles are created on first reference and reused for the life of the cache.
//! Each name gets its own `OnceCell`, so concurrent first references issue a
//! single declaration and everyone receives the same handle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::broker::{Broker, BrokerError, Exchange, Queue, Subscription};

/// Binding pattern used between an operation's exchange and its queue.
pub const BIND_ALL: &str = "#";

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to declare exchange '{name}': {source}")]
    Exchange {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to declare queue '{name}': {source}")]
    Queue {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to bind queue '{queue}' to exchange '{exchange}': {source}")]
    Bind {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to subscribe to queue '{queue}': {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

type Slot<T> = Arc<OnceCell<Arc<T>>>;

pub struct TopologyCache {
    broker: Arc<dyn Broker>,
    exchanges: DashMap<String, Slot<dyn Exchange>>,
    queues: DashMap<String, Slot<dyn Queue>>,
}

impl TopologyCache {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            exchanges: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Get or declare the exchange `name`.
    ///
    /// A failed declaration is not cached; the next call tries again.
    pub async fn exchange(&self, name: &str) -> Result<Arc<dyn Exchange>, TopologyError> {
        // Clone the cell out so the map shard is not locked across the await.
        let cell = Arc::clone(&*self.exchanges.entry(name.to_string()).or_default());
        let exchange = cell
            .get_or_try_init(|| async {
                tracing::debug!(exchange = %name, "Declaring exchange");
                self.broker
                    .declare_exchange(name)
                    .await
                    .map_err(|source| TopologyError::Exchange {
                        name: name.to_string(),
                        source,
                    })
            })
            .await?;
        Ok(Arc::clone(exchange))
    }

    /// Get or declare the queue `name`.
    pub async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>, TopologyError> {
        let cell = Arc::clone(&*self.queues.entry(name.to_string()).or_default());
        let queue = cell
            .get_or_try_init(|| async {
                tracing::debug!(queue = %name, "Declaring queue");
                self.broker
                    .declare_queue(name)
                    .await
                    .map_err(|source| TopologyError::Queue {
                        name: name.to_string(),
                        source,
                    })
            })
            .await?;
        Ok(Arc::clone(queue))
    }

    /// Exchange and queue sharing `name`, with the queue bound to receive
    /// everything published on the exchange.
    pub async fn bound_queue(&self, name: &str) -> Result<Arc<dyn Queue>, TopologyError> {
        self.exchange(name).await?;
        let queue = self.queue(name).await?;
        queue
            .bind(name, BIND_ALL)
            .await
            .map_err(|source| TopologyError::Bind {
                queue: name.to_string(),
                exchange: name.to_string(),
                source,
            })?;
        Ok(queue)
    }

    /// `bound_queue(name)` plus a fresh consumer on it.
    pub async fn subscribe(&self, name: &str) -> Result<Subscription, TopologyError> {
        let queue = self.bound_queue(name).await?;
        queue
            .subscribe()
            .await
            .map_err(|source| TopologyError::Subscribe {
                queue: name.to_string(),
                source,
            })
    }

    pub fn cached_exchanges(&self) -> usize {
        self.exchanges.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn cached_queues(&self) -> usize {
        self.queues.iter().filter(|q| q.value().initialized()).count()
    }
}
