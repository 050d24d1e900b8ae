//! In-process broker.
//!
//! Implements exchange/queue/binding semantics inside one process so that a
//! frontend and its workers can run together (and so tests need no external
//! broker). Messages published before a queue has a consumer wait in the
//! queue's backlog; consumers of the same queue share messages round-robin.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, Delivery, Exchange, Queue, RoutingPattern, Subscription};

/// Counters for declarations and traffic, mostly useful in tests and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub exchanges_declared: usize,
    pub queues_declared: usize,
    pub published: usize,
    /// Published messages that matched no binding and were dropped.
    pub unroutable: usize,
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, RoutingPattern)>,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    fn is_bound(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|(ex, pattern)| ex == exchange && pattern.matches(routing_key))
    }

    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].send(delivery) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Consumer went away; retry with the next one.
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct Inner {
    state: StdMutex<State>,
    closed: AtomicBool,
    exchanges_declared: AtomicUsize,
    queues_declared: AtomicUsize,
    published: AtomicUsize,
    unroutable: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Broker state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Unavailable("broker is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        let mut routed = 0usize;
        for (queue_name, queue) in state.queues.iter_mut() {
            if queue.is_bound(exchange, routing_key) {
                tracing::trace!(%exchange, %routing_key, queue = %queue_name, "Routing message");
                queue.deliver(Delivery {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                });
                routed += 1;
            }
        }

        if routed == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%exchange, %routing_key, "Message matched no binding, dropped");
        }
        Ok(())
    }
}

/// Cloneable handle to an in-process broker; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            exchanges_declared: self.inner.exchanges_declared.load(Ordering::Relaxed),
            queues_declared: self.inner.queues_declared.load(Ordering::Relaxed),
            published: self.inner.published.load(Ordering::Relaxed),
            unroutable: self.inner.unroutable.load(Ordering::Relaxed),
        }
    }

    /// Messages waiting in a queue for a consumer.
    pub fn backlog_len(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.backlog.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| {
            q.consumers.iter().filter(|tx| !tx.is_closed()).count()
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the broker: all subscriptions end and further calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut state = self.inner.state();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        tracing::debug!("Memory broker closed");
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<Arc<dyn Exchange>, BrokerError> {
        self.inner.ensure_open()?;
        self.inner.exchanges_declared.fetch_add(1, Ordering::Relaxed);
        if self.inner.state().exchanges.insert(name.to_string()) {
            tracing::debug!(exchange = %name, "Declared exchange");
        }
        Ok(Arc::new(MemoryExchange {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn declare_queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError> {
        self.inner.ensure_open()?;
        self.inner.queues_declared.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state();
        if !state.queues.contains_key(name) {
            state.queues.insert(name.to_string(), QueueState::default());
            tracing::debug!(queue = %name, "Declared queue");
        }
        Ok(Arc::new(MemoryQueue {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryExchange {
    name: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, routing_key: &str, body: Bytes) -> Result<(), BrokerError> {
        self.inner.publish(&self.name, routing_key, body)
    }
}

struct MemoryQueue {
    name: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        let pattern = RoutingPattern::new(pattern)?;
        let mut state = self.inner.state();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        let queue = state.queues.entry(self.name.clone()).or_default();
        if !queue
            .bindings
            .iter()
            .any(|(ex, p)| ex == exchange && *p == pattern)
        {
            tracing::debug!(queue = %self.name, %exchange, %pattern, "Bound queue");
            queue.bindings.push((exchange.to_string(), pattern));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        self.inner.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state();
            let queue = state.queues.entry(self.name.clone()).or_default();
            queue.consumers.push(tx);
            let backlog: Vec<Delivery> = queue.backlog.drain(..).collect();
            if !backlog.is_empty() {
                tracing::debug!(queue = %self.name, count = backlog.len(), "Flushing backlog to new consumer");
            }
            for delivery in backlog {
                queue.deliver(delivery);
            }
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }
}
