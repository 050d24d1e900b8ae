//! Worker: consumes operation queues and publishes correlated replies.
//!
//! ```text
//! <resource>.<op> queue ──▶ decode ──▶ spawn handler(op, Request, Responder)
//!                                             │
//!                         Responder::success / fail
//!                                             ▼
//!                               <resource>.replyTo exchange
//! ```
//!
//! Each inbound message runs on its own task so a slow handler never blocks
//! the queue consumer.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, JsonCodec};
use crate::bridge::protocol::{CorrelationToken, Params, ReplyEnvelope, RequestEnvelope};
use crate::broker::{Broker, BrokerError, Delivery, Exchange, Subscription};
use crate::resource::{DeclaredOperation, Operation, ResourceDecl};
use crate::topology::{TopologyCache, TopologyError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("resource '{0}' is already served by this worker")]
    AlreadyDeclared(String),
    /// A declared custom operation has no handler.
    #[error("handler for '{resource}' does not implement operation '{operation}'")]
    MissingOperation { resource: String, operation: String },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("worker is shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply payload is not representable as JSON: {0}")]
    Payload(#[source] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to publish reply: {0}")]
    Publish(#[source] BrokerError),
}

/// An inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// Caller parameters.
    pub data: Params,
    /// Caller transport metadata, if the frontend forwarded any.
    pub headers: Option<Params>,
    pub token: CorrelationToken,
    /// The raw broker message.
    pub delivery: Delivery,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref()?.get(name)?.as_str()
    }
}

/// Single-use reply handle for one request.
///
/// `success` and `fail` consume the responder, so a request is answered at
/// most once.
pub struct Responder {
    token: CorrelationToken,
    resource: Arc<str>,
    operation: Operation,
    exchange: Arc<dyn Exchange>,
    codec: JsonCodec<ReplyEnvelope>,
    replied: bool,
}

impl Responder {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub async fn success(mut self, payload: impl Serialize) -> Result<(), ReplyError> {
        self.reply(true, payload).await
    }

    pub async fn fail(mut self, payload: impl Serialize) -> Result<(), ReplyError> {
        self.reply(false, payload).await
    }

    async fn reply(&mut self, successful: bool, payload: impl Serialize) -> Result<(), ReplyError> {
        self.replied = true;
        let data = serde_json::to_value(payload).map_err(ReplyError::Payload)?;
        let body = self.codec.encode(&ReplyEnvelope {
            token: self.token,
            successful,
            data,
        })?;
        self.exchange.publish("", body).await.map_err(|e| {
            tracing::error!(
                resource = %self.resource,
                operation = %self.operation,
                token = %self.token,
                error = %e,
                "Failed to publish reply"
            );
            ReplyError::Publish(e)
        })?;
        tracing::debug!(
            resource = %self.resource,
            operation = %self.operation,
            token = %self.token,
            successful,
            "Replied"
        );
        Ok(())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.replied {
            tracing::warn!(
                resource = %self.resource,
                operation = %self.operation,
                token = %self.token,
                "Request dropped without a reply; caller will time out"
            );
        }
    }
}

/// Serves the operations of one resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Operations this handler implements.
    fn operations(&self) -> BTreeSet<Operation>;

    /// Handle one request. Reply through `responder`; dropping it unanswered
    /// leaves the caller to time out.
    async fn handle(&self, operation: &Operation, request: Request, responder: Responder);
}

type HandlerFn = Arc<dyn Fn(Request, Responder) -> BoxFuture<'static, ()> + Send + Sync>;

/// Closure-table `ResourceHandler`.
///
/// ```ignore
/// let handlers = Handlers::new()
///     .read(|req, res| async move {
///         let _ = res.success(format!("read {}", req.data["id"])).await;
///     });
/// ```
#[derive(Default, Clone)]
pub struct Handlers {
    table: BTreeMap<Operation, HandlerFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` for `operation`, replacing any previous registration.
    pub fn on<F, Fut>(mut self, operation: Operation, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f: HandlerFn =
            Arc::new(move |request: Request, responder: Responder| f(request, responder).boxed());
        self.table.insert(operation, f);
        self
    }

    pub fn create<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(Operation::Create, f)
    }

    pub fn read<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(Operation::Read, f)
    }

    pub fn update<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(Operation::Update, f)
    }

    pub fn delete<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(Operation::Delete, f)
    }

    pub fn custom<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(Operation::Custom(name.into()), f)
    }
}

#[async_trait]
impl ResourceHandler for Handlers {
    fn operations(&self) -> BTreeSet<Operation> {
        self.table.keys().cloned().collect()
    }

    async fn handle(&self, operation: &Operation, request: Request, responder: Responder) {
        match self.table.get(operation) {
            Some(f) => f(request, responder).await,
            None => tracing::warn!(%operation, "No handler registered for operation"),
        }
    }
}

/// State shared by every consumer of one resource.
struct ResourceContext {
    resource: Arc<str>,
    handler: Arc<dyn ResourceHandler>,
    reply_exchange: Arc<dyn Exchange>,
}

pub struct Worker {
    topology: Arc<TopologyCache>,
    resources: Mutex<BTreeSet<String>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn connect(broker: Arc<dyn Broker>) -> Arc<Self> {
        Self::with_topology(Arc::new(TopologyCache::new(broker)))
    }

    /// Worker sharing an existing topology cache.
    pub fn with_topology(topology: Arc<TopologyCache>) -> Arc<Self> {
        Arc::new(Self {
            topology,
            resources: Mutex::new(BTreeSet::new()),
            consumers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    /// Serve `decl` with `handler`.
    ///
    /// Every declared operation the handler implements gets its own queue
    /// consumer. Custom operations must be implemented; a CRUD operation the
    /// handler lacks is left unsubscribed so other workers on the same queue
    /// keep serving it.
    pub async fn resource(
        &self,
        decl: ResourceDecl,
        handler: impl ResourceHandler,
    ) -> Result<(), WorkerError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        let mut resources = self.resources.lock().await;
        if resources.contains(decl.name()) {
            return Err(WorkerError::AlreadyDeclared(decl.name().to_string()));
        }

        let implemented = handler.operations();
        if let Some(missing) = decl
            .custom_operations()
            .find(|op| !implemented.contains(&op.operation))
        {
            return Err(WorkerError::MissingOperation {
                resource: decl.name().to_string(),
                operation: missing.operation.to_string(),
            });
        }
        for extra in implemented
            .iter()
            .filter(|op| decl.operation(op).is_none())
        {
            tracing::debug!(resource = %decl.name(), operation = %extra, "Handler implements undeclared operation, ignoring");
        }

        let ctx = Arc::new(ResourceContext {
            resource: Arc::from(decl.name()),
            handler: Arc::new(handler),
            reply_exchange: self.topology.exchange(&decl.reply_channel()).await?,
        });

        // Subscribe everything before spawning, so a failure part way leaves no
        // consumers behind and the declaration can be retried.
        let mut subscriptions = Vec::new();
        for op in decl.operations() {
            if !implemented.contains(&op.operation) {
                tracing::info!(resource = %decl.name(), operation = %op.operation, "Operation not implemented, not subscribing");
                continue;
            }
            subscriptions.push((op.clone(), self.topology.subscribe(&op.target).await?));
        }

        let subscribed = subscriptions.len();
        let mut consumers = self.consumers.lock().await;
        for (op, subscription) in subscriptions {
            consumers.push(tokio::spawn(consume(
                Arc::clone(&ctx),
                op,
                subscription,
                self.shutdown.child_token(),
            )));
        }
        drop(consumers);

        tracing::info!(resource = %decl.name(), operations = subscribed, "Serving resource");
        resources.insert(decl.name().to_string());
        Ok(())
    }

    pub async fn resources(&self) -> Vec<String> {
        self.resources.lock().await.iter().cloned().collect()
    }

    /// Stop every queue consumer. Handlers already running finish on their own.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Worker shutting down");
        self.shutdown.cancel();
        let consumers: Vec<JoinHandle<()>> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.await {
                tracing::error!(error = %e, "Queue consumer task failed");
            }
        }
    }
}

async fn consume(
    ctx: Arc<ResourceContext>,
    op: DeclaredOperation,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    let codec = JsonCodec::<RequestEnvelope>::new();
    tracing::debug!(resource = %ctx.resource, target = %op.target, "Queue consumer started");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = subscription.next() => match next {
                Some(delivery) => delivery,
                None => {
                    tracing::warn!(resource = %ctx.resource, target = %op.target, "Queue subscription ended");
                    break;
                }
            },
        };

        let envelope = match codec.decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(resource = %ctx.resource, target = %op.target, error = %e, "Dropping malformed request");
                continue;
            }
        };
        let token = envelope.token;
        tracing::debug!(resource = %ctx.resource, operation = %op.operation, %token, "Request received");

        let request = Request {
            data: envelope.params,
            headers: envelope.headers,
            token,
            delivery,
        };
        let responder = Responder {
            token,
            resource: Arc::clone(&ctx.resource),
            operation: op.operation.clone(),
            exchange: Arc::clone(&ctx.reply_exchange),
            codec: JsonCodec::new(),
            replied: false,
        };

        let handler = Arc::clone(&ctx.handler);
        let operation = op.operation.clone();
        tokio::spawn(async move {
            handler.handle(&operation, request, responder).await;
        });
    }

    tracing::debug!(resource = %ctx.resource, target = %op.target, "Queue consumer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Queue};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Frontend side of the wire, driven by hand.
    struct Caller {
        topology: TopologyCache,
        replies: Subscription,
    }

    impl Caller {
        async fn new(broker: &MemoryBroker, resource: &str) -> Self {
            let topology = TopologyCache::new(Arc::new(broker.clone()));
            let replies = topology
                .subscribe(&format!("{resource}.replyTo"))
                .await
                .unwrap();
            Self { topology, replies }
        }

        async fn send(&self, target: &str, params: serde_json::Value) -> CorrelationToken {
            let token = CorrelationToken::new();
            let serde_json::Value::Object(params) = params else {
                panic!("params must be an object");
            };
            let mut headers = Params::new();
            headers.insert("user-agent".to_string(), json!("test"));
            let envelope = RequestEnvelope::new(params, token, Some(headers));
            let body = JsonCodec::<RequestEnvelope>::new().encode(&envelope).unwrap();
            self.send_raw(target, body).await;
            token
        }

        async fn send_raw(&self, target: &str, body: Bytes) {
            let exchange = self.topology.exchange(target).await.unwrap();
            exchange.publish("", body).await.unwrap();
        }

        async fn reply(&mut self) -> ReplyEnvelope {
            let delivery = tokio::time::timeout(Duration::from_secs(1), self.replies.next())
                .await
                .expect("timed out waiting for reply")
                .expect("reply subscription ended");
            JsonCodec::<ReplyEnvelope>::new()
                .decode(&delivery.body)
                .unwrap()
        }

        async fn no_reply(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(50), self.replies.next()).await;
            assert!(next.is_err(), "unexpected reply");
        }
    }

    fn widget_handlers() -> Handlers {
        Handlers::new()
            .read(|req, res| async move {
                let _ = res.success(format!("read {}", req.data["id"])).await;
            })
            .create(|_req, res| async move {
                let _ = res.fail(json!({"reason": "invalid"})).await;
            })
            .update(|req, res| async move {
                let agent = req.header("user-agent").unwrap_or_default().to_string();
                let _ = res.success(agent).await;
            })
    }

    #[tokio::test]
    async fn success_reply_carries_token_and_payload() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "widget").await;

        let token = caller.send("widget.read", json!({"id": 7})).await;

        assert_eq!(caller.reply().await, ReplyEnvelope::success(token, json!("read 7")));
    }

    #[tokio::test]
    async fn fail_reply_is_unsuccessful() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "widget").await;

        let token = caller.send("widget.create", json!({})).await;

        assert_eq!(
            caller.reply().await,
            ReplyEnvelope::failure(token, json!({"reason": "invalid"}))
        );
    }

    #[tokio::test]
    async fn headers_reach_handler() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "widget").await;

        caller.send("widget.update", json!({})).await;

        assert_eq!(caller.reply().await.data, json!("test"));
    }

    #[tokio::test]
    async fn unimplemented_crud_is_not_subscribed() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();

        assert_eq!(broker.consumer_count("widget.read"), Some(1));
        assert_eq!(broker.consumer_count("widget.delete"), None);
    }

    #[tokio::test]
    async fn missing_custom_operation_is_rejected() {
        let worker = Worker::connect(Arc::new(MemoryBroker::new()));
        let decl = ResourceDecl::with_operations("network", ["doSomething:post"]).unwrap();

        let err = worker.resource(decl, widget_handlers()).await.unwrap_err();

        assert!(matches!(
            err,
            WorkerError::MissingOperation { ref operation, .. } if operation == "doSomething"
        ));
        assert!(worker.resources().await.is_empty());
    }

    #[tokio::test]
    async fn custom_operation_is_served() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        let handlers = Handlers::new().custom("doSomething", |_req, res| async move {
            let _ = res.success("done").await;
        });
        worker
            .resource(
                ResourceDecl::with_operations("network", ["doSomething:post"]).unwrap(),
                handlers,
            )
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "network").await;

        let token = caller.send("network.doSomething", json!({})).await;

        assert_eq!(caller.reply().await, ReplyEnvelope::success(token, json!("done")));
    }

    #[tokio::test]
    async fn malformed_request_is_skipped() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "widget").await;

        caller
            .send_raw("widget.read", Bytes::from_static(b"{\"id\": 1}"))
            .await;
        let token = caller.send("widget.read", json!({"id": 2})).await;

        assert_eq!(caller.reply().await, ReplyEnvelope::success(token, json!("read 2")));
    }

    #[tokio::test]
    async fn silent_handler_sends_nothing() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        let handlers = Handlers::new().read(|_req, res| async move {
            drop(res);
        });
        worker
            .resource(ResourceDecl::new("widget").unwrap(), handlers)
            .await
            .unwrap();
        let mut caller = Caller::new(&broker, "widget").await;

        caller.send("widget.read", json!({})).await;

        caller.no_reply().await;
    }

    #[tokio::test]
    async fn serving_twice_fails() {
        let worker = Worker::connect(Arc::new(MemoryBroker::new()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();

        let err = worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyDeclared(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_consumers() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(broker.clone()));
        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();

        worker.shutdown().await;

        assert_eq!(broker.consumer_count("widget.read"), Some(0));
        assert!(matches!(
            worker
                .resource(ResourceDecl::new("gadget").unwrap(), widget_handlers())
                .await,
            Err(WorkerError::ShuttingDown)
        ));
    }

    /// Fails the first declaration of one queue, then behaves normally.
    struct FailOnceBroker {
        inner: MemoryBroker,
        queue: &'static str,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Broker for FailOnceBroker {
        async fn declare_exchange(&self, name: &str) -> Result<Arc<dyn Exchange>, BrokerError> {
            self.inner.declare_exchange(name).await
        }

        async fn declare_queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError> {
            if name == self.queue && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::Unavailable("connection reset".to_string()));
            }
            self.inner.declare_queue(name).await
        }
    }

    #[tokio::test]
    async fn failed_declaration_leaves_no_consumers() {
        let broker = MemoryBroker::new();
        let worker = Worker::connect(Arc::new(FailOnceBroker {
            inner: broker.clone(),
            queue: "widget.update",
            failed: AtomicBool::new(false),
        }));

        let first = worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await;
        assert!(matches!(first, Err(WorkerError::Topology(_))));
        assert_eq!(broker.consumer_count("widget.read"), Some(0));
        assert!(worker.resources().await.is_empty());

        worker
            .resource(ResourceDecl::new("widget").unwrap(), widget_handlers())
            .await
            .unwrap();

        assert_eq!(broker.consumer_count("widget.read"), Some(1));
        assert_eq!(broker.consumer_count("widget.create"), Some(1));
        assert_eq!(broker.consumer_count("widget.update"), Some(1));

        let mut caller = Caller::new(&broker, "widget").await;
        let token = caller.send("widget.read", json!({"id": 3})).await;
        assert_eq!(caller.reply().await, ReplyEnvelope::success(token, json!("read 3")));
        caller.no_reply().await;
    }
}
