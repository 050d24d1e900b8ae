//! Frontend: turns synchronous calls into correlated broker round trips.
//!
//! For every call the frontend:
//! 1. resolves the declared operation
//! 2. registers a pending entry under a fresh correlation token
//! 3. publishes the request envelope to `<resource>.<operation>`
//! 4. waits until the reply listener (or the expiry sweeper) resolves the entry
//!
//! Transports (HTTP today) only see `Call` in and `Outcome` / `DispatchError` out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, JsonCodec};
use crate::bridge::protocol::{CorrelationToken, Outcome, Params, RequestEnvelope};
use crate::broker::{Broker, BrokerError};
use crate::registry::{CorrelationRegistry, RegistryError, Resolution};
use crate::reply::ReplyListener;
use crate::resource::{Operation, ResourceDecl};
use crate::topology::{TopologyCache, TopologyError};

/// Upper bound on `FrontendConfig::reply_timeout` (one year).
pub const MAX_REPLY_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// How long a caller waits for a reply before failing with a timeout.
    pub reply_timeout: Duration,
    /// How often overdue pending requests are swept.
    pub sweep_interval: Duration,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl FrontendConfig {
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Reject settings the sweeper or deadline arithmetic cannot honour.
    pub fn validate(&self) -> Result<(), FrontendError> {
        if self.sweep_interval.is_zero() {
            return Err(FrontendError::InvalidConfig(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        if self.reply_timeout > MAX_REPLY_TIMEOUT {
            return Err(FrontendError::InvalidConfig(format!(
                "reply timeout {:?} exceeds the maximum of {:?}",
                self.reply_timeout, MAX_REPLY_TIMEOUT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("resource '{0}' is already declared")]
    AlreadyDeclared(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("frontend is shutting down")]
    ShuttingDown,
    #[error("invalid frontend configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown operation '{operation}' on resource '{resource}'")]
    UnknownOperation { resource: String, operation: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to publish to '{target}': {source}")]
    Publish {
        target: String,
        #[source]
        source: BrokerError,
    },
    #[error("no reply for {resource}.{operation} within {timeout:?}")]
    Timeout {
        resource: String,
        operation: String,
        timeout: Duration,
    },
    #[error("request was cancelled before a reply arrived")]
    Cancelled,
    #[error("reply timeout {0:?} does not fit in a deadline")]
    DeadlineOverflow(Duration),
    #[error("frontend is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// The broker could not be reached or refused the message.
    pub fn is_broker_failure(&self) -> bool {
        matches!(self, Self::Topology(_) | Self::Publish { .. })
    }
}

/// One synchronous request against a declared resource operation.
#[derive(Debug, Clone)]
pub struct Call {
    pub resource: String,
    pub operation: Operation,
    /// Caller parameters (query merged with body).
    pub params: Params,
    /// Transport metadata forwarded to the worker.
    pub headers: Option<Params>,
}

impl Call {
    pub fn new(resource: impl Into<String>, operation: Operation) -> Self {
        Self {
            resource: resource.into(),
            operation,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_headers(mut self, headers: Params) -> Self {
        self.headers = Some(headers);
        self
    }
}

pub struct Frontend {
    config: FrontendConfig,
    topology: Arc<TopologyCache>,
    registry: Arc<CorrelationRegistry>,
    resources: RwLock<BTreeMap<String, ResourceDecl>>,
    listeners: Mutex<Vec<ReplyListener>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    codec: JsonCodec<RequestEnvelope>,
    shutdown: CancellationToken,
}

impl Frontend {
    /// Create a frontend with its own topology cache on `broker`.
    ///
    /// Must be called from within a tokio runtime (starts the expiry sweeper).
    pub fn connect(
        broker: Arc<dyn Broker>,
        config: FrontendConfig,
    ) -> Result<Arc<Self>, FrontendError> {
        Self::with_topology(Arc::new(TopologyCache::new(broker)), config)
    }

    /// Create a frontend sharing an existing topology cache.
    pub fn with_topology(
        topology: Arc<TopologyCache>,
        config: FrontendConfig,
    ) -> Result<Arc<Self>, FrontendError> {
        config.validate()?;

        let registry = CorrelationRegistry::new();
        let shutdown = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(config.sweep_interval, shutdown.child_token());

        tracing::info!(
            reply_timeout_ms = config.reply_timeout.as_millis() as u64,
            sweep_interval_ms = config.sweep_interval.as_millis() as u64,
            "Frontend started"
        );

        Ok(Arc::new(Self {
            config,
            topology,
            registry,
            resources: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            sweeper: Mutex::new(Some(sweeper)),
            codec: JsonCodec::new(),
            shutdown,
        }))
    }

    pub fn config(&self) -> &FrontendConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    /// Make a resource callable: declares every operation's exchange and starts
    /// the resource's reply listener.
    pub async fn declare_resource(&self, decl: ResourceDecl) -> Result<(), FrontendError> {
        if self.shutdown.is_cancelled() {
            return Err(FrontendError::ShuttingDown);
        }

        // Held across the declarations so two concurrent declarations of the
        // same name cannot both succeed.
        let mut resources = self.resources.write().await;
        if resources.contains_key(decl.name()) {
            return Err(FrontendError::AlreadyDeclared(decl.name().to_string()));
        }

        for op in decl.operations() {
            self.topology.exchange(&op.target).await?;
        }
        let listener = ReplyListener::spawn(
            &self.topology,
            Arc::clone(&self.registry),
            decl.name(),
            self.shutdown.child_token(),
        )
        .await?;
        self.listeners.lock().await.push(listener);

        tracing::info!(
            resource = %decl.name(),
            operations = decl.operations().len(),
            "Declared resource"
        );
        resources.insert(decl.name().to_string(), decl);
        Ok(())
    }

    /// Declared resources, ordered by name.
    pub async fn resources(&self) -> Vec<ResourceDecl> {
        self.resources.read().await.values().cloned().collect()
    }

    /// Requests currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Publish `call` and wait for its correlated reply.
    ///
    /// Dropping the returned future before it completes withdraws the request;
    /// a reply arriving afterwards is discarded.
    pub async fn dispatch(&self, call: Call) -> Result<Outcome, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let target = {
            let resources = self.resources.read().await;
            resources
                .get(&call.resource)
                .and_then(|decl| decl.operation(&call.operation))
                .map(|op| op.target.clone())
                .ok_or_else(|| DispatchError::UnknownOperation {
                    resource: call.resource.clone(),
                    operation: call.operation.to_string(),
                })?
        };

        let deadline = Instant::now()
            .checked_add(self.config.reply_timeout)
            .ok_or(DispatchError::DeadlineOverflow(self.config.reply_timeout))?;
        let token = CorrelationToken::new();
        let pending = self.registry.register(token, deadline)?;

        let envelope = RequestEnvelope::new(call.params, token, call.headers);
        let body = self.codec.encode(&envelope)?;
        let exchange = self.topology.exchange(&target).await?;
        exchange
            .publish("", body)
            .await
            .map_err(|source| DispatchError::Publish {
                target: target.clone(),
                source,
            })?;
        tracing::debug!(%token, %target, "Published request");

        let resolution = tokio::select! {
            resolution = pending.wait() => resolution,
            _ = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
        };

        match resolution {
            Resolution::Reply(reply) => Ok(reply.into_outcome()),
            Resolution::Expired => {
                tracing::warn!(%token, %target, "Request timed out waiting for reply");
                Err(DispatchError::Timeout {
                    resource: call.resource,
                    operation: call.operation.to_string(),
                    timeout: self.config.reply_timeout,
                })
            }
            Resolution::Cancelled => Err(DispatchError::Cancelled),
        }
    }

    /// Stop reply listeners and the sweeper. In-flight calls fail with
    /// `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(pending = self.registry.len(), "Frontend shutting down");
        self.shutdown.cancel();

        let listeners: Vec<ReplyListener> = self.listeners.lock().await.drain(..).collect();
        for listener in listeners {
            listener.join().await;
        }
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper
            && let Err(e) = sweeper.await
        {
            tracing::error!(error = %e, "Correlation sweeper task failed");
        }
    }
}
