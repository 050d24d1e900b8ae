//! Reply listener: one consumer per resource on `<resource>.replyTo`.
//!
//! Decodes every reply and hands it to the correlation registry. Replies that
//! fail to decode or match no pending request are dropped here; nothing on the
//! reply path is ever surfaced to a caller as an error.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::ReplyEnvelope;
use crate::broker::Delivery;
use crate::registry::CorrelationRegistry;
use crate::resource::reply_channel;
use crate::topology::{TopologyCache, TopologyError};

pub struct ReplyListener {
    resource: String,
    handle: JoinHandle<()>,
}

impl ReplyListener {
    /// Bind and subscribe `<resource>.replyTo`, then consume until `shutdown`
    /// fires or the subscription ends.
    pub async fn spawn(
        topology: &TopologyCache,
        registry: Arc<CorrelationRegistry>,
        resource: &str,
        shutdown: CancellationToken,
    ) -> Result<Self, TopologyError> {
        let channel = reply_channel(resource);
        let mut subscription = topology.subscribe(&channel).await?;
        tracing::debug!(%resource, %channel, "Reply listener subscribed");

        let resource_name = resource.to_string();
        let handle = tokio::spawn(async move {
            let codec = JsonCodec::<ReplyEnvelope>::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(resource = %resource_name, "Reply listener shutting down");
                        break;
                    }
                    next = subscription.next() => match next {
                        Some(delivery) => route_reply(&codec, &registry, &resource_name, delivery),
                        None => {
                            tracing::warn!(resource = %resource_name, "Reply subscription ended");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            resource: resource.to_string(),
            handle,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the consumer task to exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(resource = %self.resource, error = %e, "Reply listener task failed");
        }
    }
}

fn route_reply(
    codec: &JsonCodec<ReplyEnvelope>,
    registry: &CorrelationRegistry,
    resource: &str,
    delivery: Delivery,
) {
    let reply = match codec.decode(&delivery.body) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::debug!(%resource, error = %e, "Dropping undecodable reply");
            return;
        }
    };
    let token = reply.token;
    if !registry.fulfill(&token, reply) {
        tracing::debug!(%resource, %token, "Reply matched no pending request");
    }
}
