//! Correlation registry - pending request lifecycle.
//!
//! Maps a correlation token to the one-shot channel of the caller waiting for
//! it. Every entry is removed exactly once:
//! - a matching reply arrives (`fulfill`)
//! - its deadline passes (`expire_overdue`, driven by the sweeper)
//! - the caller goes away (`PendingReply` dropped before resolution)
//!
//! Lock-free concurrent access via DashMap; the removal is the single point that
//! decides who completes an entry, so a token can never resolve twice.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CorrelationToken, ReplyEnvelope};

/// Shortest period the sweeper ticks at; a zero interval is raised to this.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("correlation token {0} is already pending")]
    DuplicateToken(CorrelationToken),
}

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Reply(ReplyEnvelope),
    /// No reply arrived before the deadline.
    Expired,
    /// The entry was removed without a reply (explicit cancel).
    Cancelled,
}

struct PendingEntry {
    tx: oneshot::Sender<Resolution>,
    deadline: Instant,
    registered_at: Instant,
}

pub struct CorrelationRegistry {
    pending: DashMap<CorrelationToken, PendingEntry>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request that must resolve by `deadline`.
    pub fn register(
        self: &Arc<Self>,
        token: CorrelationToken,
        deadline: Instant,
    ) -> Result<PendingReply, RegistryError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(token) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateToken(token)),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    tx,
                    deadline,
                    registered_at: Instant::now(),
                });
            }
        }
        tracing::trace!(%token, "Registered pending request");

        Ok(PendingReply {
            token,
            rx,
            registry: Arc::clone(self),
            armed: true,
        })
    }

    /// Complete the entry for `token` with `reply`.
    ///
    /// Returns false (and does nothing) when no entry matches: late or duplicate
    /// replies are expected and not an error.
    pub fn fulfill(&self, token: &CorrelationToken, reply: ReplyEnvelope) -> bool {
        let Some((_, entry)) = self.pending.remove(token) else {
            tracing::trace!(%token, "Discarding reply with no pending request");
            return false;
        };
        tracing::debug!(
            %token,
            successful = reply.successful,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "Reply matched pending request"
        );
        if entry.tx.send(Resolution::Reply(reply)).is_err() {
            tracing::trace!(%token, "Caller stopped waiting before reply was delivered");
        }
        true
    }

    /// Remove an entry without resolving it with a reply.
    pub fn cancel(&self, token: &CorrelationToken) -> bool {
        match self.pending.remove(token) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Resolution::Cancelled);
                tracing::trace!(%token, "Cancelled pending request");
                true
            }
            None => false,
        }
    }

    /// Resolve every entry whose deadline is at or before `now` as expired.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<CorrelationToken> = self
            .pending
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut expired = 0;
        for token in overdue {
            // Re-check under the shard lock: a reply may have won the race.
            if let Some((_, entry)) = self.pending.remove_if(&token, |_, e| e.deadline <= now) {
                tracing::debug!(%token, "Pending request expired");
                let _ = entry.tx.send(Resolution::Expired);
                expired += 1;
            }
        }
        expired
    }

    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.pending.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Periodically expire overdue entries until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = registry.expire_overdue(Instant::now());
                        if expired > 0 {
                            tracing::warn!(expired, pending = registry.len(), "Expired requests that received no reply");
                        }
                    }
                }
            }
            tracing::debug!("Correlation sweeper exiting");
        })
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }
}

/// Caller side of a registered request.
///
/// Dropping it before it resolves (e.g. the HTTP client disconnected and axum
/// dropped the handler future) removes the registry entry.
pub struct PendingReply {
    token: CorrelationToken,
    rx: oneshot::Receiver<Resolution>,
    registry: Arc<CorrelationRegistry>,
    armed: bool,
}

impl PendingReply {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub async fn wait(mut self) -> Resolution {
        let resolution = (&mut self.rx).await;
        self.armed = false;
        resolution.unwrap_or(Resolution::Cancelled)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.armed {
            self.registry.cancel(&self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn register_and_fulfill() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();

        let pending = registry.register(token, later()).unwrap();
        assert_eq!(pending.token(), token);
        assert!(registry.contains(&token));

        assert!(registry.fulfill(&token, ReplyEnvelope::success(token, json!("read 7"))));
        assert!(registry.is_empty());

        match pending.wait().await {
            Resolution::Reply(reply) => {
                assert!(reply.successful);
                assert_eq!(reply.data, json!("read 7"));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_token_rejected() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();

        let _first = registry.register(token, later()).unwrap();
        let err = registry.register(token, later()).err().unwrap();

        assert!(matches!(err, RegistryError::DuplicateToken(t) if t == token));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn second_fulfillment_is_noop() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();
        let pending = registry.register(token, later()).unwrap();

        assert!(registry.fulfill(&token, ReplyEnvelope::success(token, json!(1))));
        assert!(!registry.fulfill(&token, ReplyEnvelope::failure(token, json!(2))));

        assert_eq!(
            pending.wait().await,
            Resolution::Reply(ReplyEnvelope::success(token, json!(1)))
        );
    }

    #[tokio::test]
    async fn unknown_token_is_ignored() {
        let registry = CorrelationRegistry::new();
        let known = CorrelationToken::new();
        let _pending = registry.register(known, later()).unwrap();

        let stranger = CorrelationToken::new();
        assert!(!registry.fulfill(&stranger, ReplyEnvelope::success(stranger, json!(null))));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&known));
    }

    #[tokio::test]
    async fn size_tracks_unresolved_requests() {
        let registry = CorrelationRegistry::new();

        let pending: Vec<PendingReply> = (0..50)
            .map(|_| registry.register(CorrelationToken::new(), later()).unwrap())
            .collect();
        let tokens: HashSet<CorrelationToken> = pending.iter().map(|p| p.token()).collect();
        assert_eq!(tokens.len(), 50);
        assert_eq!(registry.len(), 50);

        for token in tokens.iter().take(20) {
            registry.fulfill(token, ReplyEnvelope::success(*token, json!(null)));
        }
        assert_eq!(registry.len(), 30);
    }

    #[tokio::test]
    async fn overdue_entries_expire_once() {
        let registry = CorrelationRegistry::new();
        let now = Instant::now();
        let soon = registry
            .register(CorrelationToken::new(), now + Duration::from_millis(10))
            .unwrap();
        let _late = registry
            .register(CorrelationToken::new(), now + Duration::from_secs(60))
            .unwrap();

        let cutoff = now + Duration::from_secs(1);
        assert_eq!(registry.expire_overdue(cutoff), 1);
        assert_eq!(registry.expire_overdue(cutoff), 0);
        assert_eq!(registry.len(), 1);

        let token = soon.token();
        assert_eq!(soon.wait().await, Resolution::Expired);
        // A reply arriving after expiry finds nothing.
        assert!(!registry.fulfill(&token, ReplyEnvelope::success(token, json!(null))));
    }

    #[tokio::test]
    async fn dropping_pending_reply_cancels_entry() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();

        {
            let _pending = registry.register(token, later()).unwrap();
            assert!(registry.contains(&token));
        }

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn resolved_pending_reply_does_not_cancel_others() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();
        let pending = registry.register(token, later()).unwrap();
        registry.fulfill(&token, ReplyEnvelope::success(token, json!(null)));
        pending.wait().await;

        // Re-registering the same token after resolution is allowed.
        let _again = registry.register(token, later()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn explicit_cancel_resolves_cancelled() {
        let registry = CorrelationRegistry::new();
        let token = CorrelationToken::new();
        let pending = registry.register(token, later()).unwrap();

        assert!(registry.cancel(&token));
        assert!(!registry.cancel(&token));
        assert_eq!(pending.wait().await, Resolution::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_in_background() {
        let registry = CorrelationRegistry::new();
        let shutdown = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(Duration::from_millis(100), shutdown.clone());

        let pending = registry
            .register(
                CorrelationToken::new(),
                Instant::now() + Duration::from_millis(250),
            )
            .unwrap();

        assert_eq!(pending.wait().await, Resolution::Expired);
        assert!(registry.is_empty());

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_sweeper_still_expires() {
        let registry = CorrelationRegistry::new();
        let shutdown = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(Duration::ZERO, shutdown.clone());

        let pending = registry
            .register(
                CorrelationToken::new(),
                Instant::now() + Duration::from_millis(5),
            )
            .unwrap();

        assert_eq!(pending.wait().await, Resolution::Expired);
        assert!(!sweeper.is_finished());

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
