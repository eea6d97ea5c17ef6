//! Tiered read path in front of the authoritative store.
//!
//! 1. **L1** ([`LocalCache`]): process-local, TTL-bounded, decremented under a headroom
//!    multiplier.
//! 2. **Replica** ([`ReplicaReader`]): a lagging read-only view, trusted only within the
//!    policy's lag bound and safety margin.
//!
//! Neither tier writes to the store. What they admit is owed to the key's bucket and paid
//! by the next store call for that key, so the bucket still drains at the real rate.
//!
//! Anything not answered here falls through to the store. Cache and replica misses are
//! never errors; they are logged at `debug` and the caller moves on.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ReplicaError;
use crate::store::ReplicaReader;
use crate::types::{BucketKey, LimitConfig, RateLimitResult, Scope, Source};

pub mod local;
pub mod policy;

pub use local::LocalCache;
pub use policy::{CachePolicy, CachePolicyProvider, TierCachePolicies};

/// L1 plus an optional replica.
#[derive(Debug)]
pub struct TieredCache {
    local: LocalCache,
    replica: Option<Arc<dyn ReplicaReader>>,
}

impl TieredCache {
    pub fn new(max_entries: usize, replica: Option<Arc<dyn ReplicaReader>>) -> Self {
        Self { local: LocalCache::new(max_entries), replica }
    }

    /// See [`LocalCache::with_unsettled_ttl`].
    pub fn with_unsettled_ttl(mut self, ttl: Duration) -> Self {
        self.local = self.local.with_unsettled_ttl(ttl);
        self
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Serve from L1 if the policy caches this limit and the entry has headroom.
    pub fn lookup_local(&self, key: &BucketKey, cost: f64, policy: &CachePolicy, now: u64) -> Option<RateLimitResult> {
        if !policy.caches_locally() {
            return None;
        }
        self.local.try_consume(key, cost, policy.headroom_multiplier, now)
    }

    /// Whether a replica may answer for `limit` at all.
    pub fn replica_eligible(&self, limit: &LimitConfig, policy: &CachePolicy) -> bool {
        self.replica.is_some() && policy.allow_replica && !limit.requires_primary && limit.scope == Scope::Read
    }

    /// Ask the replica, bounded by `timeout`. `None` means fall through to the store.
    ///
    /// Tokens this process still owes for `key` are invisible to the replica, so they are
    /// taken off its estimate before the safety margin is applied. An accepted answer adds
    /// `cost` to that debt. `now` is the caller's clock.
    pub async fn lookup_replica(
        &self,
        key: &BucketKey,
        limit: &LimitConfig,
        cost: f64,
        policy: &CachePolicy,
        timeout: Duration,
        now: u64,
    ) -> Option<RateLimitResult> {
        let replica = self.replica.as_ref()?;
        let read = match tokio::time::timeout(timeout, replica.peek(key, limit.capacity, limit.refill_rate)).await
        {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                tracing::debug!(%key, error = %ReplicaError::from(e), "replica read failed");
                return None;
            }
            Err(_) => {
                tracing::debug!(%key, ?timeout, "replica read timed out");
                return None;
            }
        };

        if read.lag > policy.max_replica_lag {
            let stale = ReplicaError::Stale { lag: read.lag, max: policy.max_replica_lag };
            tracing::debug!(%key, error = %stale, "ignoring replica answer");
            return None;
        }
        let required = cost * policy.replica_safety_margin;
        let Some(owed) = self.local.try_owe(key, cost, read.estimated_tokens - required, now) else {
            let owed = self.local.unsettled(key);
            tracing::debug!(%key, estimated = read.estimated_tokens, owed, required, "replica estimate below safety margin");
            return None;
        };

        let remaining = (read.estimated_tokens - owed - cost).clamp(0.0, limit.capacity);
        Some(RateLimitResult {
            allowed: true,
            remaining,
            limit: limit.capacity,
            reset_at: now.saturating_add(refill_millis(limit.capacity - remaining, limit.refill_rate)),
            retry_after: None,
            source: Source::Replica,
            expires_at: now,
        })
    }

    /// Remember an authoritative answer in L1 for `ttl`.
    pub fn remember(&self, key: BucketKey, result: &RateLimitResult, ttl: Duration, now: u64) {
        self.local.insert(key, result, ttl, now);
    }

    pub fn invalidate(&self, key: &BucketKey) {
        self.local.remove(key);
    }
}

/// Milliseconds needed to refill `tokens` at `rate` per second.
fn refill_millis(tokens: f64, rate: f64) -> u64 {
    if tokens <= 0.0 || rate <= 0.0 {
        return 0;
    }
    (tokens / rate * 1000.0).ceil() as u64
}
