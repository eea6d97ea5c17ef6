use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{check_state, ConsumeRequest, StoreClient};
use crate::bucket::{self, BucketState, ConsumeOutcome, PeekOutcome};
use crate::clock::{millis, Clock, SystemClock};
use crate::error::StoreError;
use crate::types::BucketKey;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: u64,
}

#[derive(Debug)]
struct Inner {
    buckets: DashMap<BucketKey, StoredBucket>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    latency_millis: AtomicU64,
    calls: AtomicUsize,
}

/// In-memory authoritative store.
///
/// Each key is updated under its shard's write lock, which gives the same single critical
/// section a scripted remote store provides. The injected clock plays the role of the
/// server clock. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(SystemClock::default())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `clock` as the store's clock.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: DashMap::new(),
                clock: Arc::new(clock),
                available: AtomicBool::new(true),
                latency_millis: AtomicU64::new(0),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate an outage: while unavailable every call fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Artificial per-call latency.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.latency_millis.store(millis(latency), Ordering::Release);
    }

    /// Number of calls that reached the store (including failed ones).
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::Acquire)
    }

    /// Current persisted state for `key`, ignoring expired entries.
    pub fn state(&self, key: &BucketKey) -> Option<BucketState> {
        let now = self.inner.clock.now_millis();
        self.inner.buckets.get(key).filter(|b| b.expires_at > now).map(|b| b.state)
    }

    /// Remaining TTL of `key`.
    pub fn ttl(&self, key: &BucketKey) -> Option<Duration> {
        let now = self.inner.clock.now_millis();
        self.inner
            .buckets
            .get(key)
            .filter(|b| b.expires_at > now)
            .map(|b| Duration::from_millis(b.expires_at - now))
    }

    /// Overwrite a key without validation. Used to exercise corrupted-state handling.
    pub fn insert_raw(&self, key: BucketKey, state: BucketState, ttl: Duration) {
        let expires_at = self.inner.clock.now_millis().saturating_add(millis(ttl));
        self.inner.buckets.insert(key, StoredBucket { state, expires_at });
    }

    /// Drop expired keys; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now_millis();
        let before = self.inner.buckets.len();
        self.inner.buckets.retain(|_, b| b.expires_at > now);
        before.saturating_sub(self.inner.buckets.len())
    }

    /// Non-consuming read of the current state, bypassing the availability switch.
    pub(crate) fn snapshot_peek(
        &self,
        key: &BucketKey,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<PeekOutcome, StoreError> {
        let now = self.inner.clock.now_millis();
        let current = self.state(key);
        if let Some(state) = &current {
            check_state(key, state)?;
        }
        Ok(bucket::peek(current, capacity, refill_rate, now))
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        self.inner.calls.fetch_add(1, Ordering::AcqRel);
        let latency = self.inner.latency_millis.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn refill_and_consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        self.round_trip().await?;

        let now = self.inner.clock.now_millis();
        let expires_at = now.saturating_add(millis(request.ttl));

        match self.inner.buckets.entry(request.key.clone()) {
            Entry::Occupied(mut slot) => {
                let stored = *slot.get();
                let current = (stored.expires_at > now).then_some(stored.state);
                if let Some(state) = &current {
                    check_state(&request.key, state)?;
                }
                let (next, outcome) = bucket::refill_and_consume(current, &request.params, now);
                slot.insert(StoredBucket { state: next, expires_at });
                Ok(outcome)
            }
            Entry::Vacant(slot) => {
                let (next, outcome) = bucket::refill_and_consume(None, &request.params, now);
                slot.insert(StoredBucket { state: next, expires_at });
                Ok(outcome)
            }
        }
    }

    async fn peek(&self, key: &BucketKey, capacity: f64, refill_rate: f64) -> Result<PeekOutcome, StoreError> {
        self.round_trip().await?;
        self.snapshot_peek(key, capacity, refill_rate)
    }
}
