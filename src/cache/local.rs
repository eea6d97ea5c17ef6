use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::millis;
use crate::types::{BucketKey, RateLimitResult, Source};

#[derive(Debug)]
struct CachedEntry {
    /// `f64` bit pattern of the locally tracked remaining quota.
    remaining: AtomicU64,
    limit: f64,
    reset_at: u64,
    expires_at: u64,
}

impl CachedEntry {
    fn remaining(&self) -> f64 {
        f64::from_bits(self.remaining.load(Ordering::Acquire))
    }
}

/// Tokens admitted locally that the store has not been charged for yet.
#[derive(Debug, Clone, Copy)]
struct Debt {
    owed: f64,
    touched_at: u64,
}

/// Idle debts older than this are dropped by [`LocalCache::purge_expired`].
pub const DEFAULT_UNSETTLED_TTL: Duration = Duration::from_secs(300);

/// Process-local L1 cache of recent primary answers.
///
/// Entries are decremented only while `remaining >= cost * headroom`. Every local
/// admission is also recorded as a debt against the key, which the next store call pays
/// through [`ConsumeRequest::settling`](crate::store::ConsumeRequest::settling). Debts
/// live apart from entries, so expiry and eviction never forgive them. The headroom
/// bounds how far several processes sharing one bucket can overshoot it between
/// refreshes. Bounded to `max_entries`.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<BucketKey, Arc<CachedEntry>>,
    unsettled: DashMap<BucketKey, Debt>,
    max_entries: usize,
    unsettled_ttl: Duration,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            unsettled: DashMap::new(),
            max_entries: max_entries.max(1),
            unsettled_ttl: DEFAULT_UNSETTLED_TTL,
        }
    }

    /// Drop debts of keys that have not been touched for `ttl`.
    pub fn with_unsettled_ttl(mut self, ttl: Duration) -> Self {
        self.unsettled_ttl = ttl;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve `cost` from the cached entry for `key` if it is live and has enough headroom.
    ///
    /// Concurrent callers race through a compare-and-swap on the entry, so no decrement is
    /// lost. A served `cost` becomes a debt on `key`. The returned copy keeps the entry's
    /// expiry.
    pub fn try_consume(&self, key: &BucketKey, cost: f64, headroom: f64, now: u64) -> Option<RateLimitResult> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        if entry.expires_at <= now {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
            return None;
        }

        let required = cost * headroom;
        let mut current = entry.remaining.load(Ordering::Acquire);
        loop {
            let remaining = f64::from_bits(current);
            if remaining < required {
                tracing::debug!(%key, remaining, required, "L1 entry lacks headroom");
                return None;
            }
            let next = (remaining - cost).max(0.0);
            match entry.remaining.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.owe(key, cost, now);
                    return Some(RateLimitResult {
                        allowed: true,
                        remaining: next,
                        limit: entry.limit,
                        reset_at: entry.reset_at,
                        retry_after: None,
                        source: Source::L1Cache,
                        expires_at: entry.expires_at,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Cache an allowed answer for `ttl`. Denials and zero TTLs are ignored.
    ///
    /// Tokens still owed for `key` are taken off the answer's `remaining`, so hits that
    /// raced the store call are not served twice.
    pub fn insert(&self, key: BucketKey, result: &RateLimitResult, ttl: Duration, now: u64) {
        if !result.allowed || ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room(now);
        }
        let remaining = (result.remaining - self.unsettled(&key)).min(result.limit).max(0.0);
        let entry = CachedEntry {
            remaining: AtomicU64::new(remaining.to_bits()),
            limit: result.limit,
            reset_at: result.reset_at,
            expires_at: now.saturating_add(millis(ttl)),
        };
        self.entries.insert(key, Arc::new(entry));
    }

    pub fn remove(&self, key: &BucketKey) {
        self.entries.remove(key);
    }

    /// Drop expired entries and idle debts; returns how many were removed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());

        let idle = millis(self.unsettled_ttl);
        let before = self.unsettled.len();
        self.unsettled.retain(|_, d| now.saturating_sub(d.touched_at) < idle);
        purged + before.saturating_sub(self.unsettled.len())
    }

    /// Record `cost` admitted for `key` without a store round trip.
    pub fn owe(&self, key: &BucketKey, cost: f64, now: u64) {
        if cost <= 0.0 {
            return;
        }
        let mut debt = self.unsettled.entry(key.clone()).or_insert(Debt { owed: 0.0, touched_at: now });
        debt.owed += cost;
        debt.touched_at = now;
    }

    /// Record `cost` only if at most `max_prior` is already owed for `key`.
    ///
    /// The check and the increment happen under the key's shard lock. Returns what was
    /// owed before.
    pub fn try_owe(&self, key: &BucketKey, cost: f64, max_prior: f64, now: u64) -> Option<f64> {
        match self.unsettled.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let debt = slot.get_mut();
                if debt.owed > max_prior {
                    return None;
                }
                let prior = debt.owed;
                debt.owed += cost;
                debt.touched_at = now;
                Some(prior)
            }
            Entry::Vacant(slot) => {
                if max_prior < 0.0 {
                    return None;
                }
                slot.insert(Debt { owed: cost, touched_at: now });
                Some(0.0)
            }
        }
    }

    /// Tokens owed for `key` and not yet sent to the store.
    pub fn unsettled(&self, key: &BucketKey) -> f64 {
        self.unsettled.get(key).map_or(0.0, |d| d.owed)
    }

    /// Hand the whole debt for `key` to a store call.
    pub fn take_unsettled(&self, key: &BucketKey) -> f64 {
        self.unsettled.remove(key).map_or(0.0, |(_, d)| d.owed)
    }

    /// Put back a debt whose store call failed.
    pub fn restore_unsettled(&self, key: &BucketKey, owed: f64, now: u64) {
        self.owe(key, owed, now);
    }

    /// Locally tracked remaining quota for `key`, if cached.
    pub fn remaining(&self, key: &BucketKey) -> Option<f64> {
        self.entries.get(key).map(|e| e.remaining())
    }

    fn make_room(&self, now: u64) {
        if self.purge_expired(now) > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(victim) = victim {
            tracing::debug!(key = %victim, "L1 full; evicting entry closest to expiry");
            self.entries.remove(&victim);
        }
    }
}
