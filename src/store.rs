//! Authoritative bucket storage.
//!
//! - [`StoreClient`]: the seam to the backing key/value store. Implementations must run
//!   [`bucket::refill_and_consume`](crate::bucket::refill_and_consume) atomically per key,
//!   in a single round trip, using the store's own clock.
//! - [`InMemoryStore`]: process-local implementation used for tests, benchmarks, and
//!   single-node deployments.
//! - [`ReplicaReader`]: optional lagging read-only view used for non-critical reads.
//!
//! # Key layout
//!
//! One entry per [`BucketKey`] (`rl:{kind}:{key}:{limit}`) holding the fields `tokens` and
//! `last_refill_at`, with a TTL of `window_seconds` plus a safety margin so clock drift
//! between nodes cannot expire a bucket early.

use async_trait::async_trait;
use std::time::Duration;

use crate::bucket::{BucketParams, BucketState, ConsumeOutcome, PeekOutcome};
use crate::error::StoreError;
use crate::types::{BucketKey, LimitConfig};

pub mod memory;
pub mod replica;

pub use memory::InMemoryStore;
pub use replica::{InMemoryReplica, ReplicaRead, ReplicaReader};

/// Default extra TTL on stored buckets.
pub const DEFAULT_TTL_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// One atomic refill-and-consume call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub key: BucketKey,
    pub params: BucketParams,
    /// TTL applied to the key after the write.
    pub ttl: Duration,
}

impl ConsumeRequest {
    /// Build a request for `limit`, keeping the key for `window_seconds + safety_margin`.
    pub fn new(key: BucketKey, limit: &LimitConfig, cost: f64, safety_margin: Duration) -> Self {
        Self {
            key,
            params: BucketParams {
                capacity: limit.capacity,
                refill_rate: limit.refill_rate,
                cost,
                settle: 0.0,
            },
            ttl: Duration::from_secs(limit.window_seconds).saturating_add(safety_margin),
        }
    }

    /// Also pay `owed` tokens admitted without a store round trip.
    pub fn settling(mut self, owed: f64) -> Self {
        self.params.settle = owed;
        self
    }
}

/// Access to the authoritative bucket state.
#[async_trait]
pub trait StoreClient: Send + Sync + std::fmt::Debug {
    /// Atomically refill and try to consume `request.params.cost` tokens.
    async fn refill_and_consume(&self, request: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError>;

    /// Refill computation without persisting anything.
    async fn peek(&self, key: &BucketKey, capacity: f64, refill_rate: f64) -> Result<PeekOutcome, StoreError>;
}

/// Reject state that no correct writer could have produced.
pub(crate) fn check_state(key: &BucketKey, state: &BucketState) -> Result<(), StoreError> {
    if !state.tokens.is_finite() || state.tokens < 0.0 {
        return Err(StoreError::InvariantViolation {
            key: key.to_string(),
            detail: format!("tokens={}", state.tokens),
        });
    }
    Ok(())
}
