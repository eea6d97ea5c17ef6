use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::InMemoryStore;
use crate::clock::millis;
use crate::error::StoreError;
use crate::types::BucketKey;

/// A non-authoritative bucket estimate from a replica.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaRead {
    pub estimated_tokens: f64,
    /// Replication delay reported by the replica at read time.
    pub lag: Duration,
}

/// Read-only, possibly lagging view of the authoritative store.
#[async_trait]
pub trait ReplicaReader: Send + Sync + std::fmt::Debug {
    async fn peek(&self, key: &BucketKey, capacity: f64, refill_rate: f64) -> Result<ReplicaRead, StoreError>;
}

/// Replica over an [`InMemoryStore`] that reports a configurable lag.
#[derive(Debug, Clone)]
pub struct InMemoryReplica {
    primary: InMemoryStore,
    lag_millis: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryReplica {
    pub fn new(primary: InMemoryStore, lag: Duration) -> Self {
        Self {
            primary,
            lag_millis: Arc::new(AtomicU64::new(millis(lag))),
            available: Arc::new(AtomicBool::new(true)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_lag(&self, lag: Duration) {
        self.lag_millis.store(millis(lag), Ordering::Release);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ReplicaReader for InMemoryReplica {
    async fn peek(&self, key: &BucketKey, capacity: f64, refill_rate: f64) -> Result<ReplicaRead, StoreError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("replica unreachable".into()));
        }
        let peeked = self.primary.snapshot_peek(key, capacity, refill_rate)?;
        Ok(ReplicaRead {
            estimated_tokens: peeked.estimated_tokens,
            lag: Duration::from_millis(self.lag_millis.load(Ordering::Acquire)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn replica_reports_lag_and_primary_estimate() {
        let primary = InMemoryStore::with_clock(ManualClock::starting_at(0));
        let replica = InMemoryReplica::new(primary.clone(), Duration::from_millis(40));
        let read = replica.peek(&BucketKey::from("r"), 8.0, 1.0).await.unwrap();
        assert_eq!(read.estimated_tokens, 8.0);
        assert_eq!(read.lag, Duration::from_millis(40));

        replica.set_lag(Duration::from_secs(3));
        let read = replica.peek(&BucketKey::from("r"), 8.0, 1.0).await.unwrap();
        assert_eq!(read.lag, Duration::from_secs(3));
        assert_eq!(replica.reads(), 2);
    }

    #[tokio::test]
    async fn replica_survives_primary_outage_flag() {
        let primary = InMemoryStore::with_clock(ManualClock::starting_at(0));
        primary.set_available(false);
        let replica = InMemoryReplica::new(primary, Duration::ZERO);
        assert!(replica.peek(&BucketKey::from("r"), 1.0, 1.0).await.is_ok());
        replica.set_available(false);
        assert!(replica.peek(&BucketKey::from("r"), 1.0, 1.0).await.is_err());
    }
}
