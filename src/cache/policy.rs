use std::time::Duration;

use crate::adaptive::DynamicConfig;
use crate::config::TierTable;
use crate::error::ConfigError;
use crate::types::LimitConfig;

/// How far cached and replica answers may be trusted for one `(limit, tier)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePolicy {
    /// L1 entry lifetime; zero disables L1 for the limit.
    pub ttl: Duration,
    /// L1 serves only while `remaining >= cost * headroom_multiplier` (>= 1).
    pub headroom_multiplier: f64,
    pub allow_replica: bool,
    pub max_replica_lag: Duration,
    /// Replica answers count only while `estimated >= cost * replica_safety_margin` (>= 1).
    pub replica_safety_margin: f64,
}

impl CachePolicy {
    /// Always go to the authoritative store.
    pub const UNCACHED: CachePolicy = CachePolicy {
        ttl: Duration::ZERO,
        headroom_multiplier: 1.0,
        allow_replica: false,
        max_replica_lag: Duration::ZERO,
        replica_safety_margin: 1.0,
    };

    pub fn caches_locally(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Same policy with the TTL divided by `divisor`.
    pub(crate) fn with_ttl_divided(mut self, divisor: u32) -> Self {
        self.ttl /= divisor.max(1);
        self
    }
}

/// Maps `(limit, tier)` to a [`CachePolicy`]. Must be a pure function of its inputs.
pub trait CachePolicyProvider: Send + Sync + std::fmt::Debug {
    fn policy(&self, limit: &LimitConfig, tier: &str) -> Result<CachePolicy, ConfigError>;
}

/// Policy read from a live [`TierTable`].
///
/// Critical limits are never cached and never read from a replica, whatever the tier.
#[derive(Debug, Clone)]
pub struct TierCachePolicies {
    tiers: DynamicConfig<TierTable>,
}

impl TierCachePolicies {
    pub fn new(tiers: DynamicConfig<TierTable>) -> Self {
        Self { tiers }
    }
}

impl Default for TierCachePolicies {
    fn default() -> Self {
        Self::new(DynamicConfig::new(TierTable::default()))
    }
}

impl CachePolicyProvider for TierCachePolicies {
    fn policy(&self, limit: &LimitConfig, tier: &str) -> Result<CachePolicy, ConfigError> {
        let table = self.tiers.get();
        let spec = table.get(tier)?;
        if limit.is_critical() {
            return Ok(CachePolicy::UNCACHED);
        }
        Ok(CachePolicy {
            ttl: spec.cache_ttl,
            headroom_multiplier: spec.headroom_multiplier,
            allow_replica: spec.allow_replica,
            max_replica_lag: spec.max_replica_lag,
            replica_safety_margin: spec.replica_safety_margin,
        })
    }
}
