//! The admission entry point.
//!
//! For each applicable limit, [`RateLimiter::check_and_consume`] tries, in order:
//!
//! 1. the process-local L1 cache (headroom permitting),
//! 2. a lagging replica (non-critical read limits of keys that are not recovering),
//! 3. the authoritative store, through the circuit breaker,
//! 4. the degradation handler, when the store call fails or is short-circuited.
//!
//! Tokens admitted by the first two tiers are owed to the bucket and paid by the key's
//! next store call.
//!
//! Per-limit answers are combined into the most restrictive one; the first denial wins
//! immediately. Only configuration problems are returned as errors.

use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::DynamicConfig;
use crate::cache::{CachePolicy, CachePolicyProvider, TierCachePolicies, TieredCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{millis, Clock, SystemClock};
use crate::config::{BreakerSettings, LimiterSettings, TierTable};
use crate::degradation::{DegradationHandler, FixedWindowDegradation};
use crate::error::{classify, CallFailure, ConfigError, RateLimitError};
use crate::recovery::{RecoveryPhase, RecoveryProgress, RecoveryTracker};
use crate::store::{ConsumeRequest, ReplicaReader, StoreClient};
use crate::sweeper::{Sweep, Sweeper, SweeperHandle};
use crate::types::{BucketKey, Identifier, LimitConfig, RateLimitResult, Source};

/// Floor for `retry_after` on requires-primary denials during an outage.
const MIN_OUTAGE_RETRY: Duration = Duration::from_secs(1);

/// Distributed, tier-aware rate limiter. Clones share all state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn StoreClient>,
    cache: TieredCache,
    policies: Arc<dyn CachePolicyProvider>,
    degradation: Arc<dyn DegradationHandler>,
    recovery: RecoveryTracker,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    tiers: DynamicConfig<TierTable>,
}

impl RateLimiter {
    pub fn builder<S: StoreClient + 'static>(store: S) -> RateLimiterBuilder {
        RateLimiterBuilder::new(Arc::new(store))
    }

    /// Check every limit in `limits` for `identifier` and consume `cost` from each.
    ///
    /// # Errors
    /// [`RateLimitError::Configuration`] if `cost` is negative or not finite, `limits` is
    /// empty, a limit is malformed, or `tier` is unknown. Nothing is consumed in that case.
    /// Store failures are never errors: they yield a degraded result instead.
    pub async fn check_and_consume(
        &self,
        identifier: &Identifier,
        tier: &str,
        limits: &[LimitConfig],
        cost: f64,
    ) -> Result<RateLimitResult, RateLimitError> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(ConfigError::InvalidCost(cost).into());
        }
        if limits.is_empty() {
            return Err(ConfigError::EmptyLimitSet.into());
        }
        let mut planned = Vec::with_capacity(limits.len());
        for limit in limits {
            limit.validate()?;
            planned.push((limit, self.inner.policies.policy(limit, tier)?));
        }

        let mut verdict: Option<RateLimitResult> = None;
        for (limit, policy) in planned {
            let key = BucketKey::new(identifier, limit);
            let result = self.check_limit(&key, tier, limit, &policy, cost).await?;
            if !result.allowed {
                tracing::debug!(%key, source = %result.source, retry_after = ?result.retry_after, "request denied");
                return Ok(result);
            }
            verdict = match verdict {
                Some(best) if !result.more_restrictive_than(&best) => Some(best),
                _ => Some(result),
            };
        }
        verdict.ok_or_else(|| ConfigError::EmptyLimitSet.into())
    }

    async fn check_limit(
        &self,
        key: &BucketKey,
        tier: &str,
        limit: &LimitConfig,
        policy: &CachePolicy,
        cost: f64,
    ) -> Result<RateLimitResult, ConfigError> {
        let inner = &*self.inner;
        let now = inner.clock.now_millis();

        if let Some(hit) = inner.cache.lookup_local(key, cost, policy, now) {
            return Ok(hit);
        }

        let recovering = inner.recovery.is_recovering(key);
        if !recovering && inner.cache.replica_eligible(limit, policy) {
            let timeout = inner.breaker.config().call_timeout();
            if let Some(estimate) = inner.cache.lookup_replica(key, limit, cost, policy, timeout, now).await {
                return Ok(estimate);
            }
        }

        let store = Arc::clone(&inner.store);
        let owed = inner.cache.local().take_unsettled(key);
        let request =
            ConsumeRequest::new(key.clone(), limit, cost, inner.settings.ttl_safety_margin).settling(owed);
        match inner.breaker.call(move || async move { store.refill_and_consume(&request).await }).await {
            Ok(outcome) => {
                let result = RateLimitResult {
                    allowed: outcome.allowed,
                    remaining: outcome.remaining,
                    limit: limit.capacity,
                    reset_at: outcome.reset_at,
                    retry_after: outcome.retry_after,
                    source: Source::Primary,
                    expires_at: now.saturating_add(millis(policy.ttl)),
                };
                let phase = match inner.recovery.record_success(key, now) {
                    RecoveryProgress::Restored => {
                        inner.degradation.forget(key);
                        tracing::info!(%key, "store trusted again for key");
                        None
                    }
                    RecoveryProgress::InPhase(phase) => Some(phase),
                    RecoveryProgress::Untracked => None,
                };
                self.remember(key, &result, policy, phase, now);
                Ok(result)
            }
            Err(err) => {
                // Unpaid unless the store confirmed it. A timed-out call may have paid it.
                inner.cache.local().restore_unsettled(key, owed, now);
                let failure = classify(&err);
                if failure == CallFailure::Failed {
                    inner.recovery.record_failure(key, now);
                }
                inner.cache.invalidate(key);
                if limit.requires_primary {
                    return Ok(self.outage_denial(key, limit, failure, now));
                }
                inner.degradation.handle_failure(key, limit, cost, tier)
            }
        }
    }

    /// Cache an authoritative answer with the trust the key's recovery phase allows.
    fn remember(
        &self,
        key: &BucketKey,
        result: &RateLimitResult,
        policy: &CachePolicy,
        phase: Option<RecoveryPhase>,
        now: u64,
    ) {
        let cache = &self.inner.cache;
        if !result.allowed {
            cache.invalidate(key);
            return;
        }
        if !policy.caches_locally() {
            return;
        }
        let policy = match phase.map(RecoveryPhase::cache_ttl_divisor) {
            None => *policy,
            Some(Some(divisor)) => policy.with_ttl_divided(divisor),
            Some(None) => {
                tracing::debug!(%key, "recovering key; not caching");
                return;
            }
        };
        cache.remember(key.clone(), result, policy.ttl, now);
    }

    /// Limits that must be answered by the store fail closed during an outage.
    fn outage_denial(&self, key: &BucketKey, limit: &LimitConfig, failure: CallFailure, now: u64) -> RateLimitResult {
        let wait = match failure {
            CallFailure::Rejected { retry_in } => retry_in,
            CallFailure::Failed => self.inner.breaker.retry_in(),
        }
        .max(MIN_OUTAGE_RETRY);
        tracing::warn!(%key, ?wait, "store unavailable for a primary-only limit; denying");
        RateLimitResult {
            allowed: false,
            remaining: 0.0,
            limit: limit.capacity,
            reset_at: now.saturating_add(millis(wait)),
            retry_after: Some(wait),
            source: Source::Degraded,
            expires_at: now.saturating_add(millis(self.inner.settings.degraded_ttl)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn recovery(&self) -> &RecoveryTracker {
        &self.inner.recovery
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    /// Shared tier table; replacing it takes effect on the next check.
    pub fn tiers(&self) -> &DynamicConfig<TierTable> {
        &self.inner.tiers
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.inner.settings
    }

    /// Sweep expired state every `interval` until the handle is stopped or dropped.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        Sweeper::start(self.clone(), interval, Arc::clone(&self.inner.clock))
    }
}

impl Sweep for RateLimiter {
    fn sweep(&self, now: u64) -> usize {
        let inner = &*self.inner;
        inner.cache.local().purge_expired(now) + inner.degradation.sweep(now) + inner.recovery.sweep(now)
    }
}

/// Builder for [`RateLimiter`]. Everything but the store has a default.
#[derive(Debug)]
pub struct RateLimiterBuilder {
    store: Arc<dyn StoreClient>,
    replica: Option<Arc<dyn ReplicaReader>>,
    policies: Option<Arc<dyn CachePolicyProvider>>,
    degradation: Option<Arc<dyn DegradationHandler>>,
    breaker: Option<CircuitBreaker>,
    breaker_config: Option<CircuitBreakerConfig>,
    clock: Option<Arc<dyn Clock>>,
    settings: LimiterSettings,
    tiers: DynamicConfig<TierTable>,
}

impl RateLimiterBuilder {
    fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            replica: None,
            policies: None,
            degradation: None,
            breaker: None,
            breaker_config: None,
            clock: None,
            settings: LimiterSettings::default(),
            tiers: DynamicConfig::new(TierTable::default()),
        }
    }

    pub fn replica<R: ReplicaReader + 'static>(mut self, replica: R) -> Self {
        self.replica = Some(Arc::new(replica));
        self
    }

    /// Tier table shared by the default policy provider and degradation handler.
    pub fn tiers(mut self, tiers: DynamicConfig<TierTable>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn cache_policies<P: CachePolicyProvider + 'static>(mut self, policies: P) -> Self {
        self.policies = Some(Arc::new(policies));
        self
    }

    pub fn degradation<D: DegradationHandler + 'static>(mut self, degradation: D) -> Self {
        self.degradation = Some(Arc::new(degradation));
        self
    }

    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Build the breaker from deserialized settings. It runs on the limiter's clock.
    /// Ignored when [`breaker`](Self::breaker) supplies a ready-made one.
    ///
    /// # Errors
    /// [`ConfigError::InvalidBreaker`] if the settings do not form a valid breaker.
    pub fn breaker_settings(mut self, settings: BreakerSettings) -> Result<Self, ConfigError> {
        self.breaker_config = Some(settings.into_config()?);
        Ok(self)
    }

    /// Clock for cache expiry, degradation windows, and recovery bookkeeping. Also used
    /// by the default breaker.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        self.settings.validate()?;
        self.tiers.get().validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::default()));
        let breaker_config = self.breaker_config;
        let breaker = self.breaker.unwrap_or_else(|| {
            CircuitBreaker::new(breaker_config.unwrap_or_default()).with_clock(Arc::clone(&clock))
        });
        let policies = self
            .policies
            .unwrap_or_else(|| Arc::new(TierCachePolicies::new(self.tiers.clone())));
        let degradation = self.degradation.unwrap_or_else(|| {
            Arc::new(
                FixedWindowDegradation::new(self.tiers.clone())
                    .with_window(self.settings.degraded_window)
                    .with_result_ttl(self.settings.degraded_ttl)
                    .with_idle_ttl(self.settings.degradation_idle_ttl)
                    .with_shared_clock(Arc::clone(&clock)),
            )
        });

        Ok(RateLimiter {
            inner: Arc::new(Inner {
                store: self.store,
                cache: TieredCache::new(self.settings.max_cache_entries, self.replica)
                    .with_unsettled_ttl(self.settings.unsettled_idle_ttl),
                policies,
                degradation,
                recovery: RecoveryTracker::new(self.settings.recovery, self.settings.recovery_idle_ttl),
                breaker,
                clock,
                settings: self.settings,
                tiers: self.tiers,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use crate::types::Criticality;

    fn limiter(clock: &ManualClock, store: &InMemoryStore) -> RateLimiter {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(3)
                .backoff(Duration::from_secs(1), Duration::from_secs(8))
                .max_jitter(Duration::ZERO)
                .build()
                .unwrap(),
        )
        .with_clock(clock.clone());
        RateLimiter::builder(store.clone()).clock(clock.clone()).breaker(breaker).build().unwrap()
    }

    fn critical(name: &str, capacity: f64) -> LimitConfig {
        LimitConfig::new(name, capacity, 1.0, 60).with_criticality(Criticality::Critical)
    }

    #[tokio::test]
    async fn rejects_bad_input_without_consuming() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [critical("a", 10.0)];

        let err = limiter.check_and_consume(&who, "free", &limits, -1.0).await.unwrap_err();
        assert_eq!(err, RateLimitError::Configuration(ConfigError::InvalidCost(-1.0)));
        let err = limiter.check_and_consume(&who, "free", &[], 1.0).await.unwrap_err();
        assert_eq!(err, RateLimitError::Configuration(ConfigError::EmptyLimitSet));
        let err = limiter.check_and_consume(&who, "gold", &limits, 1.0).await.unwrap_err();
        assert_eq!(err, RateLimitError::Configuration(ConfigError::UnknownTier("gold".into())));
        let bad = [LimitConfig::new("zero-rate", 10.0, 0.0, 60)];
        assert!(limiter.check_and_consume(&who, "free", &bad, 1.0).await.is_err());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn most_restrictive_limit_wins() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::api_key("k");
        let limits = [critical("burst", 100.0), critical("daily", 5.0)];

        let result = limiter.check_and_consume(&who, "pro", &limits, 2.0).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 3.0);
        assert_eq!(result.limit, 5.0);
        assert_eq!(result.source, Source::Primary);
    }

    #[tokio::test]
    async fn first_denial_short_circuits() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [critical("tiny", 1.0), critical("big", 100.0)];

        assert!(limiter.check_and_consume(&who, "pro", &limits, 1.0).await.unwrap().allowed);
        let calls = store.calls();
        let denied = limiter.check_and_consume(&who, "pro", &limits, 1.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(store.calls(), calls + 1);
        let big = BucketKey::new(&who, &limits[1]);
        assert_eq!(store.state(&big).unwrap().tokens, 99.0);
    }

    #[tokio::test]
    async fn l1_serves_normal_limits_then_expires() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];

        let first = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(first.source, Source::Primary);
        let second = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(second.source, Source::L1Cache);
        assert_eq!(second.remaining, 98.0);
        assert_eq!(store.calls(), 1);

        let key = BucketKey::new(&who, &limits[0]);
        assert_eq!(limiter.cache().local().unsettled(&key), 1.0);

        // Free tier caches for 2s. The refresh pays for the L1 hit: 99 + 20 capped at
        // 100, minus 1 owed, minus 1 for this call.
        clock.advance(Duration::from_secs(2));
        let third = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(third.source, Source::Primary);
        assert_eq!(third.remaining, 98.0);
        assert_eq!(store.calls(), 2);
        assert_eq!(limiter.cache().local().unsettled(&key), 0.0);
    }

    #[tokio::test]
    async fn failed_store_calls_keep_the_debt() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [LimitConfig::new("api", 10.0, 1.0, 60)];
        let key = BucketKey::new(&who, &limits[0]);

        limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        limiter.check_and_consume(&who, "free", &limits, 2.0).await.unwrap();
        assert_eq!(limiter.cache().local().unsettled(&key), 2.0);

        clock.advance(Duration::from_secs(2));
        store.set_available(false);
        let degraded = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(degraded.source, Source::Degraded);
        assert_eq!(limiter.cache().local().unsettled(&key), 2.0);

        // 9 + 2 refilled, minus 2 owed, minus 1.
        store.set_available(true);
        let paid = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(paid.source, Source::Primary);
        assert_eq!(paid.remaining, 7.0);
        assert_eq!(limiter.cache().local().unsettled(&key), 0.0);
    }

    #[tokio::test]
    async fn breaker_settings_build_a_breaker_on_the_limiter_clock() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let settings: BreakerSettings =
            serde_json::from_str(r#"{"failure_threshold": 1, "min_backoff_ms": 500, "max_jitter_ms": 0}"#).unwrap();
        let limiter = RateLimiter::builder(store.clone())
            .clock(clock.clone())
            .breaker_settings(settings)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(limiter.breaker().config().failure_threshold(), 1);

        store.set_available(false);
        let who = Identifier::user("u");
        let limits = [critical("api", 10.0)];
        limiter.check_and_consume(&who, "pro", &limits, 1.0).await.unwrap();
        assert_eq!(limiter.breaker().state(), CircuitState::Open);
        assert_eq!(limiter.breaker().retry_in(), Duration::from_millis(500));
        clock.advance(Duration::from_millis(200));
        assert_eq!(limiter.breaker().retry_in(), Duration::from_millis(300));

        let err = RateLimiter::builder(store)
            .breaker_settings(BreakerSettings { success_threshold: 0, ..BreakerSettings::default() })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBreaker(_)));
    }

    #[tokio::test]
    async fn critical_limits_always_hit_the_store() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [critical("payments", 100.0)];
        for _ in 0..3 {
            let r = limiter.check_and_consume(&who, "enterprise", &limits, 1.0).await.unwrap();
            assert_eq!(r.source, Source::Primary);
        }
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn requires_primary_fails_closed_during_outage() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        store.set_available(false);
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [critical("transfer", 10.0).requiring_primary()];

        let result = limiter.check_and_consume(&who, "enterprise", &limits, 1.0).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.source, Source::Degraded);
        assert_eq!(result.retry_after, Some(MIN_OUTAGE_RETRY));
    }

    #[tokio::test]
    async fn recovering_keys_get_shorter_cache_trust() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];
        let key = BucketKey::new(&who, &limits[0]);

        store.set_available(false);
        let degraded = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(degraded.source, Source::Degraded);
        assert_eq!(limiter.recovery().phase(&key), Some(RecoveryPhase::Testing));
        store.set_available(true);

        // Testing: nothing is cached, every call goes to the store.
        for _ in 0..4 {
            let r = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
            assert_eq!(r.source, Source::Primary);
        }
        assert!(limiter.cache().local().remaining(&key).is_none());

        // Fifth success moves to Partial and caches for a quarter of 2s.
        limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(limiter.recovery().phase(&key), Some(RecoveryPhase::Partial));
        let hit = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(hit.source, Source::L1Cache);
        assert_eq!(hit.expires_at, 500);
    }

    #[tokio::test]
    async fn sweep_clears_idle_state() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter = limiter(&clock, &store);
        let who = Identifier::user("u");
        let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];
        limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(limiter.cache().local().len(), 1);

        clock.advance(Duration::from_secs(3));
        assert_eq!(limiter.sweep(clock.now_millis()), 1);
        assert!(limiter.cache().local().is_empty());
    }
}
