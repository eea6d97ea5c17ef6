//! Fallback admission while the authoritative store is unreachable.
//!
//! Each `(identifier, limit)` gets a fixed-window counter with a tier-indexed quota that
//! ignores the real bucket. Costs are scaled by the tier's multiplier (>= 1) so that an
//! outage is never a cheaper time to hammer the service.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::DynamicConfig;
use crate::clock::{millis, Clock, SystemClock};
use crate::config::TierTable;
use crate::error::ConfigError;
use crate::types::{BucketKey, LimitConfig, RateLimitResult, Source};

/// Per-key fixed-window counter used only while degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationState {
    pub window_start: u64,
    /// Multiplied cost admitted in the current window.
    pub tokens_used: f64,
    /// Requests seen in the current window, admitted or not.
    pub request_count: u64,
}

/// Admission policy used when the store cannot be asked.
pub trait DegradationHandler: Send + Sync + std::fmt::Debug {
    /// Decide without the store. Only fails on configuration problems (unknown tier).
    fn handle_failure(
        &self,
        key: &BucketKey,
        limit: &LimitConfig,
        cost: f64,
        tier: &str,
    ) -> Result<RateLimitResult, ConfigError>;

    /// Drop any fallback state for `key` (the store is trusted again).
    fn forget(&self, key: &BucketKey);

    /// Evict idle state; returns how many entries were removed.
    fn sweep(&self, _now: u64) -> usize {
        0
    }
}

/// Tier-indexed fixed-window quota.
#[derive(Debug)]
pub struct FixedWindowDegradation {
    tiers: DynamicConfig<TierTable>,
    states: DashMap<BucketKey, DegradationState>,
    window: Duration,
    result_ttl: Duration,
    idle_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FixedWindowDegradation {
    /// 60s windows, 1s result validity, state idle for 5 minutes is swept.
    pub fn new(tiers: DynamicConfig<TierTable>) -> Self {
        Self {
            tiers,
            states: DashMap::new(),
            window: Duration::from_secs(60),
            result_ttl: Duration::from_secs(1),
            idle_ttl: Duration::from_secs(300),
            clock: Arc::new(SystemClock::default()),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// How long a degraded answer stays valid.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self, key: &BucketKey) -> Option<DegradationState> {
        self.states.get(key).map(|s| *s)
    }

    /// Keys currently holding fallback state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

impl DegradationHandler for FixedWindowDegradation {
    fn handle_failure(
        &self,
        key: &BucketKey,
        _limit: &LimitConfig,
        cost: f64,
        tier: &str,
    ) -> Result<RateLimitResult, ConfigError> {
        let table = self.tiers.get();
        let spec = table.get(tier)?;
        let now = self.clock.now_millis();
        let window = millis(self.window).max(1);
        let charged = cost * spec.cost_multiplier;

        let mut state = self.states.entry(key.clone()).or_insert(DegradationState {
            window_start: now,
            tokens_used: 0.0,
            request_count: 0,
        });
        if now.saturating_sub(state.window_start) >= window {
            // Stay on the original window grid.
            let window_start = state.window_start + (now - state.window_start) / window * window;
            *state = DegradationState { window_start, tokens_used: 0.0, request_count: 0 };
        }
        state.request_count += 1;

        let allowed = state.tokens_used + charged <= spec.quota;
        if allowed {
            state.tokens_used += charged;
        }
        let reset_at = state.window_start + window;
        let remaining = (spec.quota - state.tokens_used).max(0.0);
        let request_count = state.request_count;
        drop(state);

        if allowed {
            tracing::debug!(%key, tier, charged, remaining, "degraded admission");
        } else {
            tracing::info!(%key, tier, charged, remaining, request_count, "degraded quota exhausted");
        }

        Ok(RateLimitResult {
            allowed,
            remaining,
            limit: spec.quota,
            reset_at,
            retry_after: (!allowed).then(|| Duration::from_millis(reset_at.saturating_sub(now))),
            source: Source::Degraded,
            expires_at: now.saturating_add(millis(self.result_ttl)),
        })
    }

    fn forget(&self, key: &BucketKey) {
        self.states.remove(key);
    }

    fn sweep(&self, now: u64) -> usize {
        let horizon = millis(self.window).saturating_add(millis(self.idle_ttl));
        let before = self.states.len();
        self.states.retain(|_, s| now.saturating_sub(s.window_start) < horizon);
        before.saturating_sub(self.states.len())
    }
}
