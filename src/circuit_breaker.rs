//! Circuit breaker guarding the authoritative store, built on lock-free atomics.
//!
//! - **Closed**: calls pass through; `failure_threshold` consecutive failures open it.
//! - **Open**: calls are rejected without touching the store until the current backoff
//!   elapses.
//! - **HalfOpen**: up to `half_open_max_calls` concurrent probes. `success_threshold`
//!   consecutive probe successes close the circuit and reset the backoff; any failure
//!   reopens it with an escalated backoff.
//!
//! Every call is bounded by `call_timeout`; a timeout counts as a failure. The protected
//! future runs on its own task, so a caller that gives up (or is cancelled) does not abort
//! a store write midway; the late result is discarded.

use crate::backoff::BreakerBackoff;
use crate::clock::{millis, Clock, MonotonicClock};
use crate::error::CallError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the backoff elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold { provided: usize },
    /// Success threshold must be > 0.
    InvalidSuccessThreshold { provided: usize },
    /// Half-open probe limit must be > 0.
    InvalidHalfOpenLimit { provided: usize },
    /// Call timeout must be > 0.
    InvalidCallTimeout(Duration),
    /// Backoff bounds are inconsistent.
    InvalidBackoff(crate::backoff::BackoffError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidSuccessThreshold { provided } => {
                write!(f, "success_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidHalfOpenLimit { provided } => {
                write!(f, "half_open_max_calls must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidCallTimeout(timeout) => {
                write!(f, "call_timeout must be > 0 (got {:?})", timeout)
            }
            CircuitBreakerError::InvalidBackoff(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    success_threshold: usize,
    half_open_max_calls: usize,
    call_timeout: Duration,
    backoff: BreakerBackoff,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            half_open_max_calls: 1,
            call_timeout: Duration::from_millis(250),
            backoff: BreakerBackoff::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Consecutive half-open successes before closing.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Maximum concurrent calls while Half-Open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }

    /// Upper bound on a single protected call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn backoff(&self) -> &BreakerBackoff {
        &self.backoff
    }
}

/// Builder for [`CircuitBreakerConfig`]; unset fields keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    success_threshold: Option<usize>,
    half_open_max_calls: Option<usize>,
    call_timeout: Option<Duration>,
    min_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    max_jitter: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, n: usize) -> Self {
        self.failure_threshold = Some(n);
        self
    }

    pub fn success_threshold(mut self, n: usize) -> Self {
        self.success_threshold = Some(n);
        self
    }

    pub fn half_open_max_calls(mut self, n: usize) -> Self {
        self.half_open_max_calls = Some(n);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = Some(min);
        self.max_backoff = Some(max);
        self
    }

    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = Some(jitter);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        let defaults = CircuitBreakerConfig::default();
        let failure_threshold = self.failure_threshold.unwrap_or(defaults.failure_threshold);
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        let success_threshold = self.success_threshold.unwrap_or(defaults.success_threshold);
        if success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        let half_open_max_calls = self.half_open_max_calls.unwrap_or(defaults.half_open_max_calls);
        if half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        let call_timeout = self.call_timeout.unwrap_or(defaults.call_timeout);
        if call_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidCallTimeout(call_timeout));
        }
        let mut backoff = BreakerBackoff::new(
            self.min_backoff.unwrap_or(defaults.backoff.min()),
            self.max_backoff.unwrap_or(defaults.backoff.max()),
        )
        .map_err(CircuitBreakerError::InvalidBackoff)?;
        if let Some(jitter) = self.max_jitter {
            backoff = backoff.with_max_jitter(jitter);
        }
        Ok(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            half_open_max_calls,
            call_timeout,
            backoff,
        })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    opened_at_millis: AtomicU64,
    backoff_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    rejected: AtomicU64,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub opened_at: u64,
    pub current_backoff: Duration,
    /// Calls short-circuited since creation or the last reset.
    pub rejected_calls: u64,
}

/// Circuit breaker for one protected resource.
/// Clones share the same underlying state via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let state = BreakerState {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            backoff_millis: AtomicU64::new(millis(config.backoff.min())),
            half_open_calls: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        };
        Self { state: Arc::new(state), config, clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock used for open/half-open timing (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state(),
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
            consecutive_successes: self.state.consecutive_successes.load(Ordering::Acquire),
            opened_at: self.state.opened_at_millis.load(Ordering::Acquire),
            current_backoff: self.current_backoff(),
            rejected_calls: self.state.rejected.load(Ordering::Acquire),
        }
    }

    /// Time until an open breaker admits a probe; zero unless Open.
    pub fn retry_in(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::ZERO;
        }
        let elapsed = self.elapsed_open();
        self.current_backoff().saturating_sub(Duration::from_millis(elapsed))
    }

    /// Force the breaker Closed and clear its counters.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.consecutive_successes.store(0, Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.rejected.store(0, Ordering::Release);
        self.state.backoff_millis.store(millis(self.config.backoff.min()), Ordering::Release);
        tracing::info!("Circuit breaker reset → closed");
    }

    /// Run `operation` under breaker protection and the configured timeout.
    ///
    /// # Errors
    /// - `CallError::CircuitOpen` if the circuit is open or the half-open probe slots are
    ///   taken; `operation` is not invoked.
    /// - `CallError::Timeout` if the call exceeds `call_timeout` (counted as a failure).
    /// - `CallError::Inner(E)` if the operation itself fails (counted as a failure).
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CallError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        Op: FnOnce() -> Fut,
    {
        struct HalfOpenGuard<'a> {
            state: &'a BreakerState,
        }
        impl Drop for HalfOpenGuard<'_> {
            fn drop(&mut self) {
                self.state.half_open_calls.fetch_sub(1, Ordering::Release);
            }
        }

        let trial = self.admit::<E>()?;
        let guard = trial.then(|| HalfOpenGuard { state: &self.state });

        let started = tokio::time::Instant::now();
        let timeout = self.config.call_timeout;
        let handle = tokio::spawn(operation());
        let result = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(inner)) => inner.map_err(CallError::Inner),
            Ok(Err(join_err)) if join_err.is_panic() => {
                drop(guard);
                self.on_failure();
                std::panic::resume_unwind(join_err.into_panic())
            }
            Ok(Err(_)) => Err(CallError::Cancelled),
            Err(_) => Err(CallError::Timeout { elapsed: started.elapsed(), timeout }),
        };
        drop(guard);

        match &result {
            Ok(_) => self.on_success(trial),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Decide whether a call may proceed. `Ok(true)` means a half-open probe slot was taken.
    fn admit<E>(&self) -> Result<bool, CallError<E>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(false),
                CircuitState::Open => {
                    let elapsed = self.elapsed_open();
                    let backoff = self.state.backoff_millis.load(Ordering::Acquire);
                    if elapsed < backoff {
                        return Err(self.reject(Duration::from_millis(backoff - elapsed)));
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // First caller after the backoff owns the first probe slot.
                            tracing::info!("Circuit breaker → half-open");
                            self.state.consecutive_successes.store(0, Ordering::Release);
                            self.state.half_open_calls.store(1, Ordering::Release);
                            return Ok(true);
                        }
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(self.reject(Duration::ZERO));
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "Circuit breaker: half-open probe"
                    );
                    return Ok(true);
                }
            }
        }
    }

    fn reject<E>(&self, retry_in: Duration) -> CallError<E> {
        self.state.rejected.fetch_add(1, Ordering::AcqRel);
        CallError::CircuitOpen {
            failure_count: self.state.consecutive_failures.load(Ordering::Acquire),
            retry_in,
        }
    }

    /// `trial` is whether the call held a half-open slot. Calls admitted while Closed can
    /// finish after the circuit opened and half-opened again; only slot holders count
    /// toward closing it. Any failure still reopens it.
    fn on_success(&self, trial: bool) {
        match self.state() {
            CircuitState::HalfOpen if trial => {
                let successes = self.state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.consecutive_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    self.state
                        .backoff_millis
                        .store(millis(self.config.backoff.min()), Ordering::Release);
                    tracing::info!(successes, "Circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let next = self.config.backoff.escalate(self.current_backoff());
                    self.state.backoff_millis.store(millis(next), Ordering::Release);
                    self.state.consecutive_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, backoff = ?next, "Circuit breaker: probe failed → open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        backoff = ?self.current_backoff(),
                        "Circuit breaker → open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.state.backoff_millis.load(Ordering::Acquire))
    }

    fn elapsed_open(&self) -> u64 {
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(opened_at)
    }
}
