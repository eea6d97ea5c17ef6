//! Open-state backoff for the circuit breaker.
//!
//! The breaker starts at `min`; each failed half-open probe doubles the current backoff
//! and adds a random jitter in `[0, max_jitter]`, saturating at `max`. Closing the circuit
//! resets it to `min`.
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate::backoff::BreakerBackoff;
//!
//! let backoff = BreakerBackoff::new(Duration::from_secs(1), Duration::from_secs(30))
//!     .unwrap()
//!     .with_max_jitter(Duration::ZERO);
//! assert_eq!(backoff.escalate(Duration::from_secs(1)), Duration::from_secs(2));
//! assert_eq!(backoff.escalate(Duration::from_secs(20)), Duration::from_secs(30)); // capped
//! ```

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MinMustBePositive,
    MaxLessThanMin { min: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MinMustBePositive => write!(f, "minimum backoff must be greater than zero"),
            BackoffError::MaxLessThanMin { min, max } => {
                write!(f, "max ({:?}) must be >= min ({:?})", max, min)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Doubling backoff with additive jitter, bounded by `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerBackoff {
    min: Duration,
    max: Duration,
    max_jitter: Duration,
}

impl Default for BreakerBackoff {
    /// 1s to 60s with up to 100ms of jitter.
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl BreakerBackoff {
    /// Jitter defaults to a tenth of `min`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, BackoffError> {
        if min.is_zero() {
            return Err(BackoffError::MinMustBePositive);
        }
        if max < min {
            return Err(BackoffError::MaxLessThanMin { min, max });
        }
        Ok(Self { min, max, max_jitter: min / 10 })
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Next backoff after a failed probe: `min(max, current * 2 + jitter)`.
    pub fn escalate(&self, current: Duration) -> Duration {
        self.escalate_with_rng(current, &mut rng())
    }

    /// [`escalate`](Self::escalate) with a caller-supplied RNG (for testing).
    pub fn escalate_with_rng<R: Rng>(&self, current: Duration, rng: &mut R) -> Duration {
        let jitter_millis = as_millis_saturated(self.max_jitter);
        let jitter = if jitter_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..=jitter_millis))
        };
        current.max(self.min).saturating_mul(2).saturating_add(jitter).min(self.max)
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
