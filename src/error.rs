//! Error types for the limiter and its collaborators.
//!
//! Only [`RateLimitError`] ever reaches a caller of
//! [`RateLimiter::check_and_consume`](crate::RateLimiter::check_and_consume): transient
//! store problems are absorbed by the circuit breaker and the degradation handler and
//! still produce a [`RateLimitResult`](crate::RateLimitResult).

use std::time::Duration;
use thiserror::Error;

/// Failures reported by an authoritative store or replica.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Connection refused, reset, or otherwise unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer in time.
    #[error("store call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The store returned state that cannot be valid (e.g. negative tokens).
    #[error("invariant violated for {key}: {detail}")]
    InvariantViolation { key: String, detail: String },
}

/// Why a replica answer was not used. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicaError {
    #[error("replica lag {lag:?} exceeds allowed {max:?}")]
    Stale { lag: Duration, max: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal configuration problems. Surfaced immediately and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown tier '{0}'")]
    UnknownTier(String),
    #[error("invalid limit '{name}': {reason}")]
    InvalidLimit { name: String, reason: String },
    #[error("cost must be finite and >= 0 (got {0})")]
    InvalidCost(f64),
    #[error("no limits apply to this request")]
    EmptyLimitSet,
    #[error("invalid tier table: {0}")]
    InvalidTierTable(String),
    #[error("invalid circuit breaker config: {0}")]
    InvalidBreaker(String),
    #[error("invalid limiter settings: {0}")]
    InvalidSettings(String),
}

/// Error returned by [`RateLimiter::check_and_consume`](crate::RateLimiter::check_and_consume).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Outcome of a call routed through the [`CircuitBreaker`](crate::CircuitBreaker).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError<E> {
    /// The breaker is open (or its half-open probe slots are taken); nothing was called.
    #[error("circuit breaker open ({failure_count} failures, retry in {retry_in:?})")]
    CircuitOpen { failure_count: usize, retry_in: Duration },
    /// The call exceeded the breaker's timeout.
    #[error("call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The call's task was cancelled before finishing (runtime shutting down).
    #[error("call cancelled before completion")]
    Cancelled,
    /// The protected operation itself failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// How a failed store call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Short-circuited by the breaker; the store was never contacted.
    Rejected { retry_in: Duration },
    /// The store was contacted (or timed out) and failed.
    Failed,
}

/// Single classification point for store call errors.
///
/// Invariant violations are logged here and otherwise treated exactly like an
/// unreachable store.
pub fn classify(err: &CallError<StoreError>) -> CallFailure {
    match err {
        CallError::CircuitOpen { retry_in, .. } => CallFailure::Rejected { retry_in: *retry_in },
        CallError::Timeout { elapsed, timeout } => {
            tracing::warn!(?elapsed, ?timeout, "store call timed out");
            CallFailure::Failed
        }
        CallError::Cancelled => {
            tracing::warn!("store call cancelled");
            CallFailure::Failed
        }
        CallError::Inner(StoreError::InvariantViolation { key, detail }) => {
            tracing::error!(%key, %detail, "store returned invalid bucket state; failing safe");
            CallFailure::Failed
        }
        CallError::Inner(e) => {
            tracing::warn!(error = %e, "store call failed");
            CallFailure::Failed
        }
    }
}
