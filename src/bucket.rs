//! Token bucket arithmetic shared by every store implementation.
//!
//! The functions here are pure: a store reads the current [`BucketState`], calls
//! [`refill_and_consume`] with its own clock reading, and persists the returned state in
//! the same critical section. A scripted remote store runs the same steps server-side.

use std::time::Duration;

/// Persisted per-key state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Store-clock milliseconds of the last refill computation.
    pub last_refill_at: u64,
}

/// Parameters of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    pub cost: f64,
    /// Tokens already admitted elsewhere (L1 hits, replica answers) and owed to this
    /// bucket. Deducted before `cost` is judged and never a reason to deny.
    pub settle: f64,
}

/// Result of an atomic refill-and-consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub remaining: f64,
    /// Store-clock milliseconds at which the bucket is full again.
    pub reset_at: u64,
    pub retry_after: Option<Duration>,
    /// The store clock reading used for the computation.
    pub now: u64,
}

/// Result of a non-consuming read. `would_allow` means at least one whole token is available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeekOutcome {
    pub would_allow: bool,
    pub estimated_tokens: f64,
    pub now: u64,
}

/// Tokens available at `now`, capped at `capacity`.
pub fn refill(state: Option<BucketState>, capacity: f64, refill_rate: f64, now: u64) -> f64 {
    match state {
        None => capacity,
        Some(BucketState { tokens, last_refill_at }) => {
            let elapsed_secs = now.saturating_sub(last_refill_at) as f64 / 1_000.0;
            (tokens + elapsed_secs * refill_rate).min(capacity).max(0.0)
        }
    }
}

/// Refill, then consume `cost` if possible. Returns the state to persist.
///
/// The refill timestamp advances to `now` even when the request is denied, so rejected
/// attempts cannot bank time against the refill clock. `params.settle` is paid first and
/// floors the bucket at zero.
pub fn refill_and_consume(
    state: Option<BucketState>,
    params: &BucketParams,
    now: u64,
) -> (BucketState, ConsumeOutcome) {
    let refilled = refill(state, params.capacity, params.refill_rate, now);
    let available = (refilled - params.settle.max(0.0)).max(0.0);

    if available >= params.cost {
        let remaining = available - params.cost;
        let outcome = ConsumeOutcome {
            allowed: true,
            remaining,
            reset_at: now + full_in_millis(params.capacity - remaining, params.refill_rate),
            retry_after: None,
            now,
        };
        (BucketState { tokens: remaining, last_refill_at: now }, outcome)
    } else {
        let missing = params.cost - available;
        let outcome = ConsumeOutcome {
            allowed: false,
            remaining: available,
            reset_at: now + full_in_millis(params.capacity - available, params.refill_rate),
            retry_after: Some(Duration::from_secs((missing / params.refill_rate).ceil() as u64)),
            now,
        };
        (BucketState { tokens: available, last_refill_at: now }, outcome)
    }
}

/// The same refill computation without any mutation.
pub fn peek(state: Option<BucketState>, capacity: f64, refill_rate: f64, now: u64) -> PeekOutcome {
    let estimated_tokens = refill(state, capacity, refill_rate, now);
    PeekOutcome { would_allow: estimated_tokens >= 1.0, estimated_tokens, now }
}

fn full_in_millis(missing: f64, refill_rate: f64) -> u64 {
    if missing <= 0.0 {
        return 0;
    }
    (missing / refill_rate * 1_000.0).ceil() as u64
}
