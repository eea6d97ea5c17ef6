//! Phased trust restoration after store failures.
//!
//! A key enters recovery on its first failed store call and climbs
//! `Testing → Partial → Stabilizing → Normal` on consecutive successes; the last step also
//! needs an overall success ratio. Any failure clears the streak and drops one phase.
//! Reaching `Normal` ends tracking for the key. A store that recovers briefly and fails
//! again therefore never gets full trust back in one step.

use dashmap::DashMap;
use std::time::Duration;

use crate::clock::millis;
use crate::config::RecoveryThresholds;
use crate::types::BucketKey;

/// How far a key has progressed back to full trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryPhase {
    Testing,
    Partial,
    Stabilizing,
    Normal,
}

impl RecoveryPhase {
    fn next(self) -> Self {
        match self {
            Self::Testing => Self::Partial,
            Self::Partial => Self::Stabilizing,
            Self::Stabilizing | Self::Normal => Self::Normal,
        }
    }

    fn previous(self) -> Self {
        match self {
            Self::Testing | Self::Partial => Self::Testing,
            Self::Stabilizing => Self::Partial,
            Self::Normal => Self::Stabilizing,
        }
    }

    /// Divisor applied to the L1 TTL in this phase; `None` disables L1 inserts.
    pub fn cache_ttl_divisor(self) -> Option<u32> {
        match self {
            Self::Testing => None,
            Self::Partial => Some(4),
            Self::Stabilizing => Some(2),
            Self::Normal => Some(1),
        }
    }
}

/// Recovery bookkeeping for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    pub consecutive_successes: u32,
    pub success_count: u64,
    pub total_count: u64,
    pub phase_entered_at: u64,
    last_seen_at: u64,
}

impl RecoveryState {
    fn new(now: u64) -> Self {
        Self {
            phase: RecoveryPhase::Testing,
            consecutive_successes: 0,
            success_count: 0,
            total_count: 0,
            phase_entered_at: now,
            last_seen_at: now,
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_count as f64
    }
}

/// What a successful store call did to a key's recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryProgress {
    /// The key was not recovering.
    Untracked,
    /// Still recovering, in this phase.
    InPhase(RecoveryPhase),
    /// The key just reached `Normal`; its recovery and degradation state can go.
    Restored,
}

/// Per-key recovery state machine.
#[derive(Debug)]
pub struct RecoveryTracker {
    states: DashMap<BucketKey, RecoveryState>,
    thresholds: RecoveryThresholds,
    idle_ttl: Duration,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new(RecoveryThresholds::default(), Duration::from_secs(900))
    }
}

impl RecoveryTracker {
    pub fn new(thresholds: RecoveryThresholds, idle_ttl: Duration) -> Self {
        Self { states: DashMap::new(), thresholds, idle_ttl }
    }

    /// Current phase, or `None` when the key is fully trusted.
    pub fn phase(&self, key: &BucketKey) -> Option<RecoveryPhase> {
        self.states.get(key).map(|s| s.phase)
    }

    pub fn state(&self, key: &BucketKey) -> Option<RecoveryState> {
        self.states.get(key).map(|s| *s)
    }

    pub fn is_recovering(&self, key: &BucketKey) -> bool {
        self.states.contains_key(key)
    }

    /// Keys currently recovering.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Record a successful store call. A key that is not recovering stays untracked.
    pub fn record_success(&self, key: &BucketKey, now: u64) -> RecoveryProgress {
        let Some(mut state) = self.states.get_mut(key) else {
            return RecoveryProgress::Untracked;
        };
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.success_count += 1;
        state.total_count += 1;
        state.last_seen_at = now;

        let from = state.phase;
        if self.may_advance(&state) {
            state.phase = from.next();
            state.phase_entered_at = now;
            tracing::info!(
                %key,
                ?from,
                to = ?state.phase,
                streak = state.consecutive_successes,
                ratio = state.success_ratio(),
                "recovery advanced"
            );
        }
        let phase = state.phase;
        drop(state);

        if phase == RecoveryPhase::Normal {
            self.states.remove(key);
            RecoveryProgress::Restored
        } else {
            RecoveryProgress::InPhase(phase)
        }
    }

    /// Record a failed store call, starting recovery for the key if needed.
    pub fn record_failure(&self, key: &BucketKey, now: u64) -> RecoveryPhase {
        let mut created = false;
        let mut state = self.states.entry(key.clone()).or_insert_with(|| {
            created = true;
            RecoveryState::new(now)
        });
        state.consecutive_successes = 0;
        state.total_count += 1;
        state.last_seen_at = now;

        if created {
            tracing::warn!(%key, "store failure; key entering recovery");
        } else if state.phase != RecoveryPhase::Testing {
            let from = state.phase;
            state.phase = from.previous();
            state.phase_entered_at = now;
            tracing::info!(%key, ?from, to = ?state.phase, "recovery regressed");
        }
        state.phase
    }

    /// Drop entries not touched for the idle TTL; returns how many were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let idle = millis(self.idle_ttl);
        let before = self.states.len();
        self.states.retain(|_, s| now.saturating_sub(s.last_seen_at) < idle);
        before.saturating_sub(self.states.len())
    }

    fn may_advance(&self, state: &RecoveryState) -> bool {
        let streak = state.consecutive_successes;
        match state.phase {
            RecoveryPhase::Testing => streak >= self.thresholds.partial,
            RecoveryPhase::Partial => streak >= self.thresholds.stabilizing,
            RecoveryPhase::Stabilizing => {
                streak >= self.thresholds.normal && state.success_ratio() >= self.thresholds.min_success_ratio
            }
            RecoveryPhase::Normal => false,
        }
    }
}
