mod support;

use std::time::Duration;
use tollgate::config::RecoveryThresholds;
use tollgate::types::BucketKey;
use tollgate::{
    Clock, Identifier, InMemoryStore, LimitConfig, LimiterSettings, ManualClock, RateLimiter, RecoveryPhase,
    Source, TierSpec, TierTable,
};

fn quick_recovery(store: &InMemoryStore, clock: &ManualClock) -> RateLimiter {
    let settings = LimiterSettings {
        recovery: RecoveryThresholds { partial: 1, stabilizing: 2, normal: 3, min_success_ratio: 0.2 },
        ..LimiterSettings::default()
    };
    RateLimiter::builder(store.clone())
        .clock(clock.clone())
        .breaker(support::breaker(100, clock))
        .settings(settings)
        .build()
        .unwrap()
}

async fn degraded_admissions(limiter: &RateLimiter, who: &Identifier, limits: &[LimitConfig]) -> usize {
    let mut admitted = 0;
    for _ in 0..10 {
        let result = limiter.check_and_consume(who, "free", limits, 1.0).await.unwrap();
        assert_eq!(result.source, Source::Degraded);
        if result.allowed {
            admitted += 1;
        }
    }
    admitted
}

#[tokio::test]
async fn outage_recovery_restores_trust_and_forgets_degraded_windows() {
    let clock = ManualClock::starting_at(0);
    let store = InMemoryStore::with_clock(clock.clone());
    let limiter = quick_recovery(&store, &clock);
    let who = Identifier::user("ivy");
    let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];
    let key = BucketKey::new(&who, &limits[0]);

    store.set_available(false);
    assert_eq!(degraded_admissions(&limiter, &who, &limits).await, 6);
    assert_eq!(limiter.recovery().phase(&key), Some(RecoveryPhase::Testing));

    store.set_available(true);
    let mut phases = Vec::new();
    for _ in 0..3 {
        // Step past any shortened L1 entry so every call reaches the store.
        clock.advance(Duration::from_secs(1));
        let result = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
        assert_eq!(result.source, Source::Primary);
        phases.push(limiter.recovery().phase(&key));
    }
    assert_eq!(phases, vec![Some(RecoveryPhase::Partial), Some(RecoveryPhase::Stabilizing), None]);

    // Still inside the first degraded window, but its exhausted state was dropped.
    clock.advance(Duration::from_secs(3));
    store.set_available(false);
    assert_eq!(degraded_admissions(&limiter, &who, &limits).await, 6);
}

#[tokio::test]
async fn failure_during_recovery_steps_back_one_phase() {
    let clock = ManualClock::starting_at(0);
    let store = InMemoryStore::with_clock(clock.clone());
    let limiter = quick_recovery(&store, &clock);
    let who = Identifier::user("jon");
    let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];
    let key = BucketKey::new(&who, &limits[0]);

    store.set_available(false);
    limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
    store.set_available(true);
    for _ in 0..2 {
        clock.advance(Duration::from_secs(1));
        limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
    }
    assert_eq!(limiter.recovery().phase(&key), Some(RecoveryPhase::Stabilizing));

    clock.advance(Duration::from_secs(1));
    store.set_available(false);
    let result = limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
    assert!(result.is_degraded());
    assert_eq!(limiter.recovery().phase(&key), Some(RecoveryPhase::Partial));
    assert_eq!(limiter.recovery().state(&key).unwrap().consecutive_successes, 0);
}

#[tokio::test]
async fn tier_reload_changes_degraded_quota() {
    let clock = ManualClock::starting_at(0);
    let store = InMemoryStore::with_clock(clock.clone());
    store.set_available(false);
    let limiter = support::limiter(&store, &clock, 100);
    let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];

    let table = TierTable::new(vec![
        TierSpec::new("enterprise", 1000.0, 1.0),
        TierSpec::new("pro", 100.0, 1.2),
        TierSpec::new("free", 3.0, 1.5),
    ])
    .unwrap();
    limiter.tiers().set(table);

    assert_eq!(degraded_admissions(&limiter, &Identifier::user("kim"), &limits).await, 2);
    let err = limiter
        .check_and_consume(&Identifier::ip("198.51.100.1"), "anonymous", &limits, 1.0)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown tier 'anonymous'");
}

#[tokio::test(start_paused = true)]
async fn sweeper_evicts_expired_state_until_stopped() {
    let clock = ManualClock::starting_at(0);
    let store = InMemoryStore::with_clock(clock.clone());
    let limiter = support::limiter(&store, &clock, 3);
    let who = Identifier::user("lee");
    let limits = [LimitConfig::new("api", 100.0, 10.0, 60)];
    limiter.check_and_consume(&who, "free", &limits, 1.0).await.unwrap();
    assert_eq!(limiter.cache().local().len(), 1);

    let handle = limiter.start_sweeper(Duration::from_secs(1));
    assert!(handle.is_running());

    // Free-tier L1 entries live for 2s.
    clock.advance(Duration::from_secs(3));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(limiter.cache().local().is_empty());

    assert_eq!(handle.stop().await, 1);
    assert_eq!(clock.now_millis(), 3_000);
}
