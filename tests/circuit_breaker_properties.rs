use bulwark::{CircuitBreaker, CircuitProfile, CircuitState, Clock, HealthStore, ManualClock, MemoryStore, ProviderStatus};
use std::sync::Arc;

fn breaker(profile: CircuitProfile) -> (CircuitBreaker, MemoryStore, ManualClock) {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let breaker = CircuitBreaker::new("odcloud", profile, Arc::new(store.clone())).with_clock(clock.clone());
    (breaker, store, clock)
}

#[tokio::test]
async fn opens_after_threshold_for_every_profile() {
    for profile in [CircuitProfile::CRITICAL, CircuitProfile::STANDARD, CircuitProfile::FAST] {
        let (breaker, store, clock) = breaker(profile);
        for _ in 0..profile.failure_threshold() {
            assert!(breaker.can_call().await.unwrap());
            breaker.on_failure("503 from upstream").await.unwrap();
        }
        assert!(!breaker.can_call().await.unwrap());
        let health = store.get_health("odcloud").await.unwrap().unwrap();
        assert_eq!(health.status, ProviderStatus::Down);
        assert!(health.circuit_open_until.unwrap() > clock.now());
    }
}

#[tokio::test]
async fn elapsed_timer_admits_a_probe_and_clears_itself() {
    let (breaker, store, clock) = breaker(CircuitProfile::FAST);
    for _ in 0..3 {
        breaker.on_failure("timeout").await.unwrap();
    }
    clock.advance(CircuitProfile::FAST.open_timeout());

    assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
    assert!(breaker.can_call().await.unwrap());
    let health = store.get_health("odcloud").await.unwrap().unwrap();
    assert!(health.circuit_open_until.is_none());
    assert_eq!(health.status, ProviderStatus::Degraded);
    assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);

    // A failed probe re-opens immediately.
    breaker.on_failure("still down").await.unwrap();
    assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
}

#[tokio::test]
async fn success_always_resets_the_count() {
    let (breaker, store, clock) = breaker(CircuitProfile::STANDARD);
    for failures in [0u32, 2, 5] {
        for _ in 0..failures {
            breaker.on_failure("boom").await.unwrap();
        }
        clock.advance(CircuitProfile::STANDARD.open_timeout());
        breaker.on_success().await.unwrap();
        let health = store.get_health("odcloud").await.unwrap().unwrap();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.status, ProviderStatus::Healthy);
        assert!(health.circuit_open_until.is_none());
        assert_eq!(health.last_success_at, Some(clock.now()));
    }
    assert!(breaker.stats().await.unwrap().is_healthy);
}

#[tokio::test]
async fn breakers_sharing_a_store_share_state() {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let a = CircuitBreaker::new("kac", CircuitProfile::FAST, Arc::new(store.clone())).with_clock(clock.clone());
    let b = CircuitBreaker::new("kac", CircuitProfile::FAST, Arc::new(store.clone())).with_clock(clock.clone());
    for _ in 0..3 {
        a.on_failure("refused").await.unwrap();
    }
    assert!(!b.can_call().await.unwrap());
    b.reset().await.unwrap();
    assert!(a.can_call().await.unwrap());
    assert_eq!(a.state().await.unwrap(), CircuitState::Closed);
}
