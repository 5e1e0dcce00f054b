// src/resilience/tests/guarded_storage_tests.rs

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;

use crate::config::{AlgorithmConfig, FailurePolicy, RateLimiterConfig, TokenBucketConfig};
use crate::error::{RateLimiterError, StorageError};
use crate::resilience::{
    CircuitBreakerConfig, CircuitState, GuardedStorage, HealthCheckConfig, RetryConfig,
};
use crate::storage::StorageBackend;
use crate::test_utils::{create_test_storage, FlakyStorage, HangingStorage};
use crate::RateLimiter;

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_millis(500),
        success_threshold: 1,
    }
}

fn is_circuit_open<T>(result: &crate::error::Result<T>) -> bool {
    matches!(
        result,
        Err(RateLimiterError::StoreUnavailable(StorageError::CircuitOpen))
    )
}

#[tokio::test]
async fn test_passes_calls_through_when_healthy() {
    let (storage, _) = create_test_storage();
    let guarded = GuardedStorage::new(storage, breaker_config());

    guarded.set("key", "value", None).await.unwrap();
    assert_eq!(guarded.get("key").await.unwrap(), Some("value".to_string()));
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_connection_failures_open_the_circuit() {
    let (storage, clock) = create_test_storage();
    let flaky = FlakyStorage::always(storage, StorageError::Connection("refused".into()));
    let guarded =
        GuardedStorage::with_clock(flaky.clone(), breaker_config(), Arc::new(clock.clone()));

    assert!(guarded.get("key").await.is_err());
    assert!(guarded.get("key").await.is_err());
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Open);

    // Refused without reaching the store
    let result = guarded.get("key").await;
    assert!(is_circuit_open(&result));
    assert_eq!(flaky.calls(), 2);

    // After the reset timeout one probe goes through
    clock.advance(Duration::from_millis(500));
    assert!(guarded.get("key").await.is_err());
    assert_eq!(flaky.calls(), 3);
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Open);
}

#[tokio::test]
async fn test_circuit_closes_after_store_recovers() {
    let (storage, clock) = create_test_storage();
    let flaky = FlakyStorage::failing(storage, 2, StorageError::Timeout(Duration::from_millis(5)));
    let guarded = GuardedStorage::with_clock(flaky, breaker_config(), Arc::new(clock.clone()));

    assert!(guarded.exists("key").await.is_err());
    assert!(guarded.exists("key").await.is_err());
    assert!(is_circuit_open(&guarded.exists("key").await));

    clock.advance(Duration::from_millis(500));
    assert!(!guarded.exists("key").await.unwrap());
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Closed);
}

/// Errors the store answered with say nothing about its availability
#[tokio::test]
async fn test_command_errors_do_not_trip_the_breaker() {
    let (storage, _) = create_test_storage();
    let flaky = FlakyStorage::always(storage, StorageError::Command("WRONGTYPE".into()));
    let guarded = GuardedStorage::new(flaky, breaker_config());

    for _ in 0..5 {
        assert!(guarded.get("key").await.is_err());
    }
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_unhealthy_store_is_refused() {
    let (storage, _) = create_test_storage();
    let flaky = FlakyStorage::always(storage, StorageError::Connection("down".into()));
    let guarded = GuardedStorage::new(flaky, breaker_config()).with_health_check(
        HealthCheckConfig {
            check_interval: Duration::from_millis(20),
            check_timeout: Duration::from_millis(50),
        },
    );

    time::sleep(Duration::from_millis(60)).await;
    let health = guarded.health().expect("health checker configured");
    assert!(!health.is_healthy());

    assert!(is_circuit_open(&guarded.get("key").await));
    // Pings alone never touch the breaker
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_hung_call_times_out_and_counts_as_failure() {
    let guarded = GuardedStorage::new(HangingStorage, breaker_config())
        .with_call_timeout(Duration::from_millis(10));
    assert_eq!(guarded.call_timeout(), Duration::from_millis(10));

    let result = guarded.get("key").await;
    assert!(matches!(
        result,
        Err(RateLimiterError::StoreUnavailable(StorageError::Timeout(d))) if d == Duration::from_millis(10)
    ));
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Closed);

    assert!(guarded.get("key").await.is_err());
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Open);
}

/// The limiter's own timeout must not swallow the failure before the breaker sees it
#[tokio::test]
async fn test_hanging_store_opens_the_circuit_behind_a_limiter() {
    let guarded = GuardedStorage::new(HangingStorage, breaker_config())
        .with_call_timeout(Duration::from_millis(10));

    let mut config = RateLimiterConfig::new(AlgorithmConfig::TokenBucket(TokenBucketConfig {
        refill_interval: Duration::from_secs(1),
        capacity: 5,
    }));
    config.failure_policy = FailurePolicy::FailClosed;
    config.timeout = Duration::from_millis(200);
    config.retry = RetryConfig::disabled();
    let limiter = RateLimiter::from_config(guarded.clone(), &config).unwrap();

    for _ in 0..2 {
        let result = limiter.check("client").await;
        assert!(matches!(
            result,
            Err(RateLimiterError::StoreUnavailable(StorageError::Timeout(_)))
        ));
    }
    assert_eq!(guarded.breaker().get_state().await, CircuitState::Open);

    // Refused at once instead of waiting out another deadline
    let started = Instant::now();
    let result = limiter.check("client").await;
    assert!(is_circuit_open(&result));
    assert!(started.elapsed() < Duration::from_millis(100));
}
