// src/resilience/tests/exponential_backoff_tests.rs

use crate::resilience::{ExponentialBackoff, RetryConfig};
use std::time::Duration;

fn deterministic(max_attempts: usize, max_backoff: Duration) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(100),
        max_backoff,
        backoff_multiplier: 2.0,
        use_jitter: false, // Disable jitter for deterministic testing
    }
}

#[test]
fn test_backoff_increases_exponentially() {
    let mut backoff = ExponentialBackoff::new(deterministic(4, Duration::from_secs(10)));

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));

    // Fifth attempt exceeds max_attempts
    assert_eq!(backoff.next_backoff(), None);
    assert_eq!(backoff.attempts(), 4);
}

#[test]
fn test_backoff_respects_max_backoff() {
    let mut backoff = ExponentialBackoff::new(deterministic(4, Duration::from_millis(300)));

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
    // 400ms capped
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
}

#[test]
fn test_jitter_stays_within_half_to_full() {
    let config = RetryConfig {
        use_jitter: true,
        ..deterministic(3, Duration::from_secs(10))
    };
    let mut backoff = ExponentialBackoff::new(config);

    for base in [100u64, 200, 400] {
        let delay = backoff.next_backoff().unwrap();
        assert!(
            delay >= Duration::from_millis(base / 2) && delay <= Duration::from_millis(base),
            "Backoff {:?} should be between {}ms and {}ms",
            delay,
            base / 2,
            base
        );
    }
}

#[test]
fn test_reset_restarts_backoff_sequence() {
    let mut backoff = ExponentialBackoff::new(deterministic(2, Duration::from_secs(10)));

    backoff.next_backoff();
    backoff.next_backoff();
    assert_eq!(backoff.next_backoff(), None);

    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
}

#[test]
fn test_default_allows_one_short_retry() {
    let config = RetryConfig::default();
    assert_eq!(config.max_attempts, 1);

    let mut backoff = ExponentialBackoff::new(config);
    let delay = backoff.next_backoff().unwrap();
    assert!(delay <= Duration::from_millis(25));
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_disabled_never_retries() {
    let mut backoff = ExponentialBackoff::new(RetryConfig::disabled());
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_retry_config_from_json() {
    let config: RetryConfig =
        serde_json::from_str(r#"{"max_attempts": 3, "initial_backoff_ms": 10}"#).unwrap();

    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.initial_backoff, Duration::from_millis(10));
    // Unspecified fields keep their defaults
    assert_eq!(config.max_backoff, Duration::from_millis(250));
    assert!(config.use_jitter);
}
