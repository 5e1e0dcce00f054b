use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::{system_clock, SharedClock};

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are failing and not being sent
    Open,
    /// Circuit is partially open, allowing requests through to test recovery
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to keep the circuit open before transitioning to half-open
    pub reset_timeout: Duration,
    /// Number of consecutive successes in half-open state to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    opened_at: u64,
}

/// Circuit breaker implementation
///
/// State, counters and the open timestamp change together under one lock,
/// so concurrent callers never see a half-applied transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: 0,
            }),
            config,
            clock,
        }
    }

    /// Check if the circuit breaker allows the request to proceed
    pub async fn allow_request(&self) -> bool {
        let state = self.inner.read().await.state;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let mut inner = self.inner.write().await;
                // Another caller may have moved it on while we waited for the lock
                if inner.state != CircuitState::Open {
                    return true;
                }

                let open_for = self.clock.now_millis().saturating_sub(inner.opened_at);
                if open_for >= self.config.reset_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    debug!("Circuit breaker state transitioned to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    debug!(
                        "Circuit breaker state transitioned to closed after successful operations"
                    );
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late
                debug!("Received success in Open state");
            }
        }
    }

    /// Record a failed operation
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = self.clock.now_millis();
                    warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state opens the circuit again
                inner.state = CircuitState::Open;
                inner.opened_at = self.clock.now_millis();
                inner.success_count = 0;
                warn!("Circuit breaker re-opened after failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        self.inner.read().await.state
    }
}
