// src/resilience/mod.rs
//! Resilience features around the shared store.
//!
//! 1. **Health Checks** - actively ping the store to detect outages early
//! 2. **Circuit Breaking** - stop waiting on a store that keeps failing
//! 3. **Retry with Exponential Backoff** - retry failures known not to have committed
//!
//! What a check decides once the store is given up on is the facade's
//! failure policy, not this module's concern.

mod circuit_breaker;
mod exponential_backoff;
mod guarded_storage;
mod health_checker;

#[cfg(test)]
mod tests;

// Re-export key components
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use exponential_backoff::{ExponentialBackoff, RetryConfig};
pub use guarded_storage::GuardedStorage;
pub use health_checker::{HealthCheckConfig, HealthChecker};
