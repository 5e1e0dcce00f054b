// src/algorithms/mod.rs

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_log;
pub mod sliding_window;
pub mod state;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_log::SlidingLog;
pub use sliding_window::SlidingWindow;
pub use state::BucketState;
pub use token_bucket::TokenBucket;

use super::clock::SharedClock;
use super::config::AlgorithmConfig;
use super::error::Result;
use super::keys::KeyCodec;
use super::storage::StorageBackend;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,

    /// How long the caller should wait before trying again; zero when allowed
    pub retry_after_ms: u64,

    /// Further requests the client could make right now
    pub remaining: u64,

    /// Configured maximum or capacity
    pub limit: u64,
}

impl Decision {
    pub fn allow(remaining: u64, limit: u64) -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            remaining,
            limit,
        }
    }

    /// A denial always asks for at least 1ms of waiting
    pub fn deny(retry_after_ms: u64, limit: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: retry_after_ms.max(1),
            remaining: 0,
            limit,
        }
    }

    /// Admission granted because the store could not be consulted
    pub fn fail_open(limit: u64) -> Self {
        Self::allow(0, limit)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// Core trait that all rate limiting algorithms must implement
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    /// Stable algorithm name, also used in store keys
    fn name(&self) -> &'static str;

    /// Configured maximum or capacity
    fn limit(&self) -> u64;

    /// Decides whether one request from `identifier` is admitted, charging it if so.
    /// The read, the decision and the write happen as one isolated unit in the store.
    async fn check(&self, identifier: &str) -> Result<Decision>;

    /// Forgets everything stored for `identifier`
    async fn reset(&self, identifier: &str) -> Result<()>;
}

/// Builds the engine selected by `config` over `storage`
pub fn build_algorithm<S>(
    storage: S,
    config: &AlgorithmConfig,
    keys: KeyCodec,
    clock: SharedClock,
) -> Result<Arc<dyn RateLimitAlgorithm>>
where
    S: StorageBackend + 'static,
{
    config.validate()?;

    let algorithm: Arc<dyn RateLimitAlgorithm> = match config {
        AlgorithmConfig::FixedWindow(c) => Arc::new(
            FixedWindow::new(storage, c.clone())
                .with_keys(keys)
                .with_clock(clock),
        ),
        AlgorithmConfig::SlidingWindow(c) => Arc::new(
            SlidingWindow::new(storage, c.clone())
                .with_keys(keys)
                .with_clock(clock),
        ),
        AlgorithmConfig::SlidingLog(c) => Arc::new(
            SlidingLog::new(storage, c.clone())
                .with_keys(keys)
                .with_clock(clock),
        ),
        AlgorithmConfig::LeakyBucket(c) => Arc::new(
            LeakyBucket::new(storage, c.clone())
                .with_keys(keys)
                .with_clock(clock),
        ),
        AlgorithmConfig::TokenBucket(c) => Arc::new(
            TokenBucket::new(storage, c.clone())
                .with_keys(keys)
                .with_clock(clock),
        ),
    };

    Ok(algorithm)
}

/// Rounds a non-negative millisecond quantity up to a whole millisecond
pub(crate) fn ceil_millis(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.ceil() as u64
    } else {
        0
    }
}
