// library entry
pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod logging;
pub mod resilience;
pub mod storage;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use algorithms::{Decision, RateLimitAlgorithm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlgorithmConfig, FailurePolicy, RateLimiterConfig};
pub use error::{RateLimiterError, Result, StorageError};
pub use keys::KeyCodec;
pub use limiter::{identify, RateLimiter, RequestLimiter};
pub use logging::init as init_logging;
pub use storage::{MemoryStorage, RedisStorage, StorageBackend};
