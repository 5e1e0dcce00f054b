// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateLimiterError, Result};
use crate::resilience::RetryConfig;

/// Common configuration for the rate limiter facade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Key prefix to use for all keys in storage
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one check, store round trips included
    #[serde(default = "default_timeout", rename = "timeout_ms", with = "duration_serde")]
    pub timeout: Duration,

    /// What to decide when the store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Retry of store failures known not to have committed
    #[serde(default)]
    pub retry: RetryConfig,

    /// The algorithm and its limits
    pub algorithm: AlgorithmConfig,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_millis(500)
}

impl RateLimiterConfig {
    pub fn new(algorithm: AlgorithmConfig) -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout: default_timeout(),
            failure_policy: FailurePolicy::default(),
            retry: RetryConfig::default(),
            algorithm,
        }
    }

    /// Parses and validates a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from `RATE_LIMITER_*` variables, loading `.env` first.
    ///
    /// `RATE_LIMITER_ALGORITHM` picks the algorithm; its limits come from
    /// `RATE_LIMITER_WINDOW_MS` / `RATE_LIMITER_MAX_REQUESTS` (window based) or
    /// `RATE_LIMITER_INTERVAL_MS` / `RATE_LIMITER_CAPACITY` (bucket based).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str, default: u64| -> Result<u64> {
            match lookup(name) {
                Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                    RateLimiterError::Config(format!("{} must be an integer: {}", name, e))
                }),
                None => Ok(default),
            }
        };

        let algorithm_name =
            lookup("RATE_LIMITER_ALGORITHM").unwrap_or_else(|| "token_bucket".to_string());
        let window = Duration::from_millis(number("RATE_LIMITER_WINDOW_MS", 60_000)?);
        let max_requests = number("RATE_LIMITER_MAX_REQUESTS", 100)?;
        let interval = Duration::from_millis(number("RATE_LIMITER_INTERVAL_MS", 1_000)?);
        let capacity = number("RATE_LIMITER_CAPACITY", 5)?;

        let algorithm = match algorithm_name.trim() {
            "fixed_window" => AlgorithmConfig::FixedWindow(FixedWindowConfig {
                window_size: window,
                max_requests,
            }),
            "sliding_window" => AlgorithmConfig::SlidingWindow(SlidingWindowConfig {
                window_size: window,
                max_requests,
                precision: u32::try_from(number(
                    "RATE_LIMITER_PRECISION",
                    default_precision() as u64,
                )?)
                .map_err(|_| {
                    RateLimiterError::Config("RATE_LIMITER_PRECISION is out of range".to_string())
                })?,
            }),
            "sliding_log" => AlgorithmConfig::SlidingLog(SlidingLogConfig {
                duration: window,
                max_requests,
            }),
            "leaky_bucket" => AlgorithmConfig::LeakyBucket(LeakyBucketConfig {
                leak_interval: interval,
                capacity,
            }),
            "token_bucket" => AlgorithmConfig::TokenBucket(TokenBucketConfig {
                refill_interval: interval,
                capacity,
            }),
            other => {
                return Err(RateLimiterError::Config(format!(
                    "unknown algorithm '{}'",
                    other
                )))
            }
        };

        let failure_policy = match lookup("RATE_LIMITER_FAILURE_POLICY").as_deref() {
            None | Some("fail_open") => FailurePolicy::FailOpen,
            Some("fail_closed") => FailurePolicy::FailClosed,
            Some(other) => {
                return Err(RateLimiterError::Config(format!(
                    "unknown failure policy '{}'",
                    other
                )))
            }
        };

        let config = Self {
            key_prefix: lookup("RATE_LIMITER_KEY_PREFIX").unwrap_or_else(default_key_prefix),
            timeout: Duration::from_millis(number(
                "RATE_LIMITER_TIMEOUT_MS",
                default_timeout().as_millis() as u64,
            )?),
            failure_policy,
            retry: RetryConfig::default(),
            algorithm,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(RateLimiterError::Config(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(RateLimiterError::Config(
                "timeout must be positive".to_string(),
            ));
        }
        self.algorithm.validate()
    }
}

/// Behaviour when the store is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and log
    #[default]
    FailOpen,
    /// Surface the store failure so the caller can reject
    FailClosed,
}

/// Selects one algorithm and carries its limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    FixedWindow(FixedWindowConfig),
    SlidingWindow(SlidingWindowConfig),
    SlidingLog(SlidingLogConfig),
    LeakyBucket(LeakyBucketConfig),
    TokenBucket(TokenBucketConfig),
}

impl AlgorithmConfig {
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::FixedWindow(_) => "fixed_window",
            AlgorithmConfig::SlidingWindow(_) => "sliding_window",
            AlgorithmConfig::SlidingLog(_) => "sliding_log",
            AlgorithmConfig::LeakyBucket(_) => "leaky_bucket",
            AlgorithmConfig::TokenBucket(_) => "token_bucket",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AlgorithmConfig::FixedWindow(c) => c.validate(),
            AlgorithmConfig::SlidingWindow(c) => c.validate(),
            AlgorithmConfig::SlidingLog(c) => c.validate(),
            AlgorithmConfig::LeakyBucket(c) => c.validate(),
            AlgorithmConfig::TokenBucket(c) => c.validate(),
        }
    }
}

fn require_positive_duration(name: &str, value: Duration) -> Result<()> {
    if value.as_millis() == 0 {
        return Err(RateLimiterError::Config(format!(
            "{} must be at least 1ms",
            name
        )));
    }
    Ok(())
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(RateLimiterError::Config(format!(
            "{} must be positive",
            name
        )));
    }
    Ok(())
}

/// Configuration for fixed window algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Window duration
    #[serde(rename = "window_size_ms", with = "duration_serde")]
    pub window_size: Duration,

    /// Maximum number of requests allowed in the window
    pub max_requests: u64,
}

impl FixedWindowConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive_duration("window_size", self.window_size)?;
        require_positive("max_requests", self.max_requests)
    }
}

/// Configuration for sliding window counter algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Window duration
    #[serde(rename = "window_size_ms", with = "duration_serde")]
    pub window_size: Duration,

    /// Maximum number of requests allowed in any window
    pub max_requests: u64,

    /// Precision (number of smaller buckets to divide the window into)
    #[serde(default = "default_precision")]
    pub precision: u32,
}

fn default_precision() -> u32 {
    10
}

impl SlidingWindowConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive_duration("window_size", self.window_size)?;
        require_positive("max_requests", self.max_requests)?;
        require_positive("precision", self.precision as u64)
    }

    /// Width of one sub-window bucket, never below 1ms
    pub fn bucket_width_ms(&self) -> u64 {
        let window = self.window_size.as_millis() as u64;
        (window / self.precision.max(1) as u64).max(1)
    }
}

/// Configuration for sliding log algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingLogConfig {
    /// Length of the moving window
    #[serde(rename = "duration_ms", with = "duration_serde")]
    pub duration: Duration,

    /// Maximum number of requests logged within the window
    pub max_requests: u64,
}

impl SlidingLogConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive_duration("duration", self.duration)?;
        require_positive("max_requests", self.max_requests)
    }
}

/// Configuration for leaky bucket algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    /// Time for one unit of work to drain
    #[serde(rename = "leak_interval_ms", with = "duration_serde")]
    pub leak_interval: Duration,

    /// Queue size at which new work is refused
    pub capacity: u64,
}

impl LeakyBucketConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive_duration("leak_interval", self.leak_interval)?;
        require_positive("capacity", self.capacity)
    }
}

/// Configuration for token bucket algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Time to mint one token
    #[serde(rename = "refill_interval_ms", with = "duration_serde")]
    pub refill_interval: Duration,

    /// Capacity of the token bucket
    pub capacity: u64,
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive_duration("refill_interval", self.refill_interval)?;
        require_positive("capacity", self.capacity)
    }
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout
    #[serde(
        default = "default_conn_timeout",
        rename = "connection_timeout_ms",
        with = "duration_serde"
    )]
    pub connection_timeout: Duration,

    /// How many times a WATCH/EXEC unit is re-run when another writer touches the key
    #[serde(default = "default_max_transaction_attempts")]
    pub max_transaction_attempts: usize,
}

fn default_pool_size() -> u32 {
    10
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_transaction_attempts() -> usize {
    32
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: default_pool_size(),
            connection_timeout: default_conn_timeout(),
            max_transaction_attempts: default_max_transaction_attempts(),
        }
    }
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of entries to store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(
        default = "default_cleanup_interval",
        rename = "cleanup_interval_ms",
        with = "duration_serde"
    )]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}

fn default_use_background_task() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

// Helper module to serialize/deserialize Duration with serde
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
