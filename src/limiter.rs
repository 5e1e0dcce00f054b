// src/limiter.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::algorithms::{build_algorithm, Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::{FailurePolicy, RateLimiterConfig};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::keys::{validate_identifier, KeyCodec};
use crate::resilience::{ExponentialBackoff, RetryConfig};
use crate::storage::StorageBackend;

/// Entry point for the request-handling layer: one `check` per request.
///
/// Holds no per-client state, so any number of limiters in any number of
/// processes can share one store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    algorithm: Arc<dyn RateLimitAlgorithm>,
    failure_policy: FailurePolicy,
    retry: RetryConfig,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(algorithm: Arc<dyn RateLimitAlgorithm>) -> Self {
        Self {
            algorithm,
            failure_policy: FailurePolicy::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_millis(500),
        }
    }

    /// Builds the configured algorithm over `storage` with the wall clock
    pub fn from_config<S>(storage: S, config: &RateLimiterConfig) -> Result<Self>
    where
        S: StorageBackend + 'static,
    {
        Self::from_config_with_clock(storage, config, system_clock())
    }

    pub fn from_config_with_clock<S>(
        storage: S,
        config: &RateLimiterConfig,
        clock: SharedClock,
    ) -> Result<Self>
    where
        S: StorageBackend + 'static,
    {
        config.validate()?;

        let algorithm = build_algorithm(
            storage,
            &config.algorithm,
            KeyCodec::new(config.key_prefix.clone()),
            clock,
        )?;

        Ok(Self::new(algorithm)
            .with_failure_policy(config.failure_policy)
            .with_retry(config.retry.clone())
            .with_timeout(config.timeout))
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn limit(&self) -> u64 {
        self.algorithm.limit()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Decides whether one request from `identifier` is admitted.
    ///
    /// A denial is `Ok` with `allowed == false`. Store failures that are safe
    /// to repeat are retried with backoff; whatever is left is settled by the
    /// failure policy: fail open admits, fail closed returns
    /// [`RateLimiterError::StoreUnavailable`].
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        validate_identifier(identifier)?;

        let mut backoff = ExponentialBackoff::new(self.retry.clone());
        let outcome = loop {
            match self.attempt(identifier).await {
                Ok(decision) => break Ok(decision),
                Err(err) if err.is_retriable() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            algorithm = self.algorithm.name(),
                            identifier,
                            error = %err,
                            retry = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "Retrying rate limit check"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(err),
                },
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Err(RateLimiterError::StoreUnavailable(cause)) => {
                self.apply_failure_policy(identifier, cause)
            }
            other => other,
        }
    }

    /// Forgets the stored state of `identifier`. Store failures are returned
    /// as-is; the failure policy only governs admission.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        validate_identifier(identifier)?;

        match tokio::time::timeout(self.timeout, self.algorithm.reset(identifier)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.timeout).into()),
        }
    }

    async fn attempt(&self, identifier: &str) -> Result<Decision> {
        match tokio::time::timeout(self.timeout, self.algorithm.check(identifier)).await {
            Ok(result) => result,
            // The check may have committed before the deadline hit
            Err(_) => Err(StorageError::Timeout(self.timeout).into()),
        }
    }

    fn apply_failure_policy(&self, identifier: &str, cause: StorageError) -> Result<Decision> {
        match self.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(
                    algorithm = self.algorithm.name(),
                    identifier,
                    error = %cause,
                    "Store unavailable, failing open"
                );
                Ok(Decision::fail_open(self.algorithm.limit()))
            }
            FailurePolicy::FailClosed => {
                error!(
                    algorithm = self.algorithm.name(),
                    identifier,
                    error = %cause,
                    "Store unavailable, failing closed"
                );
                Err(RateLimiterError::StoreUnavailable(cause))
            }
        }
    }
}

/// Pulls the client identifier out of a request
pub type IdentifierExtractor<R> = Arc<dyn Fn(&R) -> Option<String> + Send + Sync>;

/// Runs `extractor` on `request`, rejecting requests that carry no usable identifier
pub fn identify<R, F>(extractor: F, request: &R) -> Result<String>
where
    F: Fn(&R) -> Option<String>,
{
    let identifier = extractor(request).ok_or_else(|| {
        RateLimiterError::InvalidIdentifier("request carries no identifier".to_string())
    })?;
    validate_identifier(&identifier)?;
    Ok(identifier)
}

/// A [`RateLimiter`] paired with the function that identifies the client of a request
pub struct RequestLimiter<R> {
    limiter: RateLimiter,
    extractor: IdentifierExtractor<R>,
}

impl<R> Clone for RequestLimiter<R> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: Arc::clone(&self.extractor),
        }
    }
}

impl<R> fmt::Debug for RequestLimiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<R> RequestLimiter<R> {
    pub fn new<F>(limiter: RateLimiter, extractor: F) -> Self
    where
        F: Fn(&R) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            limiter,
            extractor: Arc::new(extractor),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn check(&self, request: &R) -> Result<Decision> {
        let identifier = identify(self.extractor.as_ref(), request)?;
        self.limiter.check(&identifier).await
    }
}
