use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

use super::{CircuitBreaker, CircuitBreakerConfig, HealthCheckConfig, HealthChecker};
use crate::clock::SharedClock;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{Pipeline, PipelineValue, ReadOp, Snapshot, StorageBackend};

/// Store wrapper that fails fast while the store looks down.
///
/// Calls are refused with [`StorageError::CircuitOpen`] while the breaker is
/// open or the health checker last saw the store unhealthy. Connection
/// failures, timeouts and lost commits count against the breaker; anything
/// the store actually answered counts as a success.
///
/// Every call runs under its own deadline so a hung store is recorded as a
/// failure here, before an outer timeout can drop the call. Keep the deadline
/// below the limiter's timeout.
#[derive(Debug, Clone)]
pub struct GuardedStorage<S>
where
    S: StorageBackend,
{
    inner: S,
    breaker: Arc<CircuitBreaker>,
    health: Option<Arc<HealthChecker<S>>>,
    call_timeout: Duration,
}

/// Default per-call deadline, half the limiter's default timeout
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(250);

impl<S> GuardedStorage<S>
where
    S: StorageBackend + 'static,
{
    pub fn new(inner: S, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(config)),
            health: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_clock(inner: S, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::with_clock(config, clock)),
            health: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Starts a background health checker over a clone of the inner store.
    /// Must be called inside a tokio runtime.
    pub fn with_health_check(mut self, config: HealthCheckConfig) -> Self
    where
        S: Clone,
    {
        let checker = HealthChecker::new(Arc::new(self.inner.clone()), config);
        checker.start();
        self.health = Some(Arc::new(checker));
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> Option<&HealthChecker<S>> {
        self.health.as_deref()
    }

    async fn admit(&self) -> Result<()> {
        if let Some(health) = &self.health {
            if !health.is_healthy() {
                debug!("Store marked unhealthy, refusing call");
                return Err(StorageError::CircuitOpen.into());
            }
        }

        if !self.breaker.allow_request().await {
            return Err(StorageError::CircuitOpen.into());
        }
        Ok(())
    }

    /// Runs one store call under the deadline and feeds the outcome to the breaker
    async fn run<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let result = match time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "Store call timed out");
                Err(StorageError::Timeout(self.call_timeout).into())
            }
        };
        let failed = is_outage(&result);
        self.observe(failed).await;
        result
    }

    async fn observe(&self, failed: bool) {
        if failed {
            self.breaker.record_failure().await;
        } else {
            self.breaker.record_success().await;
        }
    }
}

#[async_trait]
impl<S> StorageBackend for GuardedStorage<S>
where
    S: StorageBackend + 'static,
{
    async fn execute_atomic(&self, pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        self.admit().await?;
        self.run(self.inner.execute_atomic(pipeline)).await
    }

    async fn snapshot(&self, key: &str, read: ReadOp) -> Result<Snapshot> {
        self.admit().await?;
        self.run(self.inner.snapshot(key, read)).await
    }

    async fn transaction<T, F>(&self, key: &str, read: ReadOp, decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync,
    {
        self.admit().await?;
        self.run(self.inner.transaction(key, read, decide)).await
    }

    // Not gated by the breaker
    async fn ping(&self) -> Result<()> {
        self.run(self.inner.ping()).await
    }
}

fn is_outage<T>(result: &Result<T>) -> bool {
    matches!(
        result,
        Err(RateLimiterError::StoreUnavailable(
            StorageError::Connection(_) | StorageError::Timeout(_) | StorageError::CommitUnknown(_),
        ))
    )
}
