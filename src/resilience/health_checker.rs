use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::storage::StorageBackend;

/// Configuration for health checks
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// How often to ping the store
    pub check_interval: Duration,
    /// Timeout for one ping
    pub check_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(1),
        }
    }
}

/// Periodically pings a store and remembers whether it answered.
///
/// The background task stops when the checker is stopped or dropped.
#[derive(Debug)]
pub struct HealthChecker<S>
where
    S: StorageBackend,
{
    /// Flag indicating if the store is healthy
    is_healthy: Arc<AtomicBool>,
    storage: Arc<S>,
    config: HealthCheckConfig,
    /// Cancel flag for the health check task
    cancel_flag: Arc<AtomicBool>,
}

impl<S> HealthChecker<S>
where
    S: StorageBackend + 'static,
{
    pub fn new(storage: Arc<S>, config: HealthCheckConfig) -> Self {
        Self {
            is_healthy: Arc::new(AtomicBool::new(true)), // Assume healthy initially
            storage,
            config,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the health checker background task
    pub fn start(&self) -> task::JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let is_healthy = Arc::clone(&self.is_healthy);
        let interval = self.config.check_interval;
        let timeout = self.config.check_timeout;
        let cancel_flag = Arc::clone(&self.cancel_flag);

        task::spawn(async move {
            let mut interval_timer = time::interval(interval);

            loop {
                interval_timer.tick().await;

                if cancel_flag.load(Ordering::SeqCst) {
                    break;
                }

                let healthy = probe(storage.as_ref(), timeout).await;

                let previous_status = is_healthy.swap(healthy, Ordering::SeqCst);
                if previous_status != healthy {
                    if healthy {
                        info!("Store is now healthy");
                    } else {
                        warn!("Store is now unhealthy");
                    }
                }
            }

            debug!("Health checker task stopped");
        })
    }

    /// Runs one ping right now and records the outcome
    pub async fn check_now(&self) -> bool {
        let healthy = probe(self.storage.as_ref(), self.config.check_timeout).await;
        self.is_healthy.store(healthy, Ordering::SeqCst);
        healthy
    }

    /// Stop the health checker
    pub fn stop(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Check if the store is currently healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::SeqCst)
    }
}

impl<S> Drop for HealthChecker<S>
where
    S: StorageBackend,
{
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

async fn probe<S: StorageBackend>(storage: &S, timeout: Duration) -> bool {
    match time::timeout(timeout, storage.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "Store health check failed");
            false
        }
        Err(_) => {
            error!(?timeout, "Store health check timed out");
            false
        }
    }
}
