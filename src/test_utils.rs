// src/test_utils.rs

use super::clock::ManualClock;
use super::config::InMemoryConfig;
use super::error::{Result, StorageError};
use super::storage::{MemoryStorage, Pipeline, PipelineValue, ReadOp, Snapshot, StorageBackend};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed start time for tests, far from zero so window maths never underflows
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Memory storage on a hand-driven clock, without a sweeper task
pub fn create_test_storage() -> (MemoryStorage, ManualClock) {
    let clock = ManualClock::new(TEST_EPOCH_MS);
    let config = InMemoryConfig {
        max_entries: 10_000,
        use_background_task: false,
        cleanup_interval: Duration::from_secs(60),
    };
    let storage = MemoryStorage::with_clock(config, Arc::new(clock.clone()));
    (storage, clock)
}

/// Memory storage that fails on demand.
///
/// The next `failures` calls (or every call, when `always`) return `error`
/// instead of reaching the store. Clones share the counters.
#[derive(Debug, Clone)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    error: StorageError,
    remaining_failures: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStorage {
    /// Fails the first `failures` calls, then behaves
    pub fn failing(inner: MemoryStorage, failures: usize, error: StorageError) -> Self {
        Self {
            inner,
            error,
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never reaches the store
    pub fn always(inner: MemoryStorage, error: StorageError) -> Self {
        Self::failing(inner, usize::MAX, error)
    }

    /// Calls seen so far, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    fn gate(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                match left {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();

        if failing {
            Err(self.error.clone().into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn execute_atomic(&self, pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        self.gate()?;
        self.inner.execute_atomic(pipeline).await
    }

    async fn snapshot(&self, key: &str, read: ReadOp) -> Result<Snapshot> {
        self.gate()?;
        self.inner.snapshot(key, read).await
    }

    async fn transaction<T, F>(&self, key: &str, read: ReadOp, decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync,
    {
        self.gate()?;
        self.inner.transaction(key, read, decide).await
    }

    async fn ping(&self) -> Result<()> {
        self.gate()?;
        self.inner.ping().await
    }
}

/// Store that never answers, for timeout tests
#[derive(Debug, Clone, Default)]
pub struct HangingStorage;

#[async_trait]
impl StorageBackend for HangingStorage {
    async fn execute_atomic(&self, _pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        futures::future::pending().await
    }

    async fn snapshot(&self, _key: &str, _read: ReadOp) -> Result<Snapshot> {
        futures::future::pending().await
    }

    async fn transaction<T, F>(&self, _key: &str, _read: ReadOp, _decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync,
    {
        futures::future::pending().await
    }

    async fn ping(&self) -> Result<()> {
        futures::future::pending().await
    }
}
