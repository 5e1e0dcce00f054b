// src/algorithms/fixed_window.rs

use crate::algorithms::{Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::FixedWindowConfig;
use crate::error::Result;
use crate::keys::{validate_identifier, KeyCodec};
use crate::storage::{Pipeline, ReadOp, Snapshot, StorageBackend};
use crate::rate_limit_event;
use async_trait::async_trait;

pub const NAME: &str = "fixed_window";

/// Fixed Window rate limiting algorithm
///
/// The fixed window algorithm divides time into fixed windows (e.g., 1 minute)
/// and limits the number of requests in each window. When a new window starts,
/// the counter resets.
///
/// Up to twice the maximum can be admitted around a window boundary: the end
/// of one window and the start of the next are counted separately.
#[derive(Debug)]
pub struct FixedWindow<S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting window counters
    storage: S,

    /// Configuration for the fixed window
    config: FixedWindowConfig,

    clock: SharedClock,
    keys: KeyCodec,
}

impl<S> FixedWindow<S>
where
    S: StorageBackend,
{
    /// Creates a new fixed window with the given storage and configuration
    pub fn new(storage: S, config: FixedWindowConfig) -> Self {
        Self {
            storage,
            config,
            clock: system_clock(),
            keys: KeyCodec::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_keys(mut self, keys: KeyCodec) -> Self {
        self.keys = keys;
        self
    }

    fn window_ms(&self) -> u64 {
        (self.config.window_size.as_millis() as u64).max(1)
    }

    fn counter_key(&self, identifier: &str, now: u64) -> String {
        self.keys
            .windowed_key(NAME, identifier, now / self.window_ms())
    }

    /// Decides one request given the counter of the current window
    fn evaluate(&self, key: &str, snapshot: Snapshot, now: u64) -> Result<(Decision, Pipeline)> {
        let count = snapshot.into_counter()?.unwrap_or(0).max(0) as u64;
        let max = self.config.max_requests;
        let mut writes = Pipeline::new();

        if count < max {
            if count == 0 {
                // First request of the window creates the counter with its expiry
                writes.set(key, "1", Some(self.config.window_size));
            } else {
                writes.increment(key, 1);
            }
            return Ok((Decision::allow(max - count - 1, max), writes));
        }

        let window = self.window_ms();
        let window_end = (now / window + 1) * window;
        Ok((Decision::deny(window_end - now, max), writes))
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for FixedWindow<S>
where
    S: StorageBackend,
{
    fn name(&self) -> &'static str {
        NAME
    }

    fn limit(&self) -> u64 {
        self.config.max_requests
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        validate_identifier(identifier)?;

        let now = self.clock.now_millis();
        let key = self.counter_key(identifier, now);

        let decision = self
            .storage
            .transaction(&key, ReadOp::Counter, |snapshot| {
                self.evaluate(&key, snapshot, now)
            })
            .await?;

        rate_limit_event!(NAME, identifier, decision);
        Ok(decision)
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        validate_identifier(identifier)?;

        // Only the current window's counter can still influence a decision
        let key = self.counter_key(identifier, self.clock.now_millis());
        self.storage.delete(&key).await?;
        Ok(())
    }
}
