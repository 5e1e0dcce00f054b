// src/algorithms/leaky_bucket.rs

use crate::algorithms::{ceil_millis, BucketState, Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::LeakyBucketConfig;
use crate::error::Result;
use crate::keys::{validate_identifier, KeyCodec};
use crate::rate_limit_event;
use crate::storage::{Pipeline, ReadOp, Snapshot, StorageBackend};
use async_trait::async_trait;
use std::time::Duration;

pub const NAME: &str = "leaky_bucket";

/// Leaky Bucket rate limiting algorithm
///
/// Each admitted request adds one unit of work to the bucket, and the bucket
/// drains one unit every `leak_interval`. A request is admitted only if its
/// unit still fits under `capacity`.
#[derive(Debug, Clone)]
pub struct LeakyBucket<S>
where
    S: StorageBackend,
{
    storage: S,
    config: LeakyBucketConfig,
    clock: SharedClock,
    keys: KeyCodec,
}

impl<S> LeakyBucket<S>
where
    S: StorageBackend,
{
    pub fn new(storage: S, config: LeakyBucketConfig) -> Self {
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

    fn interval_ms(&self) -> f64 {
        (self.config.leak_interval.as_millis() as f64).max(1.0)
    }

    /// Level the bucket would have at `now` before adding anything
    pub fn drained_level(&self, state: BucketState, now: u64) -> f64 {
        let elapsed = now.saturating_sub(state.updated_at) as f64;
        (state.level - elapsed / self.interval_ms()).max(0.0)
    }

    fn evaluate(&self, key: &str, snapshot: Snapshot, now: u64) -> Result<(Decision, Pipeline)> {
        let state = BucketState::from_hash(&snapshot.into_hash()?)?
            .unwrap_or(BucketState::new(0.0, now));

        let capacity = self.config.capacity as f64;
        let interval = self.interval_ms();
        let level = self.drained_level(state, now) + 1.0;
        let mut writes = Pipeline::new();

        if level <= capacity {
            // The key lives exactly as long as the bucket takes to drain
            let ttl = Duration::from_millis(ceil_millis(level * interval));
            BucketState::new(level, now).write(&mut writes, key, ttl);

            let remaining = (capacity - level).floor() as u64;
            return Ok((Decision::allow(remaining, self.config.capacity), writes));
        }

        // Start from the closed form, then settle on the first millisecond the
        // admission test itself accepts so float error cannot shift it
        let admits_at = |at: u64| self.drained_level(state, at) + 1.0 <= capacity;
        let mut retry_after = ceil_millis((level - capacity) * interval).max(1);
        while retry_after > 1 && admits_at(now + retry_after - 1) {
            retry_after -= 1;
        }
        while !admits_at(now + retry_after) {
            retry_after += 1;
        }
        Ok((Decision::deny(retry_after, self.config.capacity), writes))
    }

    /// Current level without charging a request. Absent state reads as empty.
    pub async fn level(&self, identifier: &str) -> Result<f64> {
        validate_identifier(identifier)?;

        let now = self.clock.now_millis();
        let fields = self
            .storage
            .hash_get_all(&self.keys.key(NAME, identifier))
            .await?;
        Ok(BucketState::from_hash(&fields)?
            .map(|state| self.drained_level(state, now))
            .unwrap_or(0.0))
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for LeakyBucket<S>
where
    S: StorageBackend,
{
    fn name(&self) -> &'static str {
        NAME
    }

    fn limit(&self) -> u64 {
        self.config.capacity
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        validate_identifier(identifier)?;

        let now = self.clock.now_millis();
        let key = self.keys.key(NAME, identifier);

        let decision = self
            .storage
            .transaction(&key, ReadOp::Hash, |snapshot| {
                self.evaluate(&key, snapshot, now)
            })
            .await?;

        rate_limit_event!(NAME, identifier, decision);
        Ok(decision)
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        validate_identifier(identifier)?;
        self.storage.delete(&self.keys.key(NAME, identifier)).await?;
        Ok(())
    }
}
