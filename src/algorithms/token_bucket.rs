// src/algorithms/token_bucket.rs

use crate::algorithms::{BucketState, Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::TokenBucketConfig;
use crate::error::Result;
use crate::keys::{validate_identifier, KeyCodec};
use crate::rate_limit_event;
use crate::storage::{Pipeline, ReadOp, Snapshot, StorageBackend};
use async_trait::async_trait;
use std::time::Duration;

pub const NAME: &str = "token_bucket";

/// Token Bucket rate limiting algorithm
///
/// The token bucket algorithm works by maintaining a "bucket" of tokens that are
/// replenished at a constant rate. Each request consumes a token, and if there
/// are no tokens available, the request is rejected.
///
/// A fresh bucket starts full. Tokens arrive whole, one per `refill_interval`
/// counted from the last admitted request.
#[derive(Debug)]
pub struct TokenBucket<S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting bucket state
    storage: S,

    /// Configuration for the token bucket
    config: TokenBucketConfig,

    clock: SharedClock,
    keys: KeyCodec,
}

impl<S> TokenBucket<S>
where
    S: StorageBackend,
{
    /// Creates a new token bucket with the given storage and configuration
    pub fn new(storage: S, config: TokenBucketConfig) -> Self {
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

    fn interval_ms(&self) -> u64 {
        (self.config.refill_interval.as_millis() as u64).max(1)
    }

    /// Calculate the number of tokens available at `now`, capped at capacity
    pub fn refilled(&self, state: BucketState, now: u64) -> f64 {
        let elapsed = now.saturating_sub(state.updated_at);
        let ticks = (elapsed / self.interval_ms()) as f64;
        (state.level + ticks).min(self.config.capacity as f64)
    }

    fn evaluate(&self, key: &str, snapshot: Snapshot, now: u64) -> Result<(Decision, Pipeline)> {
        let capacity = self.config.capacity;
        let state = BucketState::from_hash(&snapshot.into_hash()?)?
            .unwrap_or(BucketState::new(capacity as f64, now));

        let interval = self.interval_ms();
        let level = self.refilled(state, now) - 1.0;
        let mut writes = Pipeline::new();

        if level >= 0.0 {
            // Once the key expires the bucket would be full again anyway
            let missing = (capacity as f64 - level).ceil() as u64;
            let ttl = Duration::from_millis(missing.max(1) * interval);
            BucketState::new(level, now).write(&mut writes, key, ttl);

            return Ok((Decision::allow(level.floor() as u64, capacity), writes));
        }

        // Wait for the missing tokens, less the progress already made toward the next one
        let elapsed = now.saturating_sub(state.updated_at);
        let missing = (-level).ceil() as u64;
        let retry_after = (missing * interval).saturating_sub(elapsed % interval);
        Ok((Decision::deny(retry_after, capacity), writes))
    }

    /// Tokens available right now without consuming one. Absent state reads as full.
    pub async fn tokens(&self, identifier: &str) -> Result<f64> {
        validate_identifier(identifier)?;

        let now = self.clock.now_millis();
        let fields = self
            .storage
            .hash_get_all(&self.keys.key(NAME, identifier))
            .await?;
        Ok(BucketState::from_hash(&fields)?
            .map(|state| self.refilled(state, now))
            .unwrap_or(self.config.capacity as f64))
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for TokenBucket<S>
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

        // Without state the next check sees a full bucket
        self.storage.delete(&self.keys.key(NAME, identifier)).await?;
        Ok(())
    }
}
