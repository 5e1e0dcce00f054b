// src/algorithms/sliding_window.rs

use crate::algorithms::{Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::SlidingWindowConfig;
use crate::error::{Result, StorageError};
use crate::keys::{validate_identifier, KeyCodec};
use crate::rate_limit_event;
use crate::storage::{Pipeline, ReadOp, Snapshot, StorageBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub const NAME: &str = "sliding_window";

/// Sliding Window rate limiting algorithm
///
/// The sliding window algorithm divides time into smaller buckets and uses them
/// to approximate a continuous sliding window. It provides better granularity
/// than the fixed window approach and avoids the burst problem.
///
/// All buckets of one identifier live in a single hash, field = bucket start
/// in epoch millis, value = requests admitted in that bucket. A bucket
/// `[start, start + w)` weighs `overlap / w` where `overlap` is the part of
/// it inside the window `(now - window, now]`, measured from the window's
/// lower edge to the bucket's end. Buckets at or after the lower edge count
/// in full; the one straddling it counts in proportion.
#[derive(Debug, Clone)]
pub struct SlidingWindow<S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting window counters
    storage: S,

    /// Configuration for the sliding window
    config: SlidingWindowConfig,

    clock: SharedClock,
    keys: KeyCodec,
}

/// One bucket read back from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    start: u64,
    count: u64,
}

impl<S> SlidingWindow<S>
where
    S: StorageBackend,
{
    /// Creates a new sliding window with the given storage and configuration
    pub fn new(storage: S, config: SlidingWindowConfig) -> Self {
        // Ensure precision is at least 1
        let mut config = config;
        if config.precision == 0 {
            config.precision = 1;
        }

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
        (self.config.window_size.as_millis() as u64).max(self.config.bucket_width_ms())
    }

    fn decode(fields: HashMap<String, String>) -> Result<Vec<Bucket>> {
        let mut buckets = fields
            .into_iter()
            .map(|(field, value)| {
                let start = field.parse::<u64>().map_err(|e| {
                    StorageError::Serialization(format!("bad bucket field '{}': {}", field, e))
                })?;
                let count = value.parse::<i64>().map_err(|e| {
                    StorageError::Serialization(format!("bad bucket count '{}': {}", value, e))
                })?;
                Ok(Bucket {
                    start,
                    count: count.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        buckets.sort_by_key(|bucket| bucket.start);
        Ok(buckets)
    }

    /// Decides one request given every stored bucket
    fn evaluate(&self, key: &str, snapshot: Snapshot, now: u64) -> Result<(Decision, Pipeline)> {
        let buckets = Self::decode(snapshot.into_hash()?)?;

        let width = self.config.bucket_width_ms();
        let window = self.window_ms();
        let max = self.config.max_requests;
        // Lowest timestamp still inside (now - window, now]
        let lower = (now + 1).saturating_sub(window);

        let overlap = |bucket: &Bucket| -> u64 {
            let end = bucket.start + width;
            end.saturating_sub(bucket.start.max(lower)).min(width)
        };

        let weighted: u128 = buckets
            .iter()
            .map(|bucket| bucket.count as u128 * overlap(bucket) as u128)
            .sum();
        let budget = max as u128 * width as u128;

        let mut writes = Pipeline::new();

        if weighted < budget {
            let stale: Vec<String> = buckets
                .iter()
                .filter(|bucket| overlap(bucket) == 0)
                .map(|bucket| bucket.start.to_string())
                .collect();
            if !stale.is_empty() {
                writes.hash_delete(key, stale);
            }

            let current = now - now % width;
            writes
                .hash_increment(key, &current.to_string(), 1)
                .expire(key, Duration::from_millis(window + width));

            let remaining = budget.saturating_sub(weighted + width as u128) / width as u128;
            return Ok((Decision::allow(remaining as u64, max), writes));
        }

        // Every millisecond the lower edge advances sheds the `count` of the
        // bucket it crosses. Walk the buckets oldest first until the edge has
        // shed enough weight to fit one more request.
        let mut excess = weighted - budget + 1;
        let mut retry_after = window;
        for bucket in buckets.iter().filter(|b| b.count > 0 && overlap(b) > 0) {
            let cut = bucket.start.max(lower);
            let available = bucket.count as u128 * (bucket.start + width - cut) as u128;
            if excess <= available {
                retry_after = cut + excess.div_ceil(bucket.count as u128) as u64 - lower;
                break;
            }
            excess -= available;
        }

        Ok((Decision::deny(retry_after, max), writes))
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for SlidingWindow<S>
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
