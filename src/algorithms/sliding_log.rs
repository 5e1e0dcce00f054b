// src/algorithms/sliding_log.rs

use crate::algorithms::{Decision, RateLimitAlgorithm};
use crate::clock::{system_clock, SharedClock};
use crate::config::SlidingLogConfig;
use crate::error::Result;
use crate::keys::{validate_identifier, KeyCodec};
use crate::rate_limit_event;
use crate::storage::{Pipeline, ReadOp, ScoreBound, Snapshot, StorageBackend};
use async_trait::async_trait;
use uuid::Uuid;

pub const NAME: &str = "sliding_log";

/// Sliding Log rate limiting algorithm
///
/// Keeps one sorted-set entry per admitted request, scored by its timestamp.
/// A request counts while it is younger than `duration`, so the count is
/// exact. Denied requests are never logged, which bounds the set at
/// `max_requests` live entries.
#[derive(Debug, Clone)]
pub struct SlidingLog<S>
where
    S: StorageBackend,
{
    storage: S,
    config: SlidingLogConfig,
    clock: SharedClock,
    keys: KeyCodec,
}

impl<S> SlidingLog<S>
where
    S: StorageBackend,
{
    pub fn new(storage: S, config: SlidingLogConfig) -> Self {
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

    fn duration_ms(&self) -> u64 {
        self.config.duration.as_millis() as u64
    }

    /// Entries scored at or below this have left the window
    fn horizon(&self, now: u64) -> ScoreBound {
        match now.checked_sub(self.duration_ms()) {
            Some(edge) => ScoreBound::Inclusive(edge as f64),
            None => ScoreBound::NegInfinity,
        }
    }

    fn live_range(&self, now: u64) -> ScoreBound {
        match self.horizon(now) {
            ScoreBound::Inclusive(edge) => ScoreBound::Exclusive(edge),
            other => other,
        }
    }

    /// Decides one request given the entries still inside the window
    fn evaluate(
        &self,
        key: &str,
        member: &str,
        snapshot: Snapshot,
        now: u64,
    ) -> Result<(Decision, Pipeline)> {
        let entries = snapshot.into_sorted_set()?;
        let count = entries.len() as u64;
        let max = self.config.max_requests;
        let mut writes = Pipeline::new();

        if count < max {
            if let horizon @ ScoreBound::Inclusive(_) = self.horizon(now) {
                writes.sorted_set_remove_by_score(key, ScoreBound::NegInfinity, horizon);
            }
            writes
                .sorted_set_add(key, member, now as f64)
                .expire(key, self.config.duration);
            return Ok((Decision::allow(max - count - 1, max), writes));
        }

        // Entries come back in ascending score order
        let oldest = entries
            .first()
            .map(|(_, score)| *score as u64)
            .unwrap_or(now);
        let retry_after = (oldest + self.duration_ms()).saturating_sub(now);
        Ok((Decision::deny(retry_after, max), writes))
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for SlidingLog<S>
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
        // Unique even when two requests share a millisecond
        let member = format!("{}-{}", now, Uuid::new_v4());

        let decision = self
            .storage
            .transaction(
                &key,
                ReadOp::SortedSetRange {
                    min: self.live_range(now),
                },
                |snapshot| self.evaluate(&key, &member, snapshot, now),
            )
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
