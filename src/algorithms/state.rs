// src/algorithms/state.rs

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::storage::Pipeline;

const LEVEL_FIELD: &str = "level";
const UPDATED_AT_FIELD: &str = "updated_at";

/// Stored state of a leaky or token bucket, kept as hash fields
/// `level` and `updated_at`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Queued work (leaky) or available tokens (token)
    pub level: f64,

    /// Epoch millis of the last admitted request
    pub updated_at: u64,
}

impl BucketState {
    pub fn new(level: f64, updated_at: u64) -> Self {
        Self { level, updated_at }
    }

    /// Decodes the hash read from the store. An empty hash means the key is
    /// absent and yields `None`.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let level = field(fields, LEVEL_FIELD)?
            .parse::<f64>()
            .map_err(|e| corrupt(LEVEL_FIELD, e))?;
        let updated_at = field(fields, UPDATED_AT_FIELD)?
            .parse::<u64>()
            .map_err(|e| corrupt(UPDATED_AT_FIELD, e))?;

        if !level.is_finite() || level < 0.0 {
            return Err(StorageError::Serialization(format!(
                "bucket level out of range: {}",
                level
            ))
            .into());
        }

        Ok(Some(Self { level, updated_at }))
    }

    /// Queues the writes that persist this state under `key` with `ttl`
    pub fn write(&self, pipeline: &mut Pipeline, key: &str, ttl: Duration) {
        pipeline
            .hash_set(key, LEVEL_FIELD, &self.level.to_string())
            .hash_set(key, UPDATED_AT_FIELD, &self.updated_at.to_string())
            .expire(key, ttl);
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields.get(name).map(String::as_str).ok_or_else(|| {
        StorageError::Serialization(format!("bucket state is missing '{}'", name)).into()
    })
}

fn corrupt(name: &str, err: impl std::fmt::Display) -> crate::error::RateLimiterError {
    StorageError::Serialization(format!("bucket field '{}' is corrupt: {}", name, err)).into()
}
