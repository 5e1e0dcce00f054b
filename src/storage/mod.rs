// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use super::error::{Result, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::time::Duration;

/// Bound of a sorted-set score range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInfinity,
    Inclusive(f64),
    Exclusive(f64),
    PosInfinity,
}

impl ScoreBound {
    /// Whether `score` lies on the allowed side when used as a lower bound
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => true,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
            ScoreBound::PosInfinity => false,
        }
    }

    /// Whether `score` lies on the allowed side when used as an upper bound
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => false,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
            ScoreBound::PosInfinity => true,
        }
    }
}

impl fmt::Display for ScoreBound {
    // Redis range syntax
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInfinity => write!(f, "-inf"),
            ScoreBound::Inclusive(v) => write!(f, "{}", v),
            ScoreBound::Exclusive(v) => write!(f, "({}", v),
            ScoreBound::PosInfinity => write!(f, "+inf"),
        }
    }
}

/// One command inside an atomic pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get { key: String },
    Exists { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    Increment { key: String, amount: i64 },
    Expire { key: String, ttl: Duration },
    Delete { key: String },
    HashGet { key: String, field: String },
    HashSet { key: String, field: String, value: String },
    HashIncrement { key: String, field: String, amount: i64 },
    HashDelete { key: String, fields: Vec<String> },
    SortedSetAdd { key: String, member: String, score: f64 },
    SortedSetRemoveByScore { key: String, min: ScoreBound, max: ScoreBound },
    SortedSetCard { key: String },
}

/// Reply to one pipeline operation, shaped like the Redis reply
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineValue {
    Nil,
    Okay,
    Int(i64),
    Text(String),
}

impl PipelineValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PipelineValue::Int(i) => Some(*i),
            PipelineValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            PipelineValue::Text(s) => Some(s),
            PipelineValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// An ordered batch of operations executed all-or-nothing with no other
/// client's operation interleaved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    operations: Vec<Operation>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn push(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn get(&mut self, key: &str) -> &mut Self {
        self.push(Operation::Get { key: key.to_string() })
    }

    pub fn exists(&mut self, key: &str) -> &mut Self {
        self.push(Operation::Exists { key: key.to_string() })
    }

    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> &mut Self {
        self.push(Operation::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
    }

    pub fn increment(&mut self, key: &str, amount: i64) -> &mut Self {
        self.push(Operation::Increment {
            key: key.to_string(),
            amount,
        })
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.push(Operation::Expire {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.push(Operation::Delete { key: key.to_string() })
    }

    pub fn hash_get(&mut self, key: &str, field: &str) -> &mut Self {
        self.push(Operation::HashGet {
            key: key.to_string(),
            field: field.to_string(),
        })
    }

    pub fn hash_set(&mut self, key: &str, field: &str, value: &str) -> &mut Self {
        self.push(Operation::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    pub fn hash_increment(&mut self, key: &str, field: &str, amount: i64) -> &mut Self {
        self.push(Operation::HashIncrement {
            key: key.to_string(),
            field: field.to_string(),
            amount,
        })
    }

    pub fn hash_delete(&mut self, key: &str, fields: Vec<String>) -> &mut Self {
        self.push(Operation::HashDelete {
            key: key.to_string(),
            fields,
        })
    }

    pub fn sorted_set_add(&mut self, key: &str, member: &str, score: f64) -> &mut Self {
        self.push(Operation::SortedSetAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        })
    }

    pub fn sorted_set_remove_by_score(
        &mut self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> &mut Self {
        self.push(Operation::SortedSetRemoveByScore {
            key: key.to_string(),
            min,
            max,
        })
    }

    pub fn sorted_set_card(&mut self, key: &str) -> &mut Self {
        self.push(Operation::SortedSetCard { key: key.to_string() })
    }
}

/// What the read half of a transaction fetches for its key
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadOp {
    /// Integer string value
    Counter,
    /// Every field of a hash
    Hash,
    /// Sorted-set members scoring above `min`, ascending by score
    SortedSetRange { min: ScoreBound },
}

/// Result of a [`ReadOp`]; absent keys read as empty
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Counter(Option<i64>),
    Hash(HashMap<String, String>),
    SortedSet(Vec<(String, f64)>),
}

impl Snapshot {
    pub fn into_counter(self) -> Result<Option<i64>> {
        match self {
            Snapshot::Counter(value) => Ok(value),
            other => Err(mismatch("counter", &other)),
        }
    }

    pub fn into_hash(self) -> Result<HashMap<String, String>> {
        match self {
            Snapshot::Hash(fields) => Ok(fields),
            other => Err(mismatch("hash", &other)),
        }
    }

    pub fn into_sorted_set(self) -> Result<Vec<(String, f64)>> {
        match self {
            Snapshot::SortedSet(entries) => Ok(entries),
            other => Err(mismatch("sorted set", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Snapshot) -> crate::error::RateLimiterError {
    StorageError::Serialization(format!("expected {} snapshot, got {:?}", expected, got)).into()
}

/// Millisecond TTL as sent to the store; zero would delete the key outright
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Core trait that all storage backends must implement.
///
/// Backends implement four primitives. Everything else is built on
/// [`StorageBackend::execute_atomic`] and [`StorageBackend::snapshot`].
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Executes every operation in order as one isolated unit and returns
    /// one reply per operation
    async fn execute_atomic(&self, pipeline: Pipeline) -> Result<Vec<PipelineValue>>;

    /// Reads a key without taking part in a transaction
    async fn snapshot(&self, key: &str, read: ReadOp) -> Result<Snapshot>;

    /// Runs read, decide and write against `key` as one isolated unit.
    ///
    /// `decide` sees the state read by `read` and returns the outcome plus
    /// the writes to commit. If another client changes `key` before the
    /// writes land, the whole unit is re-run, so `decide` must be pure. An
    /// empty write pipeline commits nothing.
    async fn transaction<T, F>(&self, key: &str, read: ReadOp, decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync;

    /// Checks that the store answers
    async fn ping(&self) -> Result<()>;

    // Retrieves a value by key
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut pipeline = Pipeline::new();
        pipeline.get(key);
        Ok(single(self.execute_atomic(pipeline).await?)?.into_text())
    }

    // Stores a value with a key
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut pipeline = Pipeline::new();
        pipeline.set(key, value, ttl);
        self.execute_atomic(pipeline).await?;
        Ok(())
    }

    // Atomically increments a counter
    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let mut pipeline = Pipeline::new();
        pipeline.increment(key, amount);
        expect_int(single(self.execute_atomic(pipeline).await?)?)
    }

    /// Increments and sets the TTL in one atomic step
    async fn increment_and_expire(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let mut pipeline = Pipeline::new();
        pipeline.increment(key, amount).expire(key, ttl);
        let mut replies = self.execute_atomic(pipeline).await?.into_iter();
        expect_int(replies.next().unwrap_or(PipelineValue::Nil))
    }

    // Sets expiration time for a key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut pipeline = Pipeline::new();
        pipeline.expire(key, ttl);
        Ok(expect_int(single(self.execute_atomic(pipeline).await?)?)? > 0)
    }

    // Checks if a key exists
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut pipeline = Pipeline::new();
        pipeline.exists(key);
        Ok(expect_int(single(self.execute_atomic(pipeline).await?)?)? > 0)
    }

    // Deletes a key
    async fn delete(&self, key: &str) -> Result<bool> {
        let mut pipeline = Pipeline::new();
        pipeline.delete(key);
        Ok(expect_int(single(self.execute_atomic(pipeline).await?)?)? > 0)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut pipeline = Pipeline::new();
        pipeline.hash_get(key, field);
        Ok(single(self.execute_atomic(pipeline).await?)?.into_text())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.snapshot(key, ReadOp::Hash).await?.into_hash()
    }

    /// Writes one hash field, refreshing the key's TTL when given
    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut pipeline = Pipeline::new();
        pipeline.hash_set(key, field, value);
        if let Some(ttl) = ttl {
            pipeline.expire(key, ttl);
        }
        self.execute_atomic(pipeline).await?;
        Ok(())
    }

    /// Adds a member, refreshing the key's TTL when given
    async fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut pipeline = Pipeline::new();
        pipeline.sorted_set_add(key, member, score);
        if let Some(ttl) = ttl {
            pipeline.expire(key, ttl);
        }
        let mut replies = self.execute_atomic(pipeline).await?.into_iter();
        Ok(expect_int(replies.next().unwrap_or(PipelineValue::Nil))? > 0)
    }

    async fn sorted_set_remove_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64> {
        let mut pipeline = Pipeline::new();
        pipeline.sorted_set_remove_by_score(key, min, max);
        Ok(expect_int(single(self.execute_atomic(pipeline).await?)?)?.max(0) as u64)
    }

    async fn sorted_set_card(&self, key: &str) -> Result<u64> {
        let mut pipeline = Pipeline::new();
        pipeline.sorted_set_card(key);
        Ok(expect_int(single(self.execute_atomic(pipeline).await?)?)?.max(0) as u64)
    }
}

fn single(replies: Vec<PipelineValue>) -> Result<PipelineValue> {
    replies.into_iter().next().ok_or_else(|| {
        StorageError::Serialization("store returned no reply".to_string()).into()
    })
}

fn expect_int(value: PipelineValue) -> Result<i64> {
    value.as_int().ok_or_else(|| {
        StorageError::Serialization(format!("expected integer reply, got {:?}", value)).into()
    })
}
