// src/storage/redis.rs

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::fmt;
use futures::future::try_join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{
    ttl_millis, Operation, Pipeline, PipelineValue, ReadOp, ScoreBound, Snapshot, StorageBackend,
};
use crate::storage_op;

/// Redis storage backend.
///
/// A WATCH only guards the connection it was issued on, so a read-decide-write
/// unit must own its connection from WATCH to EXEC. The backend keeps
/// `pool_size` connections and hands each unit one of them.
pub struct RedisStorage {
    client: Client,
    connections: Arc<Vec<Mutex<ConnectionManager>>>,
    next: Arc<AtomicUsize>,
    config: RedisConfig,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.config.url)
            .field("pool_size", &self.connections.len())
            .finish()
    }
}

impl Clone for RedisStorage {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connections: Arc::clone(&self.connections),
            next: Arc::clone(&self.next),
            config: self.config.clone(),
        }
    }
}

impl RedisStorage {
    /// Creates a new Redis storage with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        // Open the client - this doesn't actually connect to Redis yet
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let size = config.pool_size.max(1) as usize;
        let connecting =
            try_join_all((0..size).map(|_| ConnectionManager::new(client.clone())));

        let managers = match tokio::time::timeout(config.connection_timeout, connecting).await {
            Ok(result) => result.map_err(|e| StorageError::Connection(e.to_string()))?,
            Err(_) => {
                return Err(StorageError::Connection(format!(
                    "Connection to Redis at {} timed out after {:?}",
                    config.url, config.connection_timeout
                ))
                .into());
            }
        };
        debug!(url = %config.url, pool_size = size, "Redis connection pool ready");

        Ok(Self {
            client,
            connections: Arc::new(managers.into_iter().map(Mutex::new).collect()),
            next: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Number of pooled connections
    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    /// Takes an idle connection, or queues on the next one in turn when all are busy
    async fn checkout(&self) -> MutexGuard<'_, ConnectionManager> {
        let size = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % size;
        for offset in 0..size {
            if let Ok(conn) = self.connections[(start + offset) % size].try_lock() {
                return conn;
            }
        }
        self.connections[start].lock().await
    }
}

fn to_redis_pipeline(pipeline: &Pipeline) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for operation in pipeline.operations() {
        match operation {
            Operation::Get { key } => {
                pipe.cmd("GET").arg(key);
            }
            Operation::Exists { key } => {
                pipe.cmd("EXISTS").arg(key);
            }
            Operation::Set { key, value, ttl } => match ttl {
                Some(ttl) => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl_millis(*ttl));
                }
                None => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
            },
            Operation::Increment { key, amount } => {
                pipe.cmd("INCRBY").arg(key).arg(*amount);
            }
            Operation::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl));
            }
            Operation::Delete { key } => {
                pipe.cmd("DEL").arg(key);
            }
            Operation::HashGet { key, field } => {
                pipe.cmd("HGET").arg(key).arg(field);
            }
            Operation::HashSet { key, field, value } => {
                pipe.cmd("HSET").arg(key).arg(field).arg(value);
            }
            Operation::HashIncrement { key, field, amount } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(*amount);
            }
            Operation::HashDelete { key, fields } => {
                pipe.cmd("HDEL").arg(key).arg(fields);
            }
            Operation::SortedSetAdd { key, member, score } => {
                pipe.cmd("ZADD")
                    .arg(key)
                    .arg(ScoreBound::Inclusive(*score).to_string())
                    .arg(member);
            }
            Operation::SortedSetRemoveByScore { key, min, max } => {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(min.to_string())
                    .arg(max.to_string());
            }
            Operation::SortedSetCard { key } => {
                pipe.cmd("ZCARD").arg(key);
            }
        }
    }

    pipe
}

fn to_pipeline_value(value: redis::Value) -> Result<PipelineValue> {
    match value {
        redis::Value::Nil => Ok(PipelineValue::Nil),
        redis::Value::Okay => Ok(PipelineValue::Okay),
        redis::Value::Int(i) => Ok(PipelineValue::Int(i)),
        redis::Value::BulkString(bytes) => Ok(PipelineValue::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        redis::Value::SimpleString(s) => Ok(PipelineValue::Text(s)),
        redis::Value::Double(d) => Ok(PipelineValue::Text(d.to_string())),
        redis::Value::Boolean(b) => Ok(PipelineValue::Int(b as i64)),
        redis::Value::ServerError(err) => Err(StorageError::Command(format!("{:?}", err)).into()),
        other => Err(StorageError::Serialization(format!(
            "Unsupported Redis value type: {:?}",
            other
        ))
        .into()),
    }
}

async fn read_snapshot(
    conn: &mut ConnectionManager,
    key: &str,
    read: &ReadOp,
) -> Result<Snapshot> {
    let snapshot = match read {
        ReadOp::Counter => {
            let value: Option<i64> = redis::cmd("GET")
                .arg(key)
                .query_async(conn)
                .await
                .map_err(StorageError::from)?;
            Snapshot::Counter(value)
        }
        ReadOp::Hash => {
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(key)
                .query_async(conn)
                .await
                .map_err(StorageError::from)?;
            Snapshot::Hash(fields)
        }
        ReadOp::SortedSetRange { min } => {
            let entries: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min.to_string())
                .arg("+inf")
                .arg("WITHSCORES")
                .query_async(conn)
                .await
                .map_err(StorageError::from)?;
            Snapshot::SortedSet(entries)
        }
    };
    Ok(snapshot)
}

async fn unwatch(conn: &mut ConnectionManager) -> Result<()> {
    let _: () = redis::cmd("UNWATCH")
        .query_async(conn)
        .await
        .map_err(StorageError::from)?;
    Ok(())
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn execute_atomic(&self, pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        let started = Instant::now();
        let pipe = to_redis_pipeline(&pipeline);

        let mut conn = self.checkout().await;
        let result: std::result::Result<Vec<redis::Value>, redis::RedisError> =
            pipe.query_async(&mut *conn).await;
        drop(conn);

        let first_key = pipeline.operations().first().map(operation_key).unwrap_or("");
        storage_op!(
            "execute_atomic",
            first_key,
            result,
            started.elapsed().as_millis() as u64
        );

        let values = result.map_err(StorageError::from)?;
        values.into_iter().map(to_pipeline_value).collect()
    }

    async fn snapshot(&self, key: &str, read: ReadOp) -> Result<Snapshot> {
        let mut conn = self.checkout().await;
        read_snapshot(&mut conn, key, &read).await
    }

    async fn transaction<T, F>(&self, key: &str, read: ReadOp, decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync,
    {
        let started = Instant::now();
        let attempts = self.config.max_transaction_attempts.max(1);
        let mut conn = self.checkout().await;

        for attempt in 1..=attempts {
            let _: () = redis::cmd("WATCH")
                .arg(key)
                .query_async(&mut *conn)
                .await
                .map_err(StorageError::from)?;

            let decided = match read_snapshot(&mut conn, key, &read).await {
                Ok(snapshot) => decide(snapshot),
                Err(err) => Err(err),
            };
            let (outcome, writes) = match decided {
                Ok(decided) => decided,
                Err(err) => {
                    // Best effort; the next WATCH/EXEC on this connection clears it anyway
                    let _ = unwatch(&mut conn).await;
                    return Err(err);
                }
            };

            if writes.is_empty() {
                unwatch(&mut conn).await?;
                storage_op!(
                    "transaction",
                    key,
                    Ok::<(), RateLimiterError>(()),
                    started.elapsed().as_millis() as u64
                );
                return Ok(outcome);
            }

            // Nil from EXEC means a watched key changed and nothing was applied
            let committed: std::result::Result<Option<redis::Value>, redis::RedisError> =
                to_redis_pipeline(&writes).query_async(&mut *conn).await;
            storage_op!(
                "transaction",
                key,
                committed,
                started.elapsed().as_millis() as u64
            );

            match committed {
                Ok(Some(_)) => return Ok(outcome),
                Ok(None) => {
                    debug!(key, attempt, "Transaction aborted by a concurrent writer, retrying");
                }
                Err(err) => return Err(StorageError::CommitUnknown(err.to_string()).into()),
            }
        }

        Err(StorageError::Contention {
            key: key.to_string(),
            attempts,
        }
        .into())
    }

    /// Ping Redis to check health with timeout
    async fn ping(&self) -> Result<()> {
        let mut conn = self.checkout().await;

        let cmd = redis::cmd("PING");
        let ping_future = cmd.query_async::<String>(&mut *conn);

        let result = match tokio::time::timeout(self.config.connection_timeout, ping_future).await
        {
            Ok(inner_result) => inner_result.map_err(StorageError::from)?,
            Err(_) => {
                return Err(StorageError::Timeout(self.config.connection_timeout).into());
            }
        };

        if result == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Command(format!(
                "Unexpected response from Redis PING: {}",
                result
            ))
            .into())
        }
    }
}

fn operation_key(operation: &Operation) -> &str {
    match operation {
        Operation::Get { key }
        | Operation::Exists { key }
        | Operation::Set { key, .. }
        | Operation::Increment { key, .. }
        | Operation::Expire { key, .. }
        | Operation::Delete { key }
        | Operation::HashGet { key, .. }
        | Operation::HashSet { key, .. }
        | Operation::HashIncrement { key, .. }
        | Operation::HashDelete { key, .. }
        | Operation::SortedSetAdd { key, .. }
        | Operation::SortedSetRemoveByScore { key, .. }
        | Operation::SortedSetCard { key } => key,
    }
}
