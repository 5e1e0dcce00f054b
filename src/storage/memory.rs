// src/storage/memory.rs

// In-memory storage (for testing, simulations and single-process use).
// Every pipeline and transaction runs under the map's write lock, which gives
// the same isolation a Redis MULTI/EXEC gives across processes.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::config::InMemoryConfig;
use crate::error::{Result, StorageError};
use crate::storage::{
    ttl_millis, Operation, Pipeline, PipelineValue, ReadOp, Snapshot, StorageBackend,
};

/// Typed value, mirroring the Redis types the algorithms use
#[derive(Debug, Clone, PartialEq)]
enum MemoryValue {
    Text(String),
    Hash(HashMap<String, String>),
    /// Kept sorted by (score, member); members are unique
    SortedSet(Vec<(String, f64)>),
}

/// Entry in the in-memory storage
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    /// Epoch millis on the storage clock
    expires_at: Option<u64>,
}

impl MemoryEntry {
    fn new(value: MemoryValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Table = HashMap<String, MemoryEntry>;

/// In-memory storage backend implementation
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Arc<RwLock<Table>>,
    config: InMemoryConfig,
    clock: SharedClock,
}

impl MemoryStorage {
    /// Creates a new in-memory storage with the given configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a store whose TTLs run on `clock`
    pub fn with_clock(config: InMemoryConfig, clock: SharedClock) -> Self {
        let data = Arc::new(RwLock::new(HashMap::with_capacity(
            config.max_entries.min(10_000),
        )));

        let storage = Self {
            data,
            config,
            clock,
        };

        if storage.config.use_background_task {
            storage.spawn_sweeper();
        }

        storage
    }

    /// Number of stored keys, expired ones included until swept
    pub fn entry_count(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every expired entry
    pub fn purge_expired(&self) -> usize {
        Self::sweep(&self.data, self.clock.now_millis())
    }

    fn sweep(data: &RwLock<Table>, now: u64) -> usize {
        let mut data = data.write().unwrap_or_else(PoisonError::into_inner);
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    // The task holds only a weak handle, so it stops once the last clone of
    // the store is dropped.
    fn spawn_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime, memory storage expiry is lazy only");
            return;
        };

        let data: Weak<RwLock<Table>> = Arc::downgrade(&self.data);
        let clock = Arc::clone(&self.clock);
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));

        handle.spawn(async move {
            let mut interval = time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(data) = data.upgrade() else {
                    break;
                };
                let removed = Self::sweep(&data, clock.now_millis());
                if removed > 0 {
                    debug!(removed, "Swept expired entries");
                }
            }
        });
    }
}

/// Copy-on-write view over the table. Operations land in `changes` and are
/// only written back if the whole batch succeeds.
struct Staged<'a> {
    base: &'a Table,
    changes: HashMap<String, Option<MemoryEntry>>,
    now: u64,
}

impl<'a> Staged<'a> {
    fn new(base: &'a Table, now: u64) -> Self {
        Self {
            base,
            changes: HashMap::new(),
            now,
        }
    }

    fn get(&self, key: &str) -> Option<&MemoryEntry> {
        match self.changes.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(key).filter(|entry| entry.is_live(self.now)),
        }
    }

    fn slot(&mut self, key: &str) -> &mut Option<MemoryEntry> {
        let base = self.base;
        let now = self.now;
        self.changes
            .entry(key.to_string())
            .or_insert_with(|| base.get(key).filter(|entry| entry.is_live(now)).cloned())
    }

    fn read(&self, key: &str, read: &ReadOp) -> Result<Snapshot> {
        let entry = self.get(key);
        match read {
            ReadOp::Counter => match entry.map(|e| &e.value) {
                None => Ok(Snapshot::Counter(None)),
                Some(MemoryValue::Text(raw)) => raw
                    .parse::<i64>()
                    .map(|v| Snapshot::Counter(Some(v)))
                    .map_err(|_| {
                        StorageError::Serialization(format!("{} is not an integer", key)).into()
                    }),
                Some(_) => Err(wrong_type(key)),
            },
            ReadOp::Hash => match entry.map(|e| &e.value) {
                None => Ok(Snapshot::Hash(HashMap::new())),
                Some(MemoryValue::Hash(fields)) => Ok(Snapshot::Hash(fields.clone())),
                Some(_) => Err(wrong_type(key)),
            },
            ReadOp::SortedSetRange { min } => match entry.map(|e| &e.value) {
                None => Ok(Snapshot::SortedSet(Vec::new())),
                Some(MemoryValue::SortedSet(members)) => Ok(Snapshot::SortedSet(
                    members
                        .iter()
                        .filter(|(_, score)| min.admits_from_below(*score))
                        .cloned()
                        .collect(),
                )),
                Some(_) => Err(wrong_type(key)),
            },
        }
    }

    fn apply(&mut self, operation: Operation) -> Result<PipelineValue> {
        let now = self.now;
        match operation {
            Operation::Get { key } => match self.get(&key).map(|e| &e.value) {
                None => Ok(PipelineValue::Nil),
                Some(MemoryValue::Text(raw)) => Ok(PipelineValue::Text(raw.clone())),
                Some(_) => Err(wrong_type(&key)),
            },
            Operation::Exists { key } => Ok(PipelineValue::Int(self.get(&key).is_some() as i64)),
            Operation::Set { key, value, ttl } => {
                let mut entry = MemoryEntry::new(MemoryValue::Text(value));
                entry.expires_at = ttl.map(|ttl| now + ttl_millis(ttl));
                *self.slot(&key) = Some(entry);
                Ok(PipelineValue::Okay)
            }
            Operation::Increment { key, amount } => {
                let slot = self.slot(&key);
                let current = match slot.as_ref().map(|e| &e.value) {
                    None => 0,
                    Some(MemoryValue::Text(raw)) => parse_integer(&key, raw)?,
                    Some(_) => return Err(wrong_type(&key)),
                };
                let next = current.checked_add(amount).ok_or_else(|| {
                    StorageError::Command(format!("increment of {} would overflow", key))
                })?;
                // INCR keeps an existing TTL
                let expires_at = slot.as_ref().and_then(|entry| entry.expires_at);
                *slot = Some(MemoryEntry {
                    value: MemoryValue::Text(next.to_string()),
                    expires_at,
                });
                Ok(PipelineValue::Int(next))
            }
            Operation::Expire { key, ttl } => match self.slot(&key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl_millis(ttl));
                    Ok(PipelineValue::Int(1))
                }
                None => Ok(PipelineValue::Int(0)),
            },
            Operation::Delete { key } => {
                let slot = self.slot(&key);
                let existed = slot.take().is_some();
                Ok(PipelineValue::Int(existed as i64))
            }
            Operation::HashGet { key, field } => match self.get(&key).map(|e| &e.value) {
                None => Ok(PipelineValue::Nil),
                Some(MemoryValue::Hash(fields)) => Ok(fields
                    .get(&field)
                    .cloned()
                    .map_or(PipelineValue::Nil, PipelineValue::Text)),
                Some(_) => Err(wrong_type(&key)),
            },
            Operation::HashSet { key, field, value } => {
                let fields = self.hash_mut(&key)?;
                let added = fields.insert(field, value).is_none();
                Ok(PipelineValue::Int(added as i64))
            }
            Operation::HashIncrement { key, field, amount } => {
                let fields = self.hash_mut(&key)?;
                let current = match fields.get(&field) {
                    Some(raw) => parse_integer(&key, raw)?,
                    None => 0,
                };
                let next = current + amount;
                fields.insert(field, next.to_string());
                Ok(PipelineValue::Int(next))
            }
            Operation::HashDelete { key, fields } => {
                let slot = self.slot(&key);
                let removed = match slot.as_mut().map(|e| &mut e.value) {
                    None => 0,
                    Some(MemoryValue::Hash(existing)) => fields
                        .iter()
                        .filter(|field| existing.remove(*field).is_some())
                        .count(),
                    Some(_) => return Err(wrong_type(&key)),
                };
                if matches!(slot.as_ref().map(|e| &e.value), Some(MemoryValue::Hash(h)) if h.is_empty())
                {
                    *slot = None;
                }
                Ok(PipelineValue::Int(removed as i64))
            }
            Operation::SortedSetAdd { key, member, score } => {
                let members = self.sorted_set_mut(&key)?;
                let added = match members.iter().position(|(m, _)| *m == member) {
                    Some(index) => {
                        members.remove(index);
                        false
                    }
                    None => true,
                };
                let at = members.partition_point(|(m, s)| (*s, m.as_str()) < (score, member.as_str()));
                members.insert(at, (member, score));
                Ok(PipelineValue::Int(added as i64))
            }
            Operation::SortedSetRemoveByScore { key, min, max } => {
                let slot = self.slot(&key);
                let removed = match slot.as_mut().map(|e| &mut e.value) {
                    None => 0,
                    Some(MemoryValue::SortedSet(members)) => {
                        let before = members.len();
                        members.retain(|(_, score)| {
                            !(min.admits_from_below(*score) && max.admits_from_above(*score))
                        });
                        before - members.len()
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                if matches!(slot.as_ref().map(|e| &e.value), Some(MemoryValue::SortedSet(m)) if m.is_empty())
                {
                    *slot = None;
                }
                Ok(PipelineValue::Int(removed as i64))
            }
            Operation::SortedSetCard { key } => match self.get(&key).map(|e| &e.value) {
                None => Ok(PipelineValue::Int(0)),
                Some(MemoryValue::SortedSet(members)) => Ok(PipelineValue::Int(members.len() as i64)),
                Some(_) => Err(wrong_type(&key)),
            },
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        let slot = self.slot(key);
        let entry = slot.get_or_insert_with(|| MemoryEntry::new(MemoryValue::Hash(HashMap::new())));
        match &mut entry.value {
            MemoryValue::Hash(fields) => Ok(fields),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_set_mut(&mut self, key: &str) -> Result<&mut Vec<(String, f64)>> {
        let slot = self.slot(key);
        let entry =
            slot.get_or_insert_with(|| MemoryEntry::new(MemoryValue::SortedSet(Vec::new())));
        match &mut entry.value {
            MemoryValue::SortedSet(members) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn apply_all(&mut self, pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        pipeline
            .into_operations()
            .into_iter()
            .map(|operation| self.apply(operation))
            .collect()
    }

    fn into_changes(self) -> HashMap<String, Option<MemoryEntry>> {
        self.changes
    }
}

/// Writes staged changes back, refusing new keys beyond `max_entries`
fn commit(
    changes: HashMap<String, Option<MemoryEntry>>,
    table: &mut Table,
    now: u64,
    max_entries: usize,
) -> Result<()> {
    let new_keys = changes
        .iter()
        .filter(|(key, staged)| {
            staged.is_some() && !table.get(*key).is_some_and(|entry| entry.is_live(now))
        })
        .count();

    // Only count live entries when the raw size says we might be over
    if new_keys > 0 && table.len() + new_keys > max_entries {
        let live = table.values().filter(|entry| entry.is_live(now)).count();
        if live + new_keys > max_entries {
            return Err(StorageError::CapacityExceeded(max_entries).into());
        }
    }

    for (key, staged) in changes {
        match staged {
            Some(entry) => {
                table.insert(key, entry);
            }
            None => {
                table.remove(&key);
            }
        }
    }
    Ok(())
}

fn wrong_type(key: &str) -> crate::error::RateLimiterError {
    StorageError::Command(format!(
        "WRONGTYPE operation against {} holding the wrong kind of value",
        key
    ))
    .into()
}

fn parse_integer(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| {
        StorageError::Command(format!("value at {} is not an integer", key)).into()
    })
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn execute_atomic(&self, pipeline: Pipeline) -> Result<Vec<PipelineValue>> {
        let now = self.clock.now_millis();
        let mut table = self.data.write().unwrap_or_else(PoisonError::into_inner);

        let mut staged = Staged::new(&table, now);
        let replies = staged.apply_all(pipeline)?;
        let changes = staged.into_changes();

        commit(changes, &mut table, now, self.config.max_entries)?;
        Ok(replies)
    }

    async fn snapshot(&self, key: &str, read: ReadOp) -> Result<Snapshot> {
        let now = self.clock.now_millis();
        let table = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Staged::new(&table, now).read(key, &read)
    }

    async fn transaction<T, F>(&self, key: &str, read: ReadOp, decide: F) -> Result<T>
    where
        T: Send,
        F: Fn(Snapshot) -> Result<(T, Pipeline)> + Send + Sync,
    {
        let now = self.clock.now_millis();
        let mut table = self.data.write().unwrap_or_else(PoisonError::into_inner);

        let mut staged = Staged::new(&table, now);
        let snapshot = staged.read(key, &read)?;
        let (outcome, writes) = decide(snapshot)?;
        if writes.is_empty() {
            return Ok(outcome);
        }
        staged.apply_all(writes)?;
        let changes = staged.into_changes();

        commit(changes, &mut table, now, self.config.max_entries)?;
        Ok(outcome)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
