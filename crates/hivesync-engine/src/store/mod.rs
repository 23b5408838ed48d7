//! Durable keyed tables shared by every process in the fleet.
//!
//! A [`Store`] holds four tables (workers, tasks, locks, messages) of
//! versioned JSON records. The only mutation primitive is [`Store::commit`]:
//! a batch of writes, each guarded by the version the caller last saw, that
//! applies atomically or not at all. Everything else (atomic read-modify-write
//! of one record, all-or-nothing lock claims) is built on top of it by
//! [`Records`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use hivesync_core::{CoordError, Lock, Message, Task, Worker};

use crate::config::{StoreBackend, StoreConfig};

pub mod log;
pub mod memory;
pub mod sqlite;

pub use self::log::{FileLog, LogRemote, LogStore, MemoryLog};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is momentarily unreachable or busy. Retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write's expected version did not match. Re-read and retry.
    #[error("version conflict on {table}/{key}")]
    Conflict { table: Table, key: String },

    /// A record could not be encoded or decoded.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// SQLite error that is not a transient lock.
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupted(e.to_string())
    }
}

impl From<StoreError> for CoordError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupted(msg) => CoordError::Corrupted(msg),
            StoreError::Conflict { table, key } => CoordError::StoreUnavailable(format!(
                "gave up after repeated version conflicts on {table}/{key}"
            )),
            other => CoordError::StoreUnavailable(other.to_string()),
        }
    }
}

/// The four persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Workers,
    Tasks,
    Locks,
    Messages,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Workers => "workers",
            Table::Tasks => "tasks",
            Table::Locks => "locks",
            Table::Messages => "messages",
        }
    }

    pub fn all() -> &'static [Table] {
        &[Table::Workers, Table::Tasks, Table::Locks, Table::Messages]
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored record with its version. Versions start at 1 and grow by one per write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub key: String,
    pub version: u64,
    pub body: serde_json::Value,
}

/// What a [`Write`] does to its record.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(serde_json::Value),
    Delete,
}

/// One conditional write inside a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub table: Table,
    pub key: String,
    /// Version the record must currently have; `None` means it must not exist.
    pub expected: Option<u64>,
    pub op: WriteOp,
}

impl Write {
    /// Insert or overwrite a typed record.
    pub fn put<T: Record>(value: &T, expected: Option<u64>) -> Result<Self, StoreError> {
        Ok(Self {
            table: T::TABLE,
            key: value.key(),
            expected,
            op: WriteOp::Put(serde_json::to_value(value)?),
        })
    }

    /// Delete a record that currently has version `expected`.
    pub fn delete(table: Table, key: impl Into<String>, expected: u64) -> Self {
        Self {
            table,
            key: key.into(),
            expected: Some(expected),
            op: WriteOp::Delete,
        }
    }

    /// Version the record will have after this write, if it still exists.
    pub fn next_version(&self) -> Option<u64> {
        match self.op {
            WriteOp::Put(_) => Some(self.expected.unwrap_or(0) + 1),
            WriteOp::Delete => None,
        }
    }
}

/// Backend-agnostic store interface.
///
/// Implementations must apply a `commit` batch atomically: either every
/// write's expected version matches and all of them apply, or nothing
/// changes and [`StoreError::Conflict`] is returned.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Read one record.
    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Read every record of a table, ordered by key.
    async fn scan(&self, table: Table) -> Result<Vec<Versioned>, StoreError>;

    /// Apply a batch of conditional writes atomically.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool {
        self.scan(Table::Locks).await.is_ok()
    }
}

/// Reject batches that touch the same record twice; their outcome would
/// depend on write order.
pub(crate) fn check_batch(writes: &[Write]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for w in writes {
        if !seen.insert((w.table, w.key.as_str())) {
            return Err(StoreError::Corrupted(format!(
                "batch writes {}/{} twice",
                w.table, w.key
            )));
        }
    }
    Ok(())
}

/// Open the backend described by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match &config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite { path } => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Log { path, replica_id } => {
            let replica = replica_id
                .clone()
                .unwrap_or_else(|| format!("replica-{}", std::process::id()));
            Arc::new(LogStore::new(
                replica,
                Arc::new(FileLog::new(path)),
                config.max_cas_retries,
            ))
        }
    };
    Ok(store)
}

/// A type persisted in one of the tables.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;

    fn key(&self) -> String;
}

impl Record for Worker {
    const TABLE: Table = Table::Workers;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Task {
    const TABLE: Table = Table::Tasks;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Lock {
    const TABLE: Table = Table::Locks;

    fn key(&self) -> String {
        self.resource_key.clone()
    }
}

impl Record for Message {
    const TABLE: Table = Table::Messages;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A decoded record with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<T> {
    pub version: u64,
    pub value: T,
}

impl<T: Record> Entity<T> {
    fn decode(raw: Versioned) -> Result<Self, StoreError> {
        let value = serde_json::from_value(raw.body).map_err(|e| {
            StoreError::Corrupted(format!("{}/{}: {}", T::TABLE, raw.key, e))
        })?;
        Ok(Self {
            version: raw.version,
            value,
        })
    }
}

/// Outcome of a read-modify-write closure.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Write this value.
    Put(T),
    /// Remove the record.
    Delete,
    /// Leave the record untouched.
    Keep,
}

/// Typed access to a [`Store`] with optimistic retry.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
    max_retries: u32,
}

impl Records {
    pub fn new(store: Arc<dyn Store>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn get<T: Record>(&self, key: &str) -> Result<Option<Entity<T>>, StoreError> {
        match self.store.get(T::TABLE, key).await? {
            Some(raw) => Ok(Some(Entity::decode(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn scan<T: Record>(&self) -> Result<Vec<Entity<T>>, StoreError> {
        self.store
            .scan(T::TABLE)
            .await?
            .into_iter()
            .map(Entity::decode)
            .collect()
    }

    pub async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        self.store.commit(writes).await
    }

    /// Insert a record that must not exist yet.
    pub async fn insert<T: Record>(&self, value: &T) -> Result<(), StoreError> {
        self.commit(vec![Write::put(value, None)?]).await
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` sees the current value (or `None`) and decides what to write. On a
    /// version conflict the record is re-read and `f` runs again, up to the
    /// configured retry budget.
    pub async fn update<T, R, E, F>(&self, key: &str, mut f: F) -> Result<R, E>
    where
        T: Record,
        E: From<StoreError>,
        F: FnMut(Option<T>) -> Result<(Mutation<T>, R), E>,
    {
        for attempt in 1..=self.max_retries {
            let current = self.get::<T>(key).await?;
            let version = current.as_ref().map(|e| e.version);
            let (mutation, result) = f(current.map(|e| e.value))?;

            let write = match mutation {
                Mutation::Keep => return Ok(result),
                Mutation::Put(value) => Write::put(&value, version)?,
                Mutation::Delete => match version {
                    Some(v) => Write::delete(T::TABLE, key, v),
                    None => return Ok(result),
                },
            };

            match self.store.commit(vec![write]).await {
                Ok(()) => return Ok(result),
                Err(StoreError::Conflict { .. }) => {
                    debug!(table = %T::TABLE, key = %key, attempt, "Version conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict {
            table: T::TABLE,
            key: key.to_string(),
        }
        .into())
    }
}
