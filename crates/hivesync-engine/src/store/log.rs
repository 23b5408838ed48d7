//! Replicated append-only log store.
//!
//! Every process keeps a local replica of the tables, materialised from a
//! shared log of commit entries. A commit:
//!
//! 1. pulls entries it has not applied yet,
//! 2. validates expected versions against the replica,
//! 3. appends one entry, passing the log length it validated against,
//! 4. if the remote has grown in the meantime, goes back to 1.
//!
//! The expected length is a compare-and-swap token: an append built on a
//! stale view is refused instead of landing on top of a concurrent writer's
//! entry, so two replicas can never silently overwrite each other.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{check_batch, Store, StoreError, Table, Versioned, Write, WriteOp};

/// One record change inside a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedWrite {
    pub table: Table,
    pub key: String,
    /// Version after the write.
    pub version: u64,
    /// New body; `None` for a delete.
    pub body: Option<serde_json::Value>,
}

/// One committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Replica that appended the entry.
    pub origin: String,
    pub appended_at: DateTime<Utc>,
    pub writes: Vec<LoggedWrite>,
}

/// Result of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The entry landed; the log now has `len` entries.
    Appended { len: u64 },
    /// The log no longer has the expected length; it has `len` entries.
    Stale { len: u64 },
}

/// The shared log every replica pulls from and appends to.
#[async_trait]
pub trait LogRemote: Send + Sync {
    /// Entries at positions `from..`.
    async fn fetch(&self, from: u64) -> Result<Vec<LogEntry>, StoreError>;

    /// Append `entry` only if the log currently holds exactly `expected_len` entries.
    async fn append(&self, expected_len: u64, entry: LogEntry)
        -> Result<AppendOutcome, StoreError>;
}

/// Log held in memory and shared by cloning. Lets several replicas in one
/// process behave like separate nodes.
#[derive(Clone, Default)]
pub struct MemoryLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl LogRemote for MemoryLog {
    async fn fetch(&self, from: u64) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().skip(from as usize).cloned().collect())
    }

    async fn append(
        &self,
        expected_len: u64,
        entry: LogEntry,
    ) -> Result<AppendOutcome, StoreError> {
        let mut entries = self.entries.lock().await;
        let len = entries.len() as u64;
        if len != expected_len {
            return Ok(AppendOutcome::Stale { len });
        }
        entries.push(entry);
        Ok(AppendOutcome::Appended { len: len + 1 })
    }
}

/// Log kept as a JSON-lines file, typically on a shared volume.
///
/// Appends hold an exclusive advisory lock on the log file itself. The OS
/// drops the lock when the holder exits, so a crashed writer never leaves
/// the log locked. Readers take no lock: a last line still missing its
/// newline is an append in flight and is not read yet.
pub struct FileLog {
    path: PathBuf,
    lock_wait: Duration,
}

impl FileLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock_wait: Duration::from_secs(5),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(path: &Path, from: u64) -> Result<Vec<LogEntry>, StoreError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for line in entry_lines(&content)?.into_iter().skip(from as usize) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }

    /// Append `entry` if the log holds exactly `expected_len` entries.
    fn append_locked(
        path: &Path,
        wait: Duration,
        expected_len: u64,
        entry: &LogEntry,
    ) -> Result<AppendOutcome, StoreError> {
        let mut file = lock_log(path, wait)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        // Only a writer that died mid-append leaves a partial tail behind a
        // released lock.
        let complete = complete_len(&content);
        if complete < content.len() {
            warn!(
                path = %path.display(),
                bytes = content.len() - complete,
                "Dropping partial log tail"
            );
            file.set_len(complete as u64)?;
        }

        let len = entry_lines(&content)?.len() as u64;
        if len != expected_len {
            return Ok(AppendOutcome::Stale { len });
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        Ok(AppendOutcome::Appended { len: len + 1 })
    }
}

/// Byte length of the prefix made of newline-terminated lines.
fn complete_len(content: &[u8]) -> usize {
    content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1)
}

/// Entry lines of a log file, in order. Blank lines are not entries, and a
/// last line without its newline is not written yet.
fn entry_lines(content: &[u8]) -> Result<Vec<&str>, StoreError> {
    let complete = std::str::from_utf8(&content[..complete_len(content)])
        .map_err(|e| StoreError::Corrupted(format!("log is not UTF-8: {e}")))?;
    Ok(complete
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect())
}

/// Open the log for appending and take its exclusive lock, waiting up to `wait`.
fn lock_log(path: &Path, wait: Duration) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let deadline = Instant::now() + wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                if Instant::now() >= deadline {
                    return Err(StoreError::Unavailable(format!(
                        "log {} is locked by another writer",
                        path.display()
                    )));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl LogRemote for FileLog {
    async fn fetch(&self, from: u64) -> Result<Vec<LogEntry>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read_entries(&path, from))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }

    async fn append(
        &self,
        expected_len: u64,
        entry: LogEntry,
    ) -> Result<AppendOutcome, StoreError> {
        let path = self.path.clone();
        let wait = self.lock_wait;

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Self::append_locked(&path, wait, expected_len, &entry)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[derive(Default)]
struct Replica {
    /// Number of log entries applied.
    applied: u64,
    tables: HashMap<Table, BTreeMap<String, (u64, serde_json::Value)>>,
}

impl Replica {
    fn apply(&mut self, entry: &LogEntry) {
        for w in &entry.writes {
            let rows = self.tables.entry(w.table).or_default();
            match &w.body {
                Some(body) => {
                    rows.insert(w.key.clone(), (w.version, body.clone()));
                }
                None => {
                    rows.remove(&w.key);
                }
            }
        }
        self.applied += 1;
    }

    fn version_of(&self, table: Table, key: &str) -> Option<u64> {
        self.tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .map(|(v, _)| *v)
    }
}

/// Store whose state is a local replica of a shared [`LogRemote`].
pub struct LogStore {
    origin: String,
    remote: Arc<dyn LogRemote>,
    replica: Mutex<Replica>,
    max_push_attempts: u32,
}

impl LogStore {
    pub fn new(origin: impl Into<String>, remote: Arc<dyn LogRemote>, max_push_attempts: u32) -> Self {
        Self {
            origin: origin.into(),
            remote,
            replica: Mutex::new(Replica::default()),
            max_push_attempts: max_push_attempts.max(1),
        }
    }

    /// Number of log entries this replica has applied.
    pub async fn applied(&self) -> u64 {
        self.replica.lock().await.applied
    }

    async fn pull(&self, replica: &mut Replica) -> Result<(), StoreError> {
        let entries = self.remote.fetch(replica.applied).await?;
        if !entries.is_empty() {
            debug!(origin = %self.origin, count = entries.len(), "Applying remote log entries");
        }
        for entry in &entries {
            replica.apply(entry);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for LogStore {
    fn backend(&self) -> &'static str {
        "log"
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut replica = self.replica.lock().await;
        self.pull(&mut replica).await?;
        Ok(replica
            .tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .map(|(version, body)| Versioned {
                key: key.to_string(),
                version: *version,
                body: body.clone(),
            }))
    }

    async fn scan(&self, table: Table) -> Result<Vec<Versioned>, StoreError> {
        let mut replica = self.replica.lock().await;
        self.pull(&mut replica).await?;
        Ok(replica
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|(key, (version, body))| Versioned {
                        key: key.clone(),
                        version: *version,
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        check_batch(&writes)?;
        if writes.is_empty() {
            return Ok(());
        }
        let mut replica = self.replica.lock().await;

        for attempt in 1..=self.max_push_attempts {
            self.pull(&mut replica).await?;

            for w in &writes {
                if replica.version_of(w.table, &w.key) != w.expected {
                    return Err(StoreError::Conflict {
                        table: w.table,
                        key: w.key.clone(),
                    });
                }
            }

            let entry = LogEntry {
                origin: self.origin.clone(),
                appended_at: Utc::now(),
                writes: writes
                    .iter()
                    .map(|w| LoggedWrite {
                        table: w.table,
                        key: w.key.clone(),
                        version: w.next_version().unwrap_or(0),
                        body: match &w.op {
                            WriteOp::Put(body) => Some(body.clone()),
                            WriteOp::Delete => None,
                        },
                    })
                    .collect(),
            };

            match self.remote.append(replica.applied, entry.clone()).await? {
                AppendOutcome::Appended { .. } => {
                    replica.apply(&entry);
                    return Ok(());
                }
                AppendOutcome::Stale { len } => {
                    debug!(
                        origin = %self.origin,
                        attempt,
                        expected = replica.applied,
                        actual = len,
                        "Log moved under us, re-validating"
                    );
                }
            }
        }

        // Persistent contention: report it as a conflict so callers re-read.
        let first = writes.first();
        Err(StoreError::Conflict {
            table: first.map(|w| w.table).unwrap_or(Table::Tasks),
            key: first.map(|w| w.key.clone()).unwrap_or_default(),
        })
    }
}
