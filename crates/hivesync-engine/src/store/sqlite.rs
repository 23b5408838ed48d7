//! Shared transactional store on SQLite.
//!
//! Several OS processes open the same database file; SQLite's file locking
//! serialises their commits. Each table is `(id, version, body)` where `body`
//! is the record's JSON.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::info;

use super::{check_batch, Store, StoreError, Table, Versioned, Write, WriteOp};

/// How long a connection waits on another process's write lock before
/// reporting the store as unavailable.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// SQLite-backed store.
///
/// `Mutex` (not `RwLock`) because rusqlite's `Connection` is `!Sync`. Calls
/// run on the blocking thread pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        store.run_migrations()?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Open a private in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;

        for table in Table::all() {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL
                );",
                name = table.name()
            ))?;
        }
        Ok(())
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn decode_row(key: String, version: i64, body: String) -> Result<Versioned, StoreError> {
    Ok(Versioned {
        key,
        version: version as u64,
        body: serde_json::from_str(&body)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT version, body FROM {} WHERE id = ?1", table.name()),
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            row.map(|(version, body)| decode_row(key, version, body))
                .transpose()
        })
        .await
    }

    async fn scan(&self, table: Table) -> Result<Vec<Versioned>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, version, body FROM {} ORDER BY id",
                table.name()
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (key, version, body) = row?;
                out.push(decode_row(key, version, body)?);
            }
            Ok(out)
        })
        .await
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        check_batch(&writes)?;
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front so the version checks
            // and the writes see the same database state.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for w in &writes {
                let current: Option<i64> = tx
                    .query_row(
                        &format!("SELECT version FROM {} WHERE id = ?1", w.table.name()),
                        params![w.key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current.map(|v| v as u64) != w.expected {
                    return Err(StoreError::Conflict {
                        table: w.table,
                        key: w.key.clone(),
                    });
                }
            }

            for w in &writes {
                match (&w.op, w.next_version()) {
                    (WriteOp::Put(body), Some(version)) => {
                        tx.execute(
                            &format!(
                                "INSERT INTO {} (id, version, body) VALUES (?1, ?2, ?3)
                                 ON CONFLICT(id) DO UPDATE SET version = excluded.version, body = excluded.body",
                                w.table.name()
                            ),
                            params![w.key, version as i64, body.to_string()],
                        )?;
                    }
                    _ => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE id = ?1", w.table.name()),
                            params![w.key],
                        )?;
                    }
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(key: &str, expected: Option<u64>, body: serde_json::Value) -> Write {
        Write {
            table: Table::Locks,
            key: key.to_string(),
            expected,
            op: WriteOp::Put(body),
        }
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .commit(vec![put("a.py", None, json!({"holder": "w1"}))])
            .await
            .unwrap();

        let rec = store.get(Table::Locks, "a.py").await.unwrap().unwrap();
        assert_eq!(rec.version, 1);
        assert_eq!(rec.body["holder"], "w1");
        assert_eq!(store.scan(Table::Locks).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_whole_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .commit(vec![put("a.py", None, json!({"holder": "w1"}))])
            .await
            .unwrap();

        let err = store
            .commit(vec![
                put("b.py", None, json!({"holder": "w2"})),
                put("a.py", None, json!({"holder": "w2"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get(Table::Locks, "b.py").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("hive.db");

        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        first
            .commit(vec![put("a.py", None, json!({"holder": "w1"}))])
            .await
            .unwrap();

        // The second handle sees the write and cannot take the same key.
        assert!(second.get(Table::Locks, "a.py").await.unwrap().is_some());
        assert!(second
            .commit(vec![put("a.py", None, json!({"holder": "w2"}))])
            .await
            .is_err());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.run_migrations().unwrap();
    }
}
