//! In-process store.
//!
//! Shared by every component of one process. Useful for tests, single-node
//! deployments, and a node whose workers all talk to it over HTTP.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_batch, Store, StoreError, Table, Versioned, Write, WriteOp};

type Rows = BTreeMap<String, (u64, serde_json::Value)>;

/// Store backed by in-memory maps behind one lock.
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Rows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records across all tables.
    pub async fn len(&self) -> usize {
        self.tables.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .map(|(version, body)| Versioned {
                key: key.to_string(),
                version: *version,
                body: body.clone(),
            }))
    }

    async fn scan(&self, table: Table) -> Result<Vec<Versioned>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
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
        let mut tables = self.tables.write().await;

        for w in &writes {
            let current = tables
                .get(&w.table)
                .and_then(|rows| rows.get(&w.key))
                .map(|(v, _)| *v);
            if current != w.expected {
                return Err(StoreError::Conflict {
                    table: w.table,
                    key: w.key.clone(),
                });
            }
        }

        for w in writes {
            let next = w.next_version();
            let rows = tables.entry(w.table).or_default();
            match (w.op, next) {
                (WriteOp::Put(body), Some(version)) => {
                    rows.insert(w.key, (version, body));
                }
                _ => {
                    rows.remove(&w.key);
                }
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(table: Table, key: &str, expected: Option<u64>, body: serde_json::Value) -> Write {
        Write {
            table,
            key: key.to_string(),
            expected,
            op: WriteOp::Put(body),
        }
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .commit(vec![put(Table::Locks, "a.py", None, json!({"holder": "w1"}))])
            .await
            .unwrap();

        // b.py is free but a.py is taken, so nothing may apply.
        let err = store
            .commit(vec![
                put(Table::Locks, "b.py", None, json!({"holder": "w2"})),
                put(Table::Locks, "a.py", None, json!({"holder": "w2"})),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get(Table::Locks, "b.py").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_versions_and_delete() {
        let store = MemoryStore::new();
        store
            .commit(vec![put(Table::Tasks, "t1", None, json!(1))])
            .await
            .unwrap();
        store
            .commit(vec![put(Table::Tasks, "t1", Some(1), json!(2))])
            .await
            .unwrap();

        let rec = store.get(Table::Tasks, "t1").await.unwrap().unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.body, json!(2));

        // Stale version is rejected.
        assert!(store
            .commit(vec![Write::delete(Table::Tasks, "t1", 1)])
            .await
            .is_err());

        store
            .commit(vec![Write::delete(Table::Tasks, "t1", 2)])
            .await
            .unwrap();
        assert!(store.scan(Table::Tasks).await.unwrap().is_empty());
    }
}
