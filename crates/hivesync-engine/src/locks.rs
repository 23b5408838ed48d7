//! Exclusive resource locks.
//!
//! A claim writes every lock record plus the worker's `claimed_resources`
//! in one store commit, so it either takes all requested keys or none.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hivesync_core::{CoordError, Lock, Worker, WorkerId, WorkerStatus};

use crate::clock::Clock;
use crate::store::{Records, StoreError, Table, Write};

/// Which of a worker's locks a release applies to.
#[derive(Clone, Copy)]
enum Scope<'a> {
    /// The named keys.
    Keys(&'a BTreeSet<String>),
    /// Every lock the worker holds.
    All,
    /// Every lock the worker holds, only while it is OFFLINE or unknown.
    Orphaned,
}

/// Lock operations against the shared store.
pub struct LockManager {
    records: Records,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(records: Records, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    /// Claim all of `resources` for `worker`, or none of them.
    ///
    /// Keys the worker already holds are kept. Returns the keys newly taken.
    pub async fn claim<I, S>(&self, worker: &WorkerId, resources: I) -> Result<Vec<String>, CoordError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted = normalize(resources)?;
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        for attempt in 1..=self.records.max_retries() {
            let entity = self
                .records
                .get::<Worker>(worker.as_str())
                .await?
                .ok_or_else(|| CoordError::UnknownWorker(worker.clone()))?;
            if entity.value.status == WorkerStatus::Offline {
                return Err(CoordError::InvalidInput(format!(
                    "worker {worker} is offline and must register again"
                )));
            }

            let now = self.clock.now();
            let mut writes = Vec::new();
            let mut taken = Vec::new();
            for key in &wanted {
                match self.records.get::<Lock>(key).await? {
                    Some(lock) if lock.value.holder != *worker => {
                        debug!(
                            worker_id = %worker,
                            resource = %key,
                            holder = %lock.value.holder,
                            "Resource already held"
                        );
                        return Err(CoordError::ResourceConflict {
                            resource: key.clone(),
                            holder: lock.value.holder,
                        });
                    }
                    Some(_) => {}
                    None => {
                        writes.push(Write::put(&Lock::new(key.clone(), worker.clone(), now), None)?);
                        taken.push(key.clone());
                    }
                }
            }

            let mut w = entity.value;
            let before = w.claimed_resources.len();
            w.claimed_resources.extend(wanted.iter().cloned());
            if taken.is_empty() && w.claimed_resources.len() == before {
                return Ok(taken);
            }
            writes.push(Write::put(&w, Some(entity.version))?);

            match self.records.commit(writes).await {
                Ok(()) => {
                    info!(worker_id = %worker, resources = ?taken, "Resources claimed");
                    return Ok(taken);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(worker_id = %worker, attempt, "Claim raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict {
            table: Table::Locks,
            key: wanted.iter().cloned().collect::<Vec<_>>().join(","),
        }
        .into())
    }

    /// Release the named keys if `worker` holds them. Keys held by others
    /// or not held at all are ignored. Returns the keys actually released.
    pub async fn release<I, S>(&self, worker: &WorkerId, resources: I) -> Result<Vec<String>, CoordError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = normalize(resources)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.release_scoped(worker, Scope::Keys(&keys)).await
    }

    /// Force-release every lock held by `worker`.
    pub async fn release_all(&self, worker: &WorkerId) -> Result<Vec<String>, CoordError> {
        self.release_scoped(worker, Scope::All).await
    }

    /// Drop locks whose holder is OFFLINE or not registered.
    /// Returns the number of locks removed.
    pub async fn collect_garbage(&self) -> Result<usize, CoordError> {
        let workers: BTreeMap<WorkerId, WorkerStatus> = self
            .records
            .scan::<Worker>()
            .await?
            .into_iter()
            .map(|e| (e.value.id, e.value.status))
            .collect();

        let orphaned_holders: BTreeSet<WorkerId> = self
            .list()
            .await?
            .into_iter()
            .filter(|lock| {
                !matches!(workers.get(&lock.holder), Some(status) if status.is_live())
            })
            .map(|lock| lock.holder)
            .collect();

        let mut removed = 0;
        for holder in &orphaned_holders {
            let released = self.release_scoped(holder, Scope::Orphaned).await?;
            if !released.is_empty() {
                warn!(worker_id = %holder, resources = ?released, "Released orphaned locks");
            }
            removed += released.len();
        }
        Ok(removed)
    }

    /// All locks, ordered by resource key.
    pub async fn list(&self) -> Result<Vec<Lock>, CoordError> {
        Ok(self
            .records
            .scan::<Lock>()
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    pub async fn holder_of(&self, resource: &str) -> Result<Option<WorkerId>, CoordError> {
        Ok(self
            .records
            .get::<Lock>(resource)
            .await?
            .map(|e| e.value.holder))
    }

    async fn release_scoped(
        &self,
        worker: &WorkerId,
        scope: Scope<'_>,
    ) -> Result<Vec<String>, CoordError> {
        for attempt in 1..=self.records.max_retries() {
            let entity = self.records.get::<Worker>(worker.as_str()).await?;
            if let (Scope::Orphaned, Some(e)) = (&scope, &entity) {
                if e.value.status.is_live() {
                    return Ok(Vec::new());
                }
            }

            let mut writes = Vec::new();
            let mut released = Vec::new();
            match scope {
                Scope::Keys(keys) => {
                    for key in keys {
                        if let Some(lock) = self.records.get::<Lock>(key).await? {
                            if lock.value.holder == *worker {
                                writes.push(Write::delete(Table::Locks, key.clone(), lock.version));
                                released.push(key.clone());
                            }
                        }
                    }
                }
                Scope::All | Scope::Orphaned => {
                    for lock in self.records.scan::<Lock>().await? {
                        if lock.value.holder == *worker {
                            writes.push(Write::delete(
                                Table::Locks,
                                lock.value.resource_key.clone(),
                                lock.version,
                            ));
                            released.push(lock.value.resource_key);
                        }
                    }
                }
            }

            // The worker record rides along with the deletes. Its version
            // also guards against the worker re-registering mid-release.
            if let Some(e) = entity {
                let mut w = e.value;
                let before = w.claimed_resources.len();
                match scope {
                    Scope::Keys(keys) => w.claimed_resources.retain(|r| !keys.contains(r)),
                    Scope::All | Scope::Orphaned => w.claimed_resources.clear(),
                }
                if w.claimed_resources.len() != before || !writes.is_empty() {
                    writes.push(Write::put(&w, Some(e.version))?);
                }
            }

            if writes.is_empty() {
                return Ok(released);
            }
            match self.records.commit(writes).await {
                Ok(()) => {
                    if !released.is_empty() {
                        info!(worker_id = %worker, resources = ?released, "Resources released");
                    }
                    return Ok(released);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(worker_id = %worker, attempt, "Release raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict {
            table: Table::Locks,
            key: worker.to_string(),
        }
        .into())
    }
}

fn normalize<I, S>(resources: I) -> Result<BTreeSet<String>, CoordError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut keys = BTreeSet::new();
    for r in resources {
        let r: String = r.into();
        if r.trim().is_empty() {
            return Err(CoordError::InvalidInput("resource keys must not be empty".into()));
        }
        keys.insert(r);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use hivesync_core::CapabilitySet;

    async fn setup(workers: &[&str]) -> (LockManager, Records) {
        let records = Records::new(Arc::new(MemoryStore::new()), 8);
        for id in workers {
            records
                .insert(&Worker::new(WorkerId::new(*id), CapabilitySet::new(), 1, Utc::now()))
                .await
                .unwrap();
        }
        (LockManager::new(records.clone(), Arc::new(SystemClock)), records)
    }

    async fn worker(records: &Records, id: &str) -> Worker {
        records.get::<Worker>(id).await.unwrap().unwrap().value
    }

    #[tokio::test]
    async fn test_claim_conflict_takes_nothing() {
        let (locks, records) = setup(&["w1", "w2"]).await;
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");

        locks.claim(&w1, ["a.py"]).await.unwrap();

        let err = locks.claim(&w2, ["b.py", "a.py"]).await.unwrap_err();
        match err {
            CoordError::ResourceConflict { resource, holder } => {
                assert_eq!(resource, "a.py");
                assert_eq!(holder, w1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(locks.holder_of("b.py").await.unwrap().is_none());
        assert!(worker(&records, "w2").await.claimed_resources.is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_is_idempotent() {
        let (locks, records) = setup(&["w1"]).await;
        let w1 = WorkerId::new("w1");

        assert_eq!(locks.claim(&w1, ["a.py", "b.py"]).await.unwrap().len(), 2);
        assert_eq!(locks.claim(&w1, ["a.py"]).await.unwrap().len(), 0);

        assert_eq!(locks.list().await.unwrap().len(), 2);
        assert!(worker(&records, "w1").await.holds("b.py"));
    }

    #[tokio::test]
    async fn test_claim_requires_live_worker() {
        let (locks, records) = setup(&["w1"]).await;
        let err = locks.claim(&WorkerId::new("ghost"), ["a.py"]).await.unwrap_err();
        assert!(matches!(err, CoordError::UnknownWorker(_)));

        let mut w = worker(&records, "w1").await;
        w.status = WorkerStatus::Offline;
        let version = records.get::<Worker>("w1").await.unwrap().unwrap().version;
        records.commit(vec![Write::put(&w, Some(version)).unwrap()]).await.unwrap();

        let err = locks.claim(&WorkerId::new("w1"), ["a.py"]).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_release_ignores_foreign_locks() {
        let (locks, records) = setup(&["w1", "w2"]).await;
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        locks.claim(&w1, ["a.py", "b.py"]).await.unwrap();

        assert!(locks.release(&w2, ["a.py", "zzz"]).await.unwrap().is_empty());
        assert_eq!(locks.holder_of("a.py").await.unwrap(), Some(w1.clone()));

        assert_eq!(locks.release(&w1, ["a.py"]).await.unwrap(), vec!["a.py".to_string()]);
        assert!(locks.holder_of("a.py").await.unwrap().is_none());
        let w = worker(&records, "w1").await;
        assert!(!w.holds("a.py"));
        assert!(w.holds("b.py"));
    }

    #[tokio::test]
    async fn test_collect_garbage_drops_offline_holders() {
        let (locks, records) = setup(&["w1", "w2"]).await;
        locks.claim(&WorkerId::new("w1"), ["a.py", "b.py"]).await.unwrap();
        locks.claim(&WorkerId::new("w2"), ["c.py"]).await.unwrap();

        assert_eq!(locks.collect_garbage().await.unwrap(), 0);

        let mut w = worker(&records, "w1").await;
        w.status = WorkerStatus::Offline;
        let version = records.get::<Worker>("w1").await.unwrap().unwrap().version;
        records.commit(vec![Write::put(&w, Some(version)).unwrap()]).await.unwrap();

        assert_eq!(locks.collect_garbage().await.unwrap(), 2);
        let remaining = locks.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resource_key, "c.py");
        assert!(worker(&records, "w1").await.claimed_resources.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_one_holder() {
        let ids: Vec<String> = (0..6).map(|i| format!("w{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (locks, _) = setup(&refs).await;
        let locks = Arc::new(locks);

        let mut handles = Vec::new();
        for id in ids {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.claim(&WorkerId::new(id), ["shared.rs"]).await
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(locks.list().await.unwrap().len(), 1);
    }
}
