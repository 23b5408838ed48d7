//! Worker presence and liveness.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use hivesync_core::{CapabilitySet, CoordError, TaskId, Worker, WorkerId, WorkerStatus};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::store::{Mutation, Records};

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Heartbeat stored.
    Recorded,
    /// No such worker; it must register first.
    UnknownWorker,
    /// The store could not be reached. Try again next tick.
    Deferred,
}

/// Registry of workers in the shared store.
pub struct WorkerRegistry {
    records: Records,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(records: Records, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self {
            records,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a worker with the default concurrency limit.
    pub async fn register(
        &self,
        id: &WorkerId,
        capabilities: CapabilitySet,
    ) -> Result<Worker, CoordError> {
        self.register_with(id, capabilities, None).await
    }

    /// Upsert a worker as a fresh join.
    ///
    /// Status becomes ACTIVE and `current_task`/`claimed_resources` are
    /// cleared. Performance score and outcome counters survive re-registration.
    pub async fn register_with(
        &self,
        id: &WorkerId,
        capabilities: CapabilitySet,
        max_concurrent_tasks: Option<u32>,
    ) -> Result<Worker, CoordError> {
        if id.as_str().trim().is_empty() {
            return Err(CoordError::InvalidInput("worker id must not be empty".into()));
        }

        let now = self.clock.now();
        let limit = max_concurrent_tasks
            .unwrap_or(self.config.default_max_concurrent_tasks)
            .max(1);

        let (worker, rejoined) = self
            .records
            .update::<Worker, _, CoordError, _>(id.as_str(), |current| {
                let rejoined = current.is_some();
                let worker = match current {
                    Some(mut w) => {
                        w.capabilities = capabilities.clone();
                        w.status = WorkerStatus::Active;
                        w.current_task = None;
                        w.claimed_resources.clear();
                        w.last_heartbeat = now;
                        w.max_concurrent_tasks = limit;
                        w
                    }
                    None => Worker::new(id.clone(), capabilities.clone(), limit, now),
                };
                Ok((Mutation::Put(worker.clone()), (worker, rejoined)))
            })
            .await?;

        info!(
            worker_id = %id,
            capabilities = %worker.capabilities,
            max_concurrent_tasks = limit,
            rejoined,
            "Worker registered"
        );
        Ok(worker)
    }

    /// Record a heartbeat.
    ///
    /// Store failures are logged and reported as [`HeartbeatOutcome::Deferred`].
    /// Reporting OFFLINE is a graceful leave.
    pub async fn heartbeat(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        current_task: Option<TaskId>,
    ) -> HeartbeatOutcome {
        let now = self.clock.now();
        let result = self
            .records
            .update::<Worker, _, CoordError, _>(id.as_str(), |current| {
                let Some(mut w) = current else {
                    return Ok((Mutation::Keep, false));
                };
                w.status = status;
                w.current_task = current_task.clone();
                // Heartbeats are never moved backwards.
                if now > w.last_heartbeat {
                    w.last_heartbeat = now;
                }
                Ok((Mutation::Put(w), true))
            })
            .await;

        match result {
            Ok(true) => {
                debug!(worker_id = %id, status = %status, "Heartbeat received");
                HeartbeatOutcome::Recorded
            }
            Ok(false) => {
                warn!(worker_id = %id, "Heartbeat from unknown worker");
                HeartbeatOutcome::UnknownWorker
            }
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Heartbeat not recorded");
                HeartbeatOutcome::Deferred
            }
        }
    }

    /// Mark a worker OFFLINE. Returns false if it was not registered.
    pub async fn deregister(&self, id: &WorkerId) -> Result<bool, CoordError> {
        let known = self
            .records
            .update::<Worker, _, CoordError, _>(id.as_str(), |current| match current {
                Some(mut w) => {
                    w.status = WorkerStatus::Offline;
                    w.current_task = None;
                    Ok((Mutation::Put(w), true))
                }
                None => Ok((Mutation::Keep, false)),
            })
            .await?;

        if known {
            info!(worker_id = %id, "Worker deregistered");
        }
        Ok(known)
    }

    /// Mark every live worker whose heartbeat is older than `timeout` as
    /// OFFLINE. Returns the workers that went offline in this call.
    pub async fn sweep(&self, timeout: Duration) -> Result<Vec<WorkerId>, CoordError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| CoordError::InvalidInput(format!("liveness timeout: {e}")))?;
        let now = self.clock.now();

        let mut offline = Vec::new();
        for entity in self.records.scan::<Worker>().await? {
            let w = entity.value;
            if !w.status.is_live() || w.heartbeat_age(now) <= timeout {
                continue;
            }

            // Re-check inside the update: a heartbeat may have landed since the scan.
            let expired = self
                .records
                .update::<Worker, _, CoordError, _>(w.id.as_str(), |current| match current {
                    Some(mut w) if w.status.is_live() && w.heartbeat_age(now) > timeout => {
                        w.status = WorkerStatus::Offline;
                        w.current_task = None;
                        Ok((Mutation::Put(w), true))
                    }
                    _ => Ok((Mutation::Keep, false)),
                })
                .await?;

            if expired {
                warn!(
                    worker_id = %w.id,
                    last_heartbeat = %w.last_heartbeat,
                    "Worker missed liveness timeout, marking OFFLINE"
                );
                offline.push(w.id);
            }
        }
        Ok(offline)
    }

    pub async fn get(&self, id: &WorkerId) -> Result<Option<Worker>, CoordError> {
        Ok(self
            .records
            .get::<Worker>(id.as_str())
            .await?
            .map(|e| e.value))
    }

    /// All workers, ordered by id.
    pub async fn list(&self) -> Result<Vec<Worker>, CoordError> {
        Ok(self
            .records
            .scan::<Worker>()
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    /// Adjust a worker's performance score after a task finished.
    pub async fn record_outcome(&self, id: &WorkerId, success: bool) -> Result<(), CoordError> {
        let config = &self.config;
        self.records
            .update::<Worker, _, CoordError, _>(id.as_str(), |current| {
                let Some(mut w) = current else {
                    return Ok((Mutation::Keep, ()));
                };
                if success {
                    w.tasks_completed += 1;
                    w.performance_score = (w.performance_score + config.completion_reward)
                        .min(config.max_performance_score);
                } else {
                    w.tasks_failed += 1;
                    w.performance_score = (w.performance_score - config.failure_penalty).max(0.0);
                }
                Ok((Mutation::Put(w), ()))
            })
            .await
    }
}
