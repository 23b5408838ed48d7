//! Per-process coordination context.
//!
//! A [`Coordinator`] wires the store and every component together and
//! exposes the worker-facing API. Build one per process and share it via
//! `Arc`; all cross-process state lives in the store.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use hivesync_core::{
    CapabilitySet, CoordError, CoordEvent, Message, MessageId, NewTask, Recipient, Snapshot,
    Stats, Task, TaskId, TaskStatus, Worker, WorkerId, WorkerStatus,
};

use crate::assigner::{Assigner, ScoringStrategy};
use crate::bus::MessageBus;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::locks::LockManager;
use crate::notify::Notifier;
use crate::registry::{HeartbeatOutcome, WorkerRegistry};
use crate::store::{self, Records, Store};
use crate::tasks::TaskStore;

/// Priority given to messages sent without one.
pub const DEFAULT_MESSAGE_PRIORITY: u32 = 5;

/// Builder for [`Coordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    strategy: Option<Arc<dyn ScoringStrategy>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use an already opened store instead of opening `config.store`.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scoring(mut self, strategy: Arc<dyn ScoringStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> Result<Coordinator, CoordError> {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => store::open(&config.store)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let assigner = match self.strategy {
            Some(strategy) => Assigner::new(strategy, config.assigner.require_capabilities),
            None => Assigner::from_config(&config.assigner),
        };

        let records = Records::new(store, config.store.max_cas_retries);
        info!(backend = records.store().backend(), "Coordinator ready");

        Ok(Coordinator {
            registry: WorkerRegistry::new(records.clone(), clock.clone(), config.registry.clone()),
            tasks: TaskStore::new(records.clone(), clock.clone()),
            locks: LockManager::new(records.clone(), clock.clone()),
            bus: MessageBus::new(records.clone(), clock.clone()),
            assigner,
            notifier: Notifier::new(),
            records,
            clock,
            config,
        })
    }
}

/// Shared coordination context.
pub struct Coordinator {
    records: Records,
    clock: Arc<dyn Clock>,
    config: Config,
    registry: WorkerRegistry,
    tasks: TaskStore,
    locks: LockManager,
    bus: MessageBus,
    assigner: Assigner,
    notifier: Notifier,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Coordinator over a fresh in-memory store with default config.
    pub fn in_memory() -> Result<Self, CoordError> {
        Self::builder()
            .store(Arc::new(store::MemoryStore::new()))
            .build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.records.store()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn assigner(&self) -> &Assigner {
        &self.assigner
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Receive coordination events published by this process.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.notifier.subscribe()
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: CapabilitySet,
    ) -> Result<Worker, CoordError> {
        self.register_with(worker_id, capabilities, None).await
    }

    /// Join (or re-join) the fleet.
    ///
    /// Re-registration is a fresh join: locks and tasks left over from the
    /// worker's previous life are released and requeued.
    pub async fn register_with(
        &self,
        worker_id: &WorkerId,
        capabilities: CapabilitySet,
        max_concurrent_tasks: Option<u32>,
    ) -> Result<Worker, CoordError> {
        let worker = self
            .registry
            .register_with(worker_id, capabilities, max_concurrent_tasks)
            .await?;
        self.reclaim_from(worker_id, "worker re-registered").await?;

        self.notifier.notify(CoordEvent::WorkerRegistered {
            worker_id: worker_id.clone(),
        });
        Ok(worker)
    }

    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
        current_task: Option<TaskId>,
    ) -> HeartbeatOutcome {
        let outcome = self.registry.heartbeat(worker_id, status, current_task).await;
        if outcome == HeartbeatOutcome::Recorded {
            self.notifier.notify(CoordEvent::WorkerStatusChanged {
                worker_id: worker_id.clone(),
                status,
            });
        }
        outcome
    }

    /// Leave the fleet now instead of waiting for the liveness timeout.
    pub async fn deregister(&self, worker_id: &WorkerId) -> Result<bool, CoordError> {
        if !self.registry.deregister(worker_id).await? {
            return Ok(false);
        }
        self.reclaim_from(worker_id, "worker left").await?;
        self.notifier.notify(CoordEvent::WorkerOffline {
            worker_id: worker_id.clone(),
        });
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn create_task(
        &self,
        title: &str,
        description: &str,
        priority: u32,
        dependencies: Vec<TaskId>,
        resources: Vec<String>,
    ) -> Result<TaskId, CoordError> {
        let task = self
            .create_task_with(NewTask {
                title: title.to_string(),
                description: description.to_string(),
                priority,
                dependencies: dependencies.into_iter().collect(),
                resources: resources.into_iter().collect(),
                ..Default::default()
            })
            .await?;
        Ok(task.id)
    }

    pub async fn create_task_with(&self, req: NewTask) -> Result<Task, CoordError> {
        let task = self.tasks.create_with(req).await?;
        self.notifier.notify(CoordEvent::TaskCreated {
            task_id: task.id.clone(),
            status: task.status,
        });
        Ok(task)
    }

    /// Report progress on an owned task, optionally moving its status.
    pub async fn update_task_progress(
        &self,
        worker_id: &WorkerId,
        task_id: &TaskId,
        progress: u8,
        status: Option<TaskStatus>,
    ) -> Result<Task, CoordError> {
        self.report_task(worker_id, task_id, progress, status, None)
            .await
    }

    /// Like [`update_task_progress`](Self::update_task_progress), with an
    /// error message recorded on failure.
    ///
    /// Finishing a task releases the task's resources held by the worker
    /// and adjusts its performance score.
    pub async fn report_task(
        &self,
        worker_id: &WorkerId,
        task_id: &TaskId,
        progress: u8,
        status: Option<TaskStatus>,
        error: Option<String>,
    ) -> Result<Task, CoordError> {
        let reported = self
            .tasks
            .report(task_id, worker_id, progress, status, error)
            .await?;
        let task = reported.task;

        if task.is_terminal() {
            let released = self.locks.release(worker_id, task.resources.iter().cloned()).await?;
            if !released.is_empty() {
                self.notifier.notify(CoordEvent::ResourcesReleased {
                    worker_id: worker_id.clone(),
                    resources: released,
                });
            }
        }

        if reported.transitioned {
            if task.is_terminal() {
                let success = task.status == TaskStatus::Completed;
                if let Err(e) = self.registry.record_outcome(worker_id, success).await {
                    warn!(worker_id = %worker_id, error = %e, "Failed to update performance score");
                }
            }
            self.notifier.notify(CoordEvent::TaskStatusChanged {
                task_id: task.id.clone(),
                status: task.status,
                worker_id: Some(worker_id.clone()),
            });
        }
        Ok(task)
    }

    /// Tasks currently ASSIGNED or IN_PROGRESS for `worker_id`, most urgent first.
    pub async fn assigned_tasks(&self, worker_id: &WorkerId) -> Result<Vec<Task>, CoordError> {
        let mut owned: Vec<Task> = self
            .tasks
            .list()
            .await?
            .into_iter()
            .filter(|t| t.is_owned_by(worker_id))
            .collect();
        owned.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(owned)
    }

    /// Pull the most urgent task this worker may take and assign it.
    ///
    /// Returns `None` when nothing is eligible or the worker is at capacity.
    pub async fn claim_next_task(&self, worker_id: &WorkerId) -> Result<Option<Task>, CoordError> {
        if self.registry.get(worker_id).await?.is_none() {
            return Err(CoordError::UnknownWorker(worker_id.clone()));
        }

        for _ in 0..self.records.max_retries() {
            let workers = self.registry.list().await?;
            let tasks = self.tasks.list().await?;
            let Some(task_id) = self.assigner.pick_task_for(worker_id, &workers, &tasks) else {
                return Ok(None);
            };

            match self.tasks.assign(&task_id, worker_id).await {
                Ok(task) => {
                    self.notifier.notify(CoordEvent::TaskStatusChanged {
                        task_id: task.id.clone(),
                        status: task.status,
                        worker_id: Some(worker_id.clone()),
                    });
                    return Ok(Some(task));
                }
                // Someone else took it; look again.
                Err(CoordError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Operator re-queue of a FAILED or stuck task.
    pub async fn retry_task(&self, task_id: &TaskId) -> Result<bool, CoordError> {
        let requeued = self.tasks.requeue(task_id, "retried by operator").await?;
        if requeued {
            self.notifier.notify(CoordEvent::TaskStatusChanged {
                task_id: task_id.clone(),
                status: TaskStatus::Queued,
                worker_id: None,
            });
        }
        Ok(requeued)
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub async fn claim_resources(
        &self,
        worker_id: &WorkerId,
        resources: Vec<String>,
    ) -> Result<(), CoordError> {
        let taken = self.locks.claim(worker_id, resources).await?;
        if !taken.is_empty() {
            self.notifier.notify(CoordEvent::ResourcesClaimed {
                worker_id: worker_id.clone(),
                resources: taken,
            });
        }
        Ok(())
    }

    pub async fn release_resources(
        &self,
        worker_id: &WorkerId,
        resources: Vec<String>,
    ) -> Result<(), CoordError> {
        let released = self.locks.release(worker_id, resources).await?;
        if !released.is_empty() {
            self.notifier.notify(CoordEvent::ResourcesReleased {
                worker_id: worker_id.clone(),
                resources: released,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        from: &str,
        to: Recipient,
        kind: &str,
        payload: serde_json::Value,
        priority: Option<u32>,
    ) -> Result<MessageId, CoordError> {
        let msg = self
            .bus
            .send(
                from,
                to,
                kind,
                payload,
                priority.unwrap_or(DEFAULT_MESSAGE_PRIORITY),
            )
            .await?;
        self.notifier.notify(CoordEvent::MessageSent {
            message_id: msg.id.clone(),
            to: msg.to.clone(),
        });
        Ok(msg.id)
    }

    pub async fn get_messages(&self, worker_id: &WorkerId) -> Result<Vec<Message>, CoordError> {
        self.bus.get_messages(worker_id).await
    }

    /// Audit view: the `limit` most recent messages, delivered or not.
    pub async fn message_history(&self, limit: usize) -> Result<Vec<Message>, CoordError> {
        self.bus.history(limit).await
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Read-only view of the whole fleet.
    pub async fn get_snapshot(&self) -> Result<Snapshot, CoordError> {
        let workers = self.registry.list().await?;
        let tasks = self.tasks.list().await?;
        let locks = self.locks.list().await?;
        let counts = self.bus.counts().await?;

        let mut stats = Stats::tally(&workers, &tasks, &locks);
        stats.messages_total = counts.total;
        stats.messages_undelivered = counts.undelivered;

        Ok(Snapshot {
            taken_at: self.clock.now(),
            workers,
            tasks,
            locks,
            stats,
        })
    }

    /// Release every lock of `worker_id` and requeue every task it still owns.
    pub(crate) async fn reclaim_from(
        &self,
        worker_id: &WorkerId,
        reason: &str,
    ) -> Result<Vec<TaskId>, CoordError> {
        let released = self.locks.release_all(worker_id).await?;
        if !released.is_empty() {
            self.notifier.notify(CoordEvent::ResourcesReleased {
                worker_id: worker_id.clone(),
                resources: released,
            });
        }

        let mut requeued = Vec::new();
        for task in self.tasks.list().await? {
            if task.is_owned_by(worker_id)
                && self
                    .tasks
                    .requeue_if_owned_by(&task.id, worker_id, reason)
                    .await?
            {
                self.notifier.notify(CoordEvent::TaskStatusChanged {
                    task_id: task.id.clone(),
                    status: TaskStatus::Queued,
                    worker_id: None,
                });
                requeued.push(task.id);
            }
        }
        Ok(requeued)
    }
}
