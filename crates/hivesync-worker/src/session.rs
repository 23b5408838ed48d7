//! A worker's membership in the fleet.
//!
//! The session registers the worker, keeps its heartbeat fresh, drains its
//! mailbox and pulls tasks up to its concurrency limit. Every task runs as
//! its own future; the store is the only thing shared with other workers.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hivesync_core::{CoordError, Task, TaskId, TaskStatus, WorkerStatus};
use hivesync_engine::backoff::{retry_unavailable, Backoff};
use hivesync_engine::{Coordinator, HeartbeatOutcome};

use crate::config::Config;
use crate::executor::{Executor, ExecutorError};
use crate::json_output::JsonOutput;

/// Attempts per store call before a task is given up on.
const STORE_ATTEMPTS: u32 = 5;

/// Tasks this process is currently running.
#[derive(Default)]
struct Running {
    tasks: Mutex<Vec<TaskId>>,
}

impl Running {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TaskId>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, id: TaskId) {
        self.lock().push(id);
    }

    fn contains(&self, id: &TaskId) -> bool {
        self.lock().contains(id)
    }

    fn finish(&self, id: &TaskId) {
        self.lock().retain(|t| t != id);
    }

    fn len(&self) -> u32 {
        self.lock().len() as u32
    }

    fn first(&self) -> Option<TaskId> {
        self.lock().first().cloned()
    }
}

/// Connection of one worker to the shared store.
#[derive(Clone)]
pub struct WorkerSession {
    coordinator: Arc<Coordinator>,
    config: Arc<Config>,
    executor: Arc<dyn Executor>,
    running: Arc<Running>,
    output: JsonOutput,
}

impl WorkerSession {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config: Arc<Config>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let output = JsonOutput::new(config.json_output);
        Self {
            coordinator,
            config,
            executor,
            running: Arc::new(Running::default()),
            output,
        }
    }

    /// Join the fleet.
    pub async fn register(&self) -> Result<(), CoordError> {
        let worker = self
            .coordinator
            .register_with(
                &self.config.worker_id,
                self.config.capabilities.clone(),
                Some(self.config.max_concurrent_tasks),
            )
            .await?;
        info!(
            worker_id = %worker.id,
            capabilities = worker.capabilities.len(),
            max_concurrent_tasks = worker.max_concurrent_tasks,
            "Registered"
        );
        self.output.worker_registered(&worker.id);
        Ok(())
    }

    /// Register, then poll for work until `cancel` fires.
    ///
    /// Returns an error when registration fails or the store reports a
    /// non-transient error; the caller decides whether to start over.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CoordError> {
        self.register().await?;

        let heartbeat_cancel = cancel.child_token();
        let heartbeat = tokio::spawn({
            let session = self.clone();
            let cancel = heartbeat_cancel.clone();
            async move { session.heartbeat_loop(cancel).await }
        });

        let mut poll = tokio::time::interval(self.config.poll_interval());
        let mut tasks = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Task future ended abnormally");
                    }
                    continue;
                }
                _ = poll.tick() => {}
            }

            match self.poll_once(&mut tasks).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Poll failed, will retry");
                }
                Err(e) => break Err(e),
            }
        };

        heartbeat_cancel.cancel();
        tasks.shutdown().await;
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat loop ended abnormally");
        }

        if cancel.is_cancelled() {
            // Leaving now lets others pick up unfinished tasks at once.
            match self.coordinator.deregister(&self.config.worker_id).await {
                Ok(_) => info!(worker_id = %self.config.worker_id, "Deregistered"),
                Err(e) => warn!(error = %e, "Deregistration failed"),
            }
            self.output.worker_stopped(&self.config.worker_id);
        }
        result
    }

    /// Read the mailbox and start as many tasks as there are free slots.
    ///
    /// Returns the number of tasks started.
    pub async fn poll_once(&self, tasks: &mut JoinSet<()>) -> Result<usize, CoordError> {
        let worker_id = &self.config.worker_id;

        for message in self.coordinator.get_messages(worker_id).await? {
            info!(
                message_id = %message.id,
                from = %message.from,
                kind = %message.kind,
                "Message received"
            );
            self.output.message_received(&message);
        }

        let mut started = 0;

        // Tasks a reconciler handed us, or that an earlier run could not
        // hand back while the store was down.
        for task in self.coordinator.assigned_tasks(worker_id).await? {
            if self.running.len() >= self.config.max_concurrent_tasks {
                break;
            }
            if self.running.contains(&task.id) {
                continue;
            }
            info!(task_id = %task.id, status = %task.status, "Picking up assigned task");
            self.output.task_claimed(&task);
            self.spawn_task(tasks, task);
            started += 1;
        }

        while self.running.len() < self.config.max_concurrent_tasks {
            let Some(task) = self.coordinator.claim_next_task(worker_id).await? else {
                break;
            };
            info!(task_id = %task.id, title = %task.title, "Claimed task");
            self.output.task_claimed(&task);
            self.spawn_task(tasks, task);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_task(&self, tasks: &mut JoinSet<()>, task: Task) {
        self.running.start(task.id.clone());
        let session = self.clone();
        tasks.spawn(async move { session.run_task(task).await });
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.beat().await == HeartbeatOutcome::UnknownWorker {
                warn!("Registration lost, registering again");
                if let Err(e) = self.register().await {
                    warn!(error = %e, "Re-registration failed");
                }
            }
        }
    }

    async fn beat(&self) -> HeartbeatOutcome {
        let active = self.running.len();
        let status = if active >= self.config.max_concurrent_tasks {
            WorkerStatus::Busy
        } else if active > 0 {
            WorkerStatus::Active
        } else {
            WorkerStatus::Idle
        };
        self.coordinator
            .heartbeat(&self.config.worker_id, status, self.running.first())
            .await
    }

    async fn run_task(self, task: Task) {
        if let Err(e) = self.execute(&task).await {
            warn!(task_id = %task.id, error = %e, "Task handling failed, handing it back");
            self.output.error(&e.to_string());
            self.hand_back(&task, &e.to_string()).await;
        }
        self.running.finish(&task.id);
        // Advertise the free slot before the next scheduled heartbeat.
        self.beat().await;
    }

    /// Run a store call, retrying while the store is unavailable.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, CoordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        retry_unavailable(Backoff::default(), STORE_ATTEMPTS, op).await
    }

    /// Best-effort return of a task this worker can no longer run.
    ///
    /// If the store is still down the task stays assigned to us and the next
    /// poll picks it up again.
    async fn hand_back(&self, task: &Task, reason: &str) {
        let coord = &self.coordinator;
        let worker_id = &self.config.worker_id;

        if let Err(e) = self
            .with_retry(|| coord.tasks().requeue_if_owned_by(&task.id, worker_id, reason))
            .await
        {
            warn!(task_id = %task.id, error = %e, "Could not requeue task");
        }
        if !task.resources.is_empty() {
            let resources: Vec<String> = task.resources.iter().cloned().collect();
            if let Err(e) = self
                .with_retry(|| coord.release_resources(worker_id, resources.clone()))
                .await
            {
                warn!(task_id = %task.id, error = %e, "Could not release task resources");
            }
        }
    }

    async fn execute(&self, task: &Task) -> Result<(), CoordError> {
        let coord = &self.coordinator;
        let worker_id = &self.config.worker_id;
        let resources: Vec<String> = task.resources.iter().cloned().collect();

        match self
            .with_retry(|| coord.claim_resources(worker_id, resources.clone()))
            .await
        {
            Ok(()) => {}
            Err(CoordError::ResourceConflict { resource, holder }) => {
                let reason = format!("resource {resource} held by {holder}");
                debug!(task_id = %task.id, reason = %reason, "Handing task back");
                self.with_retry(|| coord.tasks().requeue_if_owned_by(&task.id, worker_id, &reason))
                    .await?;
                self.output.task_deferred(task, &reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.with_retry(|| {
            coord.update_task_progress(worker_id, &task.id, 0, Some(TaskStatus::InProgress))
        })
        .await?;

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let work = self.executor.execute(task, tx);
        let report = async {
            while let Some(progress) = rx.recv().await {
                self.output.task_progress(task, progress);
                if let Err(e) = coord
                    .update_task_progress(worker_id, &task.id, progress, None)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Progress update dropped");
                }
            }
        };
        let (outcome, ()) = tokio::join!(work, report);

        match outcome {
            Ok(()) => {
                self.with_retry(|| {
                    coord.update_task_progress(
                        worker_id,
                        &task.id,
                        100,
                        Some(TaskStatus::Completed),
                    )
                })
                .await?;
                info!(task_id = %task.id, "Task completed");
                self.output.task_completed(task);
            }
            Err(e) => {
                let error = match e {
                    ExecutorError::Failed(msg) => msg,
                    other => other.to_string(),
                };
                self.with_retry(|| {
                    coord.report_task(
                        worker_id,
                        &task.id,
                        0,
                        Some(TaskStatus::Failed),
                        Some(error.clone()),
                    )
                })
                .await?;
                warn!(task_id = %task.id, error = %error, "Task failed");
                self.output.task_failed(task, &error);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use hivesync_core::{CapabilitySet, NewTask, WorkerId};
    use hivesync_engine::store::{MemoryStore, Store, StoreError, Table, Versioned, Write};

    use crate::executor::SimulatedExecutor;

    /// Memory store that can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("switched off".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>, StoreError> {
            self.check()?;
            self.inner.get(table, key).await
        }

        async fn scan(&self, table: Table) -> Result<Vec<Versioned>, StoreError> {
            self.check()?;
            self.inner.scan(table).await
        }

        async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.commit(writes).await
        }
    }

    fn flaky_coordinator() -> (Arc<FlakyStore>, Arc<Coordinator>) {
        let store = Arc::new(FlakyStore::default());
        let coord = Coordinator::builder().store(store.clone()).build().unwrap();
        (store, Arc::new(coord))
    }

    fn session(coord: &Arc<Coordinator>, id: &str, failure_rate: f64) -> WorkerSession {
        let config = Config {
            worker_id: WorkerId::new(id),
            poll_interval_ms: 50,
            ..Default::default()
        };
        let executor = SimulatedExecutor::new(2, Duration::from_millis(10), failure_rate);
        WorkerSession::new(coord.clone(), Arc::new(config), Arc::new(executor))
    }

    async fn drain(tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_task_to_completion() {
        let coord = Arc::new(Coordinator::in_memory().unwrap());
        let session = session(&coord, "w1", 0.0);
        session.register().await.unwrap();

        let task = coord
            .create_task_with(NewTask::new("build").with_resource("a.py"))
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 1);
        // At capacity.
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 0);
        drain(&mut tasks).await;

        let done = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(coord.locks().list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported() {
        let coord = Arc::new(Coordinator::in_memory().unwrap());
        let session = session(&coord, "w1", 1.0);
        session.register().await.unwrap();
        let task = coord.create_task_with(NewTask::new("flaky")).await.unwrap();

        let mut tasks = JoinSet::new();
        session.poll_once(&mut tasks).await.unwrap();
        drain(&mut tasks).await;

        let failed = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_resources_hand_task_back() {
        let coord = Arc::new(Coordinator::in_memory().unwrap());
        let other = WorkerId::new("w0");
        coord.register(&other, CapabilitySet::new()).await.unwrap();
        coord.claim_resources(&other, vec!["db".into()]).await.unwrap();

        let session = session(&coord, "w1", 0.0);
        session.register().await.unwrap();
        let task = coord
            .create_task_with(NewTask::new("migrate").with_resource("db"))
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        session.poll_once(&mut tasks).await.unwrap();
        drain(&mut tasks).await;

        let back = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Queued);
        assert!(back.assigned_to.is_none());
        assert_eq!(
            coord.locks().holder_of("db").await.unwrap(),
            Some(other)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_outage_is_retried() {
        let (store, coord) = flaky_coordinator();
        let session = session(&coord, "w1", 0.0);
        session.register().await.unwrap();
        let task = coord
            .create_task_with(NewTask::new("build").with_resource("a.py"))
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 1);

        // The store drops out before the task has claimed its resources.
        store.set_down(true);
        let restore = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                store.set_down(false);
            }
        });
        drain(&mut tasks).await;
        restore.await.unwrap();

        let done = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(coord.locks().list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stranded_by_outage_is_picked_up_again() {
        let (store, coord) = flaky_coordinator();
        let session = session(&coord, "w1", 0.0);
        session.register().await.unwrap();
        let task = coord
            .create_task_with(NewTask::new("build").with_resource("a.py"))
            .await
            .unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 1);

        // Down for longer than every retry, including the hand-back.
        store.set_down(true);
        drain(&mut tasks).await;
        store.set_down(false);

        let stranded = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stranded.status, TaskStatus::Assigned);
        assert_eq!(stranded.assigned_to, Some(WorkerId::new("w1")));

        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 1);
        drain(&mut tasks).await;

        let done = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(coord.locks().list().await.unwrap().is_empty());
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_tasks_assigned_by_reconciler() {
        let coord = Arc::new(Coordinator::in_memory().unwrap());
        let session = session(&coord, "w1", 0.0);
        session.register().await.unwrap();
        let task = coord.create_task_with(NewTask::new("lint")).await.unwrap();

        let report = hivesync_engine::Reconciler::new(coord.clone()).tick().await;
        assert_eq!(report.assigned.len(), 1);

        let mut tasks = JoinSet::new();
        assert_eq!(session.poll_once(&mut tasks).await.unwrap(), 1);
        drain(&mut tasks).await;

        let done = coord.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deregisters() {
        let coord = Arc::new(Coordinator::in_memory().unwrap());
        let session = session(&coord, "w1", 0.0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let session = session.clone();
            let cancel = cancel.clone();
            async move { session.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let worker = coord.registry().get(&WorkerId::new("w1")).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
    }
}
