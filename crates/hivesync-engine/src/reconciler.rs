//! The reconciliation loop.
//!
//! Each tick runs sweep -> unblock -> reassign orphans -> dispatch -> lock
//! GC against the shared store. Every step is isolated: a failing step is
//! logged and recorded in the [`TickReport`], and the remaining steps still
//! run. Ticks are idempotent, so any number of processes may run a
//! reconciler at the same time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hivesync_core::{CoordError, CoordEvent, TaskId, TaskStatus, WorkerId, WorkerStatus};

use crate::assigner::Assignment;
use crate::backoff::Backoff;
use crate::config::ReconcilerConfig;
use crate::coordinator::Coordinator;

/// The steps of one tick, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    HeartbeatSweep,
    UnblockTasks,
    ReassignOrphans,
    Dispatch,
    LockGc,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::HeartbeatSweep => "heartbeat-sweep",
            Step::UnblockTasks => "unblock-tasks",
            Step::ReassignOrphans => "reassign-orphans",
            Step::Dispatch => "dispatch",
            Step::LockGc => "lock-gc",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that failed during a tick.
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub error: CoordError,
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub offline: Vec<WorkerId>,
    pub unblocked: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub assigned: Vec<Assignment>,
    pub locks_collected: usize,
    pub failures: Vec<StepFailure>,
}

impl TickReport {
    /// True if the tick changed any shared state.
    pub fn did_work(&self) -> bool {
        !self.offline.is_empty()
            || !self.unblocked.is_empty()
            || !self.requeued.is_empty()
            || !self.assigned.is_empty()
            || self.locks_collected > 0
    }

    /// True if every step succeeded.
    pub fn is_healthy(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Reconciler {
    coordinator: Arc<Coordinator>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let config = coordinator.config().reconciler.clone();
        Self {
            coordinator,
            config,
        }
    }

    pub fn with_config(coordinator: Arc<Coordinator>, config: ReconcilerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.sweep().await {
            Ok(offline) => report.offline = offline,
            Err(e) => record_failure(&mut report, Step::HeartbeatSweep, e),
        }
        match self.coordinator.tasks().unblock().await {
            Ok(unblocked) => report.unblocked = unblocked,
            Err(e) => record_failure(&mut report, Step::UnblockTasks, e),
        }
        match self.reassign_orphans().await {
            Ok(requeued) => report.requeued = requeued,
            Err(e) => record_failure(&mut report, Step::ReassignOrphans, e),
        }
        match self.dispatch().await {
            Ok(assigned) => report.assigned = assigned,
            Err(e) => record_failure(&mut report, Step::Dispatch, e),
        }
        match self.coordinator.locks().collect_garbage().await {
            Ok(n) => report.locks_collected = n,
            Err(e) => record_failure(&mut report, Step::LockGc, e),
        }

        if report.did_work() {
            info!(
                offline = report.offline.len(),
                unblocked = report.unblocked.len(),
                requeued = report.requeued.len(),
                assigned = report.assigned.len(),
                locks_collected = report.locks_collected,
                failures = report.failures.len(),
                "Reconciliation tick"
            );
        } else {
            debug!(failures = report.failures.len(), "Reconciliation tick, nothing to do");
        }
        report
    }

    /// Tick until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval_ms,
            adaptive = self.config.adaptive,
            "Reconciler started"
        );

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_initial_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );
        let mut interval = self.config.interval();

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.tick() => report,
            };

            let sleep_for = if report.is_healthy() {
                backoff.reset();
                interval = next_interval(&self.config, interval, report.did_work());
                interval
            } else {
                let delay = backoff.next_delay();
                warn!(
                    failures = report.failures.len(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconciliation tick had failures, backing off"
                );
                delay
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("Reconciler stopped");
    }

    async fn sweep(&self) -> Result<Vec<WorkerId>, CoordError> {
        let registry = self.coordinator.registry();
        let offline = registry.sweep(registry.config().liveness_timeout()).await?;
        for worker_id in &offline {
            self.coordinator.notifier().notify(CoordEvent::WorkerOffline {
                worker_id: worker_id.clone(),
            });
        }
        Ok(offline)
    }

    /// Requeue ASSIGNED/IN_PROGRESS tasks whose owner is OFFLINE or gone,
    /// releasing the owner's locks on the task's resources first.
    async fn reassign_orphans(&self) -> Result<Vec<TaskId>, CoordError> {
        let coord = &self.coordinator;
        let statuses: HashMap<WorkerId, WorkerStatus> = coord
            .registry()
            .list()
            .await?
            .into_iter()
            .map(|w| (w.id, w.status))
            .collect();

        let mut requeued = Vec::new();
        for task in coord.tasks().list().await? {
            if task.status == TaskStatus::Failed && self.config.requeue_failed {
                if coord.tasks().requeue(&task.id, "retrying failed task").await? {
                    self.notify_queued(&task.id);
                    requeued.push(task.id);
                }
                continue;
            }

            let Some(owner) = task.assigned_to.as_ref().filter(|_| task.status.is_owned()) else {
                continue;
            };
            let owner_alive = matches!(statuses.get(owner), Some(s) if s.is_live());
            if owner_alive {
                continue;
            }

            coord
                .locks()
                .release(owner, task.resources.iter().cloned())
                .await?;
            if coord
                .tasks()
                .requeue_if_owned_by(&task.id, owner, "owner went offline")
                .await?
            {
                warn!(task_id = %task.id, worker_id = %owner, "Reassigning orphaned task");
                self.notify_queued(&task.id);
                requeued.push(task.id);
            }
        }
        Ok(requeued)
    }

    async fn dispatch(&self) -> Result<Vec<Assignment>, CoordError> {
        let coord = &self.coordinator;
        let assigned = coord
            .assigner()
            .dispatch(coord.registry(), coord.tasks())
            .await?;
        for a in &assigned {
            coord.notifier().notify(CoordEvent::TaskStatusChanged {
                task_id: a.task_id.clone(),
                status: TaskStatus::Assigned,
                worker_id: Some(a.worker_id.clone()),
            });
        }
        Ok(assigned)
    }

    fn notify_queued(&self, task_id: &TaskId) {
        self.coordinator
            .notifier()
            .notify(CoordEvent::TaskStatusChanged {
                task_id: task_id.clone(),
                status: TaskStatus::Queued,
                worker_id: None,
            });
    }
}

fn record_failure(report: &mut TickReport, step: Step, error: CoordError) {
    error!(step = %step, error = %error, "Reconciliation step failed");
    report.failures.push(StepFailure { step, error });
}

/// Sleep before the next tick: shorter after a busy tick, longer after an
/// idle one, clamped to the configured bounds.
pub fn next_interval(config: &ReconcilerConfig, current: Duration, did_work: bool) -> Duration {
    if !config.adaptive {
        return config.interval();
    }
    let next = if did_work {
        current / 2
    } else {
        current.mul_f64(1.5)
    };
    next.clamp(config.min_interval(), config.max_interval())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use hivesync_core::CapabilitySet;

    fn setup() -> (Arc<Coordinator>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let coord = Coordinator::builder()
            .store(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .build()
            .unwrap();
        (Arc::new(coord), clock)
    }

    #[test]
    fn test_adaptive_interval_bounds() {
        let config = ReconcilerConfig::default();
        let mut interval = config.interval();
        for _ in 0..10 {
            interval = next_interval(&config, interval, true);
        }
        assert_eq!(interval, config.min_interval());

        for _ in 0..20 {
            interval = next_interval(&config, interval, false);
        }
        assert_eq!(interval, config.max_interval());

        let fixed = ReconcilerConfig {
            adaptive: false,
            ..Default::default()
        };
        assert_eq!(next_interval(&fixed, Duration::from_secs(1), true), fixed.interval());
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let (coord, _) = setup();
        coord
            .register(&WorkerId::new("w1"), CapabilitySet::new())
            .await
            .unwrap();
        coord.create_task("T1", "", 1, vec![], vec![]).await.unwrap();

        let reconciler = Reconciler::new(coord.clone());
        let first = reconciler.tick().await;
        assert!(first.is_healthy());
        assert_eq!(first.assigned.len(), 1);

        let second = reconciler.tick().await;
        assert!(second.is_healthy());
        assert!(!second.did_work());
    }

    #[tokio::test]
    async fn test_offline_owner_task_requeued_and_locks_freed() {
        let (coord, clock) = setup();
        let w1 = WorkerId::new("w1");
        coord.register(&w1, CapabilitySet::new()).await.unwrap();
        let id = coord
            .create_task("T3", "", 1, vec![], vec!["a.py".into()])
            .await
            .unwrap();
        coord.claim_next_task(&w1).await.unwrap();
        coord.claim_resources(&w1, vec!["a.py".into(), "b.py".into()]).await.unwrap();

        clock.advance(coord.config().registry.liveness_timeout() + Duration::from_secs(1));
        let report = Reconciler::new(coord.clone()).tick().await;

        assert_eq!(report.offline, vec![w1.clone()]);
        assert_eq!(report.requeued, vec![id.clone()]);
        // b.py was not part of the task; lock GC picks it up in the same tick.
        assert_eq!(report.locks_collected, 1);
        assert!(coord.locks().list().await.unwrap().is_empty());

        let task = coord.tasks().get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_requeue_failed_is_opt_in() {
        let (coord, _) = setup();
        let w1 = WorkerId::new("w1");
        coord.register(&w1, CapabilitySet::new()).await.unwrap();
        let id = coord.create_task("T1", "", 1, vec![], vec![]).await.unwrap();
        coord.claim_next_task(&w1).await.unwrap();
        coord
            .update_task_progress(&w1, &id, 0, Some(TaskStatus::InProgress))
            .await
            .unwrap();
        coord
            .update_task_progress(&w1, &id, 0, Some(TaskStatus::Failed))
            .await
            .unwrap();

        let report = Reconciler::new(coord.clone()).tick().await;
        assert!(report.requeued.is_empty());

        let config = ReconcilerConfig {
            requeue_failed: true,
            ..Default::default()
        };
        let report = Reconciler::with_config(coord.clone(), config).tick().await;
        assert_eq!(report.requeued, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (coord, _) = setup();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Reconciler::new(coord).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
