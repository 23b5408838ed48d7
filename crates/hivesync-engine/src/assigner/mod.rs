//! Matches queued tasks to workers.
//!
//! [`Assigner::plan`] is a pure function of the workers and tasks it is
//! given: identical inputs always produce identical assignments. Ties go
//! to the lexicographically smaller worker id. [`Assigner::dispatch`]
//! applies a plan through the atomic QUEUED -> ASSIGNED transition, so
//! racing assigners in other processes can never double-assign a task.

mod scoring;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use hivesync_core::{CoordError, Task, TaskId, TaskStatus, Worker, WorkerId};

use crate::config::AssignerConfig;
use crate::registry::WorkerRegistry;
use crate::tasks::TaskStore;

pub use scoring::{Candidate, ScoringStrategy, WeightedScoring};

/// One planned task -> worker pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub score: f64,
}

pub struct Assigner {
    strategy: Arc<dyn ScoringStrategy>,
    require_capabilities: bool,
}

impl Assigner {
    pub fn new(strategy: Arc<dyn ScoringStrategy>, require_capabilities: bool) -> Self {
        Self {
            strategy,
            require_capabilities,
        }
    }

    pub fn from_config(config: &AssignerConfig) -> Self {
        Self::new(
            Arc::new(WeightedScoring::new(config.weights.clone())),
            config.require_capabilities,
        )
    }

    /// Compute assignments for every QUEUED task, most urgent first.
    pub fn plan(&self, workers: &[Worker], tasks: &[Task]) -> Vec<Assignment> {
        let mut candidates = candidates(workers, tasks);

        let mut queued: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .collect();
        queued.sort_by(|a, b| urgency(a, b));

        let mut plan = Vec::new();
        for task in queued {
            let mut best: Option<(usize, f64)> = None;
            for (idx, c) in candidates.iter().enumerate() {
                if !self.is_eligible(task, c) {
                    continue;
                }
                let score = self.strategy.score(task, c);
                // Candidates are sorted by id, so strict `>` keeps the smaller id on ties.
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((idx, score));
                }
            }

            let Some((idx, score)) = best else {
                debug!(task_id = %task.id, "No eligible worker, task stays queued");
                continue;
            };
            let chosen = &mut candidates[idx];
            chosen.take(task);
            plan.push(Assignment {
                task_id: task.id.clone(),
                worker_id: chosen.worker.id.clone(),
                score,
            });
        }
        plan
    }

    /// Plan against the current store contents and apply the plan.
    ///
    /// Tasks another assigner took first are skipped. Returns the
    /// assignments this call made.
    pub async fn dispatch(
        &self,
        registry: &WorkerRegistry,
        tasks: &TaskStore,
    ) -> Result<Vec<Assignment>, CoordError> {
        let workers = registry.list().await?;
        let all_tasks = tasks.list().await?;

        let mut made = Vec::new();
        for assignment in self.plan(&workers, &all_tasks) {
            match tasks.assign(&assignment.task_id, &assignment.worker_id).await {
                Ok(_) => {
                    info!(
                        task_id = %assignment.task_id,
                        worker_id = %assignment.worker_id,
                        score = assignment.score,
                        "Dispatched task"
                    );
                    made.push(assignment);
                }
                Err(CoordError::InvalidTransition { .. }) | Err(CoordError::UnknownTask(_)) => {
                    debug!(task_id = %assignment.task_id, "Task taken by another assigner");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(made)
    }

    /// The most urgent QUEUED task `worker` may take right now, if any.
    pub fn pick_task_for(&self, worker: &WorkerId, workers: &[Worker], tasks: &[Task]) -> Option<TaskId> {
        let candidate = candidates(workers, tasks)
            .into_iter()
            .find(|c| &c.worker.id == worker)?;

        let mut queued: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && self.is_eligible(t, &candidate))
            .collect();
        queued.sort_by(|a, b| urgency(a, b));
        queued.first().map(|t| t.id.clone())
    }

    fn is_eligible(&self, task: &Task, c: &Candidate) -> bool {
        c.has_capacity()
            && (!self.require_capabilities
                || task
                    .required_capabilities
                    .is_satisfied_by(&c.worker.capabilities))
    }
}

/// Workers that may take new tasks, sorted by id, with their current load.
fn candidates(workers: &[Worker], tasks: &[Task]) -> Vec<Candidate> {
    let mut load: HashMap<&WorkerId, u32> = HashMap::new();
    for t in tasks.iter().filter(|t| t.status.is_owned()) {
        if let Some(owner) = &t.assigned_to {
            *load.entry(owner).or_default() += 1;
        }
    }

    let mut out: Vec<Candidate> = workers
        .iter()
        .filter(|w| w.status.can_accept_tasks())
        .map(|w| Candidate::new(w.clone(), load.get(&w.id).copied().unwrap_or(0)))
        .filter(Candidate::has_capacity)
        .collect();
    out.sort_by(|a, b| a.worker.id.cmp(&b.worker.id));
    out
}

/// Priority (lower first), then age, then id.
fn urgency(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringWeights;
    use chrono::{TimeZone, Utc};
    use hivesync_core::{CapabilitySet, NewTask, WorkerStatus};

    fn worker(id: &str, caps: &[&str], limit: u32) -> Worker {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Worker::new(WorkerId::new(id), caps.iter().copied().collect(), limit, at)
    }

    fn queued(id: &str, priority: u32) -> Task {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Task::from_request(
            NewTask::new(id).with_id(id).with_priority(priority),
            TaskStatus::Queued,
            at,
        )
    }

    fn assigner() -> Assigner {
        Assigner::from_config(&AssignerConfig::default())
    }

    #[test]
    fn test_ties_go_to_smaller_worker_id() {
        let workers = vec![worker("w2", &[], 2), worker("w1", &[], 2)];
        let tasks = vec![queued("t1", 1), queued("t2", 1)];

        for _ in 0..3 {
            let plan = assigner().plan(&workers, &tasks);
            assert_eq!(plan.len(), 2);
            assert_eq!(plan[0].task_id, TaskId::new("t1"));
            assert_eq!(plan[0].worker_id, WorkerId::new("w1"));
            // w1 is now loaded, so the next task prefers w2.
            assert_eq!(plan[1].worker_id, WorkerId::new("w2"));
        }
    }

    #[test]
    fn test_identical_inputs_same_worker() {
        // One slot each: both tasks score equally on both workers.
        let workers = vec![worker("b", &[], 1), worker("a", &[], 1)];
        let tasks = vec![queued("t1", 1)];
        let plan = assigner().plan(&workers, &tasks);
        assert_eq!(plan[0].worker_id, WorkerId::new("a"));
    }

    #[test]
    fn test_priority_order_and_capacity() {
        let workers = vec![worker("w1", &[], 1)];
        let tasks = vec![queued("later", 5), queued("urgent", 1)];
        let plan = assigner().plan(&workers, &tasks);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].task_id, TaskId::new("urgent"));
    }

    #[test]
    fn test_busy_and_offline_workers_skipped() {
        let mut busy = worker("w1", &[], 1);
        busy.status = WorkerStatus::Busy;
        let mut gone = worker("w2", &[], 1);
        gone.status = WorkerStatus::Offline;

        let plan = assigner().plan(&[busy, gone], &[queued("t1", 1)]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_capability_preference_and_requirement() {
        let workers = vec![worker("a", &[], 1), worker("b", &["gpu"], 1)];
        let mut task = queued("t1", 1);
        task.required_capabilities = ["gpu"].into_iter().collect::<CapabilitySet>();

        let plan = assigner().plan(&workers, std::slice::from_ref(&task));
        assert_eq!(plan[0].worker_id, WorkerId::new("b"));

        let strict = Assigner::from_config(&AssignerConfig {
            require_capabilities: true,
            ..Default::default()
        });
        let plan = strict.plan(&workers[..1], std::slice::from_ref(&task));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_existing_load_counts() {
        let workers = vec![worker("a", &[], 1), worker("b", &[], 1)];
        let mut running = queued("running", 1);
        running.assign(WorkerId::new("a"));

        let plan = assigner().plan(&workers, &[running, queued("t1", 2)]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].worker_id, WorkerId::new("b"));
    }

    #[test]
    fn test_custom_strategy() {
        struct PreferLast;
        impl ScoringStrategy for PreferLast {
            fn score(&self, _task: &Task, c: &Candidate) -> f64 {
                if c.worker.id.as_str() == "z" {
                    1.0
                } else {
                    0.0
                }
            }
        }

        let assigner = Assigner::new(Arc::new(PreferLast), false);
        let workers = vec![worker("a", &[], 1), worker("z", &[], 1)];
        let plan = assigner.plan(&workers, &[queued("t1", 1)]);
        assert_eq!(plan[0].worker_id, WorkerId::new("z"));

        let weighted = WeightedScoring::new(ScoringWeights::default());
        assert_eq!(weighted.weights().workload, 40.0);
    }

    #[test]
    fn test_pick_task_for_worker() {
        let workers = vec![worker("w1", &[], 1)];
        let tasks = vec![queued("t2", 3), queued("t1", 1)];
        let picked = assigner().pick_task_for(&WorkerId::new("w1"), &workers, &tasks);
        assert_eq!(picked, Some(TaskId::new("t1")));
        assert_eq!(
            assigner().pick_task_for(&WorkerId::new("ghost"), &workers, &tasks),
            None
        );
    }
}
