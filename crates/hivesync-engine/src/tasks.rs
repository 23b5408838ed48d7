//! Task records, the dependency graph and the task state machine.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use hivesync_core::{CoordError, NewTask, Task, TaskId, TaskStatus, WorkerId};

use crate::clock::Clock;
use crate::store::{Mutation, Records, StoreError};

/// Result of a progress report.
#[derive(Debug, Clone)]
pub struct Reported {
    pub task: Task,
    /// True if the report moved the task to a new status.
    pub transitioned: bool,
}

/// Task operations against the shared store.
pub struct TaskStore {
    records: Records,
    clock: Arc<dyn Clock>,
}

impl TaskStore {
    pub fn new(records: Records, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    /// Create a task with a generated id.
    pub async fn create(
        &self,
        title: &str,
        description: &str,
        priority: u32,
        dependencies: impl IntoIterator<Item = TaskId>,
        resources: impl IntoIterator<Item = String>,
    ) -> Result<Task, CoordError> {
        let req = NewTask {
            title: title.to_string(),
            description: description.to_string(),
            priority,
            dependencies: dependencies.into_iter().collect(),
            resources: resources.into_iter().collect(),
            ..Default::default()
        };
        self.create_with(req).await
    }

    /// Create a task from a full request.
    ///
    /// Dependencies may name tasks that do not exist yet; the task then stays
    /// BLOCKED until they are created and completed.
    pub async fn create_with(&self, req: NewTask) -> Result<Task, CoordError> {
        if req.title.trim().is_empty() {
            return Err(CoordError::InvalidInput("task title must not be empty".into()));
        }
        if req.resources.iter().any(|r| r.trim().is_empty()) {
            return Err(CoordError::InvalidInput("resource keys must not be empty".into()));
        }
        let id = req.id.clone().unwrap_or_else(TaskId::generate);

        let existing = self.list().await?;
        if existing.iter().any(|t| t.id == id) {
            return Err(CoordError::InvalidInput(format!("task {id} already exists")));
        }

        let mut graph: HashMap<TaskId, BTreeSet<TaskId>> = existing
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();
        graph.insert(id.clone(), req.dependencies.clone());
        if let Some(cycle) = find_cycle(&graph, &id) {
            return Err(CoordError::DependencyCycle { cycle });
        }

        let completed: HashSet<&TaskId> = existing
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| &t.id)
            .collect();
        let status = if req.dependencies.iter().all(|d| completed.contains(d)) {
            TaskStatus::Queued
        } else {
            TaskStatus::Blocked
        };

        let task = Task::from_request(
            NewTask {
                id: Some(id.clone()),
                ..req
            },
            status,
            self.clock.now(),
        );

        match self.records.insert(&task).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(CoordError::InvalidInput(format!("task {id} already exists")));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            task_id = %task.id,
            status = %task.status,
            priority = task.priority,
            dependencies = task.dependencies.len(),
            "Task created"
        );
        Ok(task)
    }

    /// Move every BLOCKED task whose dependencies are all COMPLETED to QUEUED.
    pub async fn unblock(&self) -> Result<Vec<TaskId>, CoordError> {
        let tasks = self.list().await?;
        let completed: HashSet<&TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| &t.id)
            .collect();

        let mut unblocked = Vec::new();
        for task in &tasks {
            if task.status != TaskStatus::Blocked
                || !task.dependencies.iter().all(|d| completed.contains(d))
            {
                continue;
            }

            let moved = self
                .records
                .update::<Task, _, CoordError, _>(task.id.as_str(), |current| match current {
                    Some(mut t) if t.status == TaskStatus::Blocked => {
                        t.status = TaskStatus::Queued;
                        Ok((Mutation::Put(t), true))
                    }
                    _ => Ok((Mutation::Keep, false)),
                })
                .await?;

            if moved {
                info!(task_id = %task.id, "Dependencies completed, task queued");
                unblocked.push(task.id.clone());
            }
        }
        Ok(unblocked)
    }

    /// Take one edge of the state machine.
    ///
    /// QUEUED -> ASSIGNED needs an owner and goes through [`assign`](Self::assign).
    pub async fn transition(&self, id: &TaskId, to: TaskStatus) -> Result<Task, CoordError> {
        if to == TaskStatus::Assigned {
            return Err(CoordError::InvalidInput(
                "assigning a task requires a worker; use assign".into(),
            ));
        }
        if to == TaskStatus::InProgress {
            self.check_dependencies(id).await?;
        }

        let now = self.clock.now();
        let task = self
            .records
            .update::<Task, _, CoordError, _>(id.as_str(), |current| {
                let mut t = current.ok_or_else(|| CoordError::UnknownTask(id.clone()))?;
                if !t.status.can_transition_to(to) {
                    return Err(CoordError::InvalidTransition {
                        task: id.clone(),
                        from: t.status,
                        to,
                    });
                }
                apply_status(&mut t, to, now, None);
                Ok((Mutation::Put(t.clone()), t))
            })
            .await?;

        debug!(task_id = %id, status = %to, "Task transitioned");
        Ok(task)
    }

    /// Atomically move a QUEUED task to ASSIGNED with an owner.
    ///
    /// When two callers race, exactly one wins; the other sees
    /// [`CoordError::InvalidTransition`].
    pub async fn assign(&self, id: &TaskId, worker: &WorkerId) -> Result<Task, CoordError> {
        let task = self
            .records
            .update::<Task, _, CoordError, _>(id.as_str(), |current| {
                let mut t = current.ok_or_else(|| CoordError::UnknownTask(id.clone()))?;
                if t.status != TaskStatus::Queued {
                    return Err(CoordError::InvalidTransition {
                        task: id.clone(),
                        from: t.status,
                        to: TaskStatus::Assigned,
                    });
                }
                t.assign(worker.clone());
                Ok((Mutation::Put(t.clone()), t))
            })
            .await?;

        info!(task_id = %id, worker_id = %worker, "Task assigned");
        Ok(task)
    }

    /// Put an ASSIGNED, IN_PROGRESS or FAILED task back in the queue.
    ///
    /// Returns false if the task was already QUEUED.
    pub async fn requeue(&self, id: &TaskId, reason: &str) -> Result<bool, CoordError> {
        let requeued = self
            .records
            .update::<Task, _, CoordError, _>(id.as_str(), |current| {
                let mut t = current.ok_or_else(|| CoordError::UnknownTask(id.clone()))?;
                match t.status {
                    TaskStatus::Queued => Ok((Mutation::Keep, false)),
                    TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Failed => {
                        t.requeue(reason);
                        Ok((Mutation::Put(t), true))
                    }
                    from => Err(CoordError::InvalidTransition {
                        task: id.clone(),
                        from,
                        to: TaskStatus::Queued,
                    }),
                }
            })
            .await?;

        if requeued {
            info!(task_id = %id, reason = %reason, "Task requeued");
        }
        Ok(requeued)
    }

    /// Requeue a task only while `worker` still owns it.
    pub async fn requeue_if_owned_by(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        reason: &str,
    ) -> Result<bool, CoordError> {
        let requeued = self
            .records
            .update::<Task, _, CoordError, _>(id.as_str(), |current| match current {
                Some(mut t) if t.is_owned_by(worker) => {
                    t.requeue(reason);
                    Ok((Mutation::Put(t), true))
                }
                _ => Ok((Mutation::Keep, false)),
            })
            .await?;

        if requeued {
            info!(task_id = %id, worker_id = %worker, reason = %reason, "Task requeued");
        }
        Ok(requeued)
    }

    /// Apply a progress report from the task's owner.
    ///
    /// `status` may move the task along its state machine; repeating the
    /// current status only updates progress.
    pub async fn report(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        progress: u8,
        status: Option<TaskStatus>,
        error: Option<String>,
    ) -> Result<Reported, CoordError> {
        if progress > 100 {
            return Err(CoordError::InvalidInput(format!(
                "progress must be 0-100, got {progress}"
            )));
        }
        if status == Some(TaskStatus::InProgress) {
            self.check_dependencies(id).await?;
        }

        let now = self.clock.now();
        let reported = self
            .records
            .update::<Task, _, CoordError, _>(id.as_str(), |current| {
                let mut t = current.ok_or_else(|| CoordError::UnknownTask(id.clone()))?;
                let not_owner = || CoordError::NotOwner {
                    worker: worker.clone(),
                    task: id.clone(),
                };
                if t.assigned_to.as_ref() != Some(worker) {
                    return Err(not_owner());
                }

                let target = status.unwrap_or(t.status);
                if !t.status.is_owned() {
                    // Finished tasks accept only a repeat of their final report.
                    return if status == Some(t.status) {
                        Ok((Mutation::Keep, Reported { task: t, transitioned: false }))
                    } else {
                        Err(not_owner())
                    };
                }

                let transitioned = target != t.status;
                if transitioned {
                    if target == TaskStatus::Assigned || !t.status.can_transition_to(target) {
                        return Err(CoordError::InvalidTransition {
                            task: id.clone(),
                            from: t.status,
                            to: target,
                        });
                    }
                    apply_status(&mut t, target, now, error.clone());
                }
                if t.status != TaskStatus::Completed {
                    t.progress = progress;
                }
                Ok((
                    Mutation::Put(t.clone()),
                    Reported {
                        task: t,
                        transitioned,
                    },
                ))
            })
            .await?;

        if reported.transitioned {
            info!(
                task_id = %id,
                worker_id = %worker,
                status = %reported.task.status,
                "Task status reported"
            );
        } else {
            debug!(task_id = %id, worker_id = %worker, progress, "Task progress reported");
        }
        Ok(reported)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>, CoordError> {
        Ok(self.records.get::<Task>(id.as_str()).await?.map(|e| e.value))
    }

    /// All tasks, ordered by id.
    pub async fn list(&self) -> Result<Vec<Task>, CoordError> {
        Ok(self
            .records
            .scan::<Task>()
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    /// Fail unless every dependency of `id` is COMPLETED.
    ///
    /// Completion is final, so a passing check stays valid for the update
    /// that follows it.
    async fn check_dependencies(&self, id: &TaskId) -> Result<(), CoordError> {
        let task = self
            .get(id)
            .await?
            .ok_or_else(|| CoordError::UnknownTask(id.clone()))?;

        for dep in &task.dependencies {
            let done = matches!(
                self.get(dep).await?,
                Some(d) if d.status == TaskStatus::Completed
            );
            if !done {
                return Err(CoordError::InvalidTransition {
                    task: id.clone(),
                    from: task.status,
                    to: TaskStatus::InProgress,
                });
            }
        }
        Ok(())
    }
}

fn apply_status(
    task: &mut Task,
    to: TaskStatus,
    now: chrono::DateTime<chrono::Utc>,
    error: Option<String>,
) {
    match to {
        TaskStatus::InProgress => task.start(now),
        TaskStatus::Completed => task.complete(now),
        TaskStatus::Failed => task.fail(now, error),
        other => task.status = other,
    }
}

/// Depth-first search from `start` along dependency edges. Returns the
/// cycle as a path `start -> ... -> start` if one exists.
fn find_cycle(graph: &HashMap<TaskId, BTreeSet<TaskId>>, start: &TaskId) -> Option<Vec<TaskId>> {
    fn visit<'a>(
        graph: &'a HashMap<TaskId, BTreeSet<TaskId>>,
        node: &'a TaskId,
        target: &TaskId,
        visited: &mut HashSet<&'a TaskId>,
        path: &mut Vec<TaskId>,
    ) -> bool {
        let Some(deps) = graph.get(node) else {
            return false;
        };
        for dep in deps {
            if dep == target {
                path.push(dep.clone());
                return true;
            }
            if visited.insert(dep) {
                path.push(dep.clone());
                if visit(graph, dep, target, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut visited = HashSet::from([start]);
    let mut path = vec![start.clone()];
    visit(graph, start, start, &mut visited, &mut path).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    fn store() -> TaskStore {
        TaskStore::new(
            Records::new(Arc::new(MemoryStore::new()), 4),
            Arc::new(SystemClock),
        )
    }

    async fn create(tasks: &TaskStore, id: &str, deps: &[&str]) -> Result<Task, CoordError> {
        let mut req = NewTask::new(id.to_uppercase()).with_id(id);
        for d in deps {
            req = req.with_dependency(*d);
        }
        tasks.create_with(req).await
    }

    #[tokio::test]
    async fn test_initial_status_follows_dependencies() {
        let tasks = store();
        let t1 = create(&tasks, "t1", &[]).await.unwrap();
        let t2 = create(&tasks, "t2", &["t1"]).await.unwrap();
        assert_eq!(t1.status, TaskStatus::Queued);
        assert_eq!(t2.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_cycle_through_forward_reference_rejected() {
        let tasks = store();
        // a waits on b, which does not exist yet.
        create(&tasks, "a", &["b"]).await.unwrap();

        let err = create(&tasks, "b", &["a"]).await.unwrap_err();
        match err {
            CoordError::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec![TaskId::new("b"), TaskId::new("a"), TaskId::new("b")]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(tasks.get(&TaskId::new("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let tasks = store();
        let err = create(&tasks, "a", &["a"]).await.unwrap_err();
        assert!(matches!(err, CoordError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_id_and_empty_title_rejected() {
        let tasks = store();
        create(&tasks, "t1", &[]).await.unwrap();
        assert!(matches!(
            create(&tasks, "t1", &[]).await,
            Err(CoordError::InvalidInput(_))
        ));
        assert!(matches!(
            tasks
                .create(" ", "", 1, Vec::<TaskId>::new(), Vec::<String>::new())
                .await,
            Err(CoordError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unblock_after_dependency_completes() {
        let tasks = store();
        let worker = WorkerId::new("w1");
        let t1 = create(&tasks, "t1", &[]).await.unwrap();
        create(&tasks, "t2", &["t1"]).await.unwrap();

        assert!(tasks.unblock().await.unwrap().is_empty());

        tasks.assign(&t1.id, &worker).await.unwrap();
        tasks.transition(&t1.id, TaskStatus::InProgress).await.unwrap();
        tasks.transition(&t1.id, TaskStatus::Completed).await.unwrap();

        assert_eq!(tasks.unblock().await.unwrap(), vec![TaskId::new("t2")]);
        assert!(tasks.unblock().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_machine_edges() {
        let tasks = store();
        let t = create(&tasks, "t1", &[]).await.unwrap();

        let err = tasks.transition(&t.id, TaskStatus::Completed).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidTransition { .. }));

        let err = tasks.transition(&t.id, TaskStatus::Assigned).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidInput(_)));

        let err = tasks
            .transition(&TaskId::new("missing"), TaskStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_blocked_task_cannot_start() {
        let tasks = store();
        create(&tasks, "t1", &[]).await.unwrap();
        create(&tasks, "t2", &["t1"]).await.unwrap();

        let err = tasks
            .report(&TaskId::new("t2"), &WorkerId::new("w1"), 0, Some(TaskStatus::InProgress), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_assign_race_has_one_winner() {
        let tasks = Arc::new(store());
        let t = create(&tasks, "t1", &[]).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let tasks = tasks.clone();
            let id = t.id.clone();
            handles.push(tokio::spawn(async move {
                tasks.assign(&id, &WorkerId::new(format!("w{i}"))).await
            }));
        }

        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(CoordError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_report_checks_owner_and_finishes() {
        let tasks = store();
        let owner = WorkerId::new("w1");
        let t = create(&tasks, "t1", &[]).await.unwrap();
        tasks.assign(&t.id, &owner).await.unwrap();

        let err = tasks
            .report(&t.id, &WorkerId::new("w2"), 10, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotOwner { .. }));

        let r = tasks
            .report(&t.id, &owner, 10, Some(TaskStatus::InProgress), None)
            .await
            .unwrap();
        assert!(r.transitioned);
        assert!(r.task.started_at.is_some());

        let r = tasks.report(&t.id, &owner, 60, None, None).await.unwrap();
        assert!(!r.transitioned);
        assert_eq!(r.task.progress, 60);

        let r = tasks
            .report(&t.id, &owner, 60, Some(TaskStatus::Completed), None)
            .await
            .unwrap();
        assert!(r.transitioned);
        assert_eq!(r.task.progress, 100);

        // Repeating the final report is harmless.
        let r = tasks
            .report(&t.id, &owner, 100, Some(TaskStatus::Completed), None)
            .await
            .unwrap();
        assert!(!r.transitioned);
    }

    #[tokio::test]
    async fn test_requeue_paths() {
        let tasks = store();
        let owner = WorkerId::new("w1");
        let t = create(&tasks, "t1", &[]).await.unwrap();

        assert!(!tasks.requeue(&t.id, "noop").await.unwrap());

        tasks.assign(&t.id, &owner).await.unwrap();
        assert!(!tasks
            .requeue_if_owned_by(&t.id, &WorkerId::new("w2"), "not theirs")
            .await
            .unwrap());
        assert!(tasks
            .requeue_if_owned_by(&t.id, &owner, "owner offline")
            .await
            .unwrap());

        let t = tasks.get(&t.id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Queued);
        assert!(t.assigned_to.is_none());
        assert_eq!(t.retries, 1);

        tasks.assign(&t.id, &owner).await.unwrap();
        tasks
            .report(&t.id, &owner, 5, Some(TaskStatus::InProgress), None)
            .await
            .unwrap();
        tasks
            .report(&t.id, &owner, 5, Some(TaskStatus::Failed), Some("boom".into()))
            .await
            .unwrap();
        assert!(tasks.requeue(&t.id, "retry").await.unwrap());
        assert_eq!(tasks.get(&t.id).await.unwrap().unwrap().retries, 2);
    }
}
