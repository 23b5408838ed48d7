//! Task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{CapabilitySet, TaskId, TaskStatus, WorkerId};

/// A unit of work shared by the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    pub title: String,

    pub description: String,

    /// Lower is more urgent.
    pub priority: u32,

    /// Current task status.
    pub status: TaskStatus,

    /// Tasks that must be COMPLETED before this one may start.
    pub dependencies: BTreeSet<TaskId>,

    /// Resource keys the task needs locked while it runs.
    pub resources: BTreeSet<String>,

    /// Capability tags preferred (or required) of the executing worker.
    #[serde(default)]
    pub required_capabilities: CapabilitySet,

    /// Current owner.
    pub assigned_to: Option<WorkerId>,

    /// Progress reported by the owner, 0-100.
    #[serde(default)]
    pub progress: u8,

    /// How many times the task was put back in the queue.
    #[serde(default)]
    pub retries: u32,

    /// Reason for the last failure or re-queue.
    #[serde(default)]
    pub last_error: Option<String>,

    /// Who created this task.
    #[serde(default)]
    pub created_by: String,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a task from a creation request. Status is decided by the caller.
    pub fn from_request(req: NewTask, status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: req.id.unwrap_or_else(TaskId::generate),
            title: req.title,
            description: req.description,
            priority: req.priority,
            status,
            dependencies: req.dependencies,
            resources: req.resources,
            required_capabilities: req.required_capabilities,
            assigned_to: None,
            progress: 0,
            retries: 0,
            last_error: None,
            created_by: req.created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if `worker` currently owns the task.
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status.is_owned() && self.assigned_to.as_ref() == Some(worker)
    }

    /// Hand the task to `worker`.
    pub fn assign(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Assigned;
        self.assigned_to = Some(worker);
    }

    /// Mark the task as started.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
    }

    /// Mark the task as completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now);
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, now: DateTime<Utc>, error: Option<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(now);
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Put the task back in the queue without an owner.
    pub fn requeue(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Queued;
        self.assigned_to = None;
        self.progress = 0;
        self.started_at = None;
        self.completed_at = None;
        self.retries += 1;
        self.last_error = Some(reason.into());
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    /// Explicit id; generated when absent.
    pub id: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub priority: u32,
    pub dependencies: BTreeSet<TaskId>,
    pub resources: BTreeSet<String>,
    pub required_capabilities: CapabilitySet,
    pub created_by: String,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.required_capabilities.insert(tag);
        self
    }

    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_helpers() {
        let now = Utc::now();
        let mut task = Task::from_request(NewTask::new("build"), TaskStatus::Queued, now);
        let w = WorkerId::new("w1");

        task.assign(w.clone());
        assert!(task.is_owned_by(&w));

        task.start(now);
        assert_eq!(task.status, TaskStatus::InProgress);

        task.requeue("owner went offline");
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_to.is_none());
        assert_eq!(task.retries, 1);
        assert!(!task.is_owned_by(&w));
    }

    #[test]
    fn test_builder() {
        let req = NewTask::new("T2")
            .with_id("t2")
            .with_dependency("t1")
            .with_resource("a.py")
            .with_capability("Rust");
        assert_eq!(req.id, Some(TaskId::new("t2")));
        assert!(req.dependencies.contains(&TaskId::new("t1")));
        assert!(req.resources.contains("a.py"));
        assert_eq!(req.required_capabilities.len(), 1);
    }
}
