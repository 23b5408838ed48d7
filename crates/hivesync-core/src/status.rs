//! Status enums for Tasks and Workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Ready to be assigned.
    #[default]
    Queued,
    /// Waiting for at least one dependency to complete.
    Blocked,
    /// Owned by a worker that has not started it yet.
    Assigned,
    /// Being executed by its owner.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the task currently has an owner.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Whether `self -> to` is an edge of the task state machine that
    /// ordinary callers may take.
    ///
    /// Edges back into `Queued` are not listed: they belong to
    /// dependency unblocking and re-queueing, which have their own entry points.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Assigned)
                | (Self::Assigned, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Blocked => "BLOCKED",
            Self::Assigned => "ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn all() -> &'static [TaskStatus] {
        &[
            Self::Queued,
            Self::Blocked,
            Self::Assigned,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of a Worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Joined and ready for work.
    #[default]
    Active,
    /// Alive with nothing to do.
    Idle,
    /// Alive and working; not offered new tasks.
    Busy,
    /// Missed its liveness timeout or left the fleet.
    Offline,
    /// Reported an error state.
    Error,
}

impl WorkerStatus {
    /// Returns true if the assigner may offer new tasks to this worker.
    pub fn can_accept_tasks(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }

    /// Returns true if the worker is considered part of the live fleet.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
        }
    }

    pub fn all() -> &'static [WorkerStatus] {
        &[Self::Active, Self::Idle, Self::Busy, Self::Offline, Self::Error]
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "IDLE" => Ok(Self::Idle),
            "BUSY" => Ok(Self::Busy),
            "OFFLINE" => Ok(Self::Offline),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "BLOCKED" => Ok(Self::Blocked),
            "ASSIGNED" => Ok(Self::Assigned),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_machine_edges() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Assigned.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("idle".parse::<WorkerStatus>(), Ok(WorkerStatus::Idle));
    }

    #[test]
    fn test_worker_acceptance() {
        assert!(WorkerStatus::Active.can_accept_tasks());
        assert!(WorkerStatus::Idle.can_accept_tasks());
        assert!(!WorkerStatus::Busy.can_accept_tasks());
        assert!(!WorkerStatus::Offline.is_live());
    }
}
