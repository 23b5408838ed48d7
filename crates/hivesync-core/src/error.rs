//! Core domain errors.

use thiserror::Error;

use crate::{TaskId, TaskStatus, WorkerId};

/// Errors surfaced by coordination operations.
///
/// Expected conditions (conflicts, unknown ids, ownership) are ordinary
/// variants callers match on. `StoreUnavailable` is transient and worth a
/// retry; `Corrupted` means a record could not be decoded.
#[derive(Debug, Error)]
pub enum CoordError {
    /// Creating the task would close a cycle in the dependency graph.
    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    DependencyCycle { cycle: Vec<TaskId> },

    /// A requested resource is held by another worker.
    #[error("Resource '{resource}' is held by worker '{holder}'")]
    ResourceConflict { resource: String, holder: WorkerId },

    /// Worker not found.
    #[error("Worker not found: {0}")]
    UnknownWorker(WorkerId),

    /// Task not found.
    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    /// A worker tried to mutate a task it does not own.
    #[error("Worker '{worker}' does not own task '{task}'")]
    NotOwner { worker: WorkerId, task: TaskId },

    /// Invalid state transition.
    #[error("Invalid state transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The store could not be reached or is busy.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persisted record could not be decoded or violated an invariant.
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

impl CoordError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ResourceConflict { .. })
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
