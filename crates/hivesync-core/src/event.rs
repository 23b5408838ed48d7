//! Coordination events published for observers (dashboards, logs, tests).

use serde::{Deserialize, Serialize};

use crate::{MessageId, Recipient, TaskId, TaskStatus, WorkerId, WorkerStatus};

/// Something noteworthy happened to the shared state.
///
/// Events are a best-effort push channel for observers. The store stays the
/// source of truth; missing an event never loses state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordEvent {
    /// Worker joined or re-joined.
    WorkerRegistered { worker_id: WorkerId },

    /// Worker reported a new status.
    WorkerStatusChanged {
        worker_id: WorkerId,
        status: WorkerStatus,
    },

    /// Worker exceeded its liveness timeout or left.
    WorkerOffline { worker_id: WorkerId },

    /// Task created.
    TaskCreated { task_id: TaskId, status: TaskStatus },

    /// Task status changed.
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        worker_id: Option<WorkerId>,
    },

    /// Resources locked.
    ResourcesClaimed {
        worker_id: WorkerId,
        resources: Vec<String>,
    },

    /// Resources unlocked.
    ResourcesReleased {
        worker_id: WorkerId,
        resources: Vec<String>,
    },

    /// Message sent.
    MessageSent {
        message_id: MessageId,
        to: Recipient,
    },
}
