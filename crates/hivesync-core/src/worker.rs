//! Worker records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{CapabilitySet, TaskId, WorkerId, WorkerStatus};

/// Performance score every worker starts with.
pub const DEFAULT_PERFORMANCE_SCORE: f64 = 100.0;

/// A participant in the coordination fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker identifier, chosen by the worker.
    pub id: WorkerId,

    /// Tags describing what the worker can do.
    pub capabilities: CapabilitySet,

    /// Current status.
    pub status: WorkerStatus,

    /// Task the worker reported working on in its last heartbeat.
    pub current_task: Option<TaskId>,

    /// Resource keys this worker holds locks on.
    pub claimed_resources: BTreeSet<String>,

    /// Running quality score used by the assigner.
    pub performance_score: f64,

    /// Last liveness signal.
    pub last_heartbeat: DateTime<Utc>,

    /// When the worker (re-)joined the fleet.
    pub registered_at: DateTime<Utc>,

    /// Maximum number of tasks the assigner may hand this worker at once.
    pub max_concurrent_tasks: u32,

    /// Tasks this worker finished successfully.
    #[serde(default)]
    pub tasks_completed: u64,

    /// Tasks this worker reported as failed.
    #[serde(default)]
    pub tasks_failed: u64,
}

impl Worker {
    /// Create a freshly registered worker.
    pub fn new(
        id: WorkerId,
        capabilities: CapabilitySet,
        max_concurrent_tasks: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capabilities,
            status: WorkerStatus::Active,
            current_task: None,
            claimed_resources: BTreeSet::new(),
            performance_score: DEFAULT_PERFORMANCE_SCORE,
            last_heartbeat: now,
            registered_at: now,
            max_concurrent_tasks,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Age of the last heartbeat relative to `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    /// Returns true if the worker holds the lock on `resource`.
    pub fn holds(&self, resource: &str) -> bool {
        self.claimed_resources.contains(resource)
    }
}
