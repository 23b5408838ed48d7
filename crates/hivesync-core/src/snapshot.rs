//! Read-only view of the coordination state, for dashboards and tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Lock, Task, TaskStatus, Worker, WorkerStatus};

/// Everything a dashboard needs in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub workers: Vec<Worker>,
    pub tasks: Vec<Task>,
    pub locks: Vec<Lock>,
    pub stats: Stats,
}

/// Aggregate counters derived from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub workers_by_status: BTreeMap<String, u64>,
    pub tasks_by_status: BTreeMap<String, u64>,
    pub locks_held: u64,
    pub messages_total: u64,
    pub messages_undelivered: u64,
}

impl Stats {
    /// Count workers and tasks by status. Every status appears, zero or not.
    pub fn tally(workers: &[Worker], tasks: &[Task], locks: &[Lock]) -> Self {
        let mut workers_by_status: BTreeMap<String, u64> = WorkerStatus::all()
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for w in workers {
            *workers_by_status.entry(w.status.as_str().to_string()).or_default() += 1;
        }

        let mut tasks_by_status: BTreeMap<String, u64> = TaskStatus::all()
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for t in tasks {
            *tasks_by_status.entry(t.status.as_str().to_string()).or_default() += 1;
        }

        Self {
            workers_by_status,
            tasks_by_status,
            locks_held: locks.len() as u64,
            messages_total: 0,
            messages_undelivered: 0,
        }
    }

    pub fn workers(&self, status: WorkerStatus) -> u64 {
        self.workers_by_status.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn tasks(&self, status: TaskStatus) -> u64 {
        self.tasks_by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}
