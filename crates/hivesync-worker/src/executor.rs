//! Task execution.
//!
//! An [`Executor`] runs one task to completion and reports progress on a
//! channel. The session turns that progress into store updates.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use hivesync_core::Task;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("progress channel closed")]
    Aborted,
}

/// Runs tasks.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `task`, sending percentages in 0..=100 on `progress`.
    async fn execute(&self, task: &Task, progress: mpsc::Sender<u8>) -> Result<(), ExecutorError>;
}

/// Executor that sleeps through a fixed number of steps.
pub struct SimulatedExecutor {
    steps: u32,
    step_delay: Duration,
    failure_rate: f64,
}

impl SimulatedExecutor {
    pub fn new(steps: u32, step_delay: Duration, failure_rate: f64) -> Self {
        Self {
            steps: steps.max(1),
            step_delay,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500), 0.0)
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, task: &Task, progress: mpsc::Sender<u8>) -> Result<(), ExecutorError> {
        for step in 1..=self.steps {
            tokio::time::sleep(self.step_delay).await;
            let pct = (step * 100 / self.steps).min(100) as u8;
            debug!(task_id = %task.id, progress = pct, "Step done");
            progress.send(pct).await.map_err(|_| ExecutorError::Aborted)?;
        }

        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(ExecutorError::Failed(format!(
                "simulated failure in '{}'",
                task.title
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hivesync_core::{NewTask, TaskStatus};

    fn task() -> Task {
        Task::from_request(NewTask::new("build"), TaskStatus::Assigned, Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_progress_to_completion() {
        let executor = SimulatedExecutor::new(4, Duration::from_millis(100), 0.0);
        let (tx, mut rx) = mpsc::channel(8);

        executor.execute(&task(), tx).await.unwrap();

        let mut seen = Vec::new();
        while let Some(p) = rx.recv().await {
            seen.push(p);
        }
        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_certain_failure() {
        let executor = SimulatedExecutor::new(1, Duration::from_millis(10), 1.0);
        let (tx, _rx) = mpsc::channel(8);
        let err = executor.execute(&task(), tx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_aborts() {
        let executor = SimulatedExecutor::default();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = executor.execute(&task(), tx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Aborted));
    }
}
