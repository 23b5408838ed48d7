//! Prometheus metrics collection and formatting.
//!
//! Metrics are rendered from a [`Snapshot`], so every process reading the
//! same store reports the same fleet-wide numbers.

use std::fmt::Write;

use hivesync_core::{Snapshot, TaskStatus, WorkerStatus};

use crate::coordinator::Coordinator;

/// Collect all metrics and format as Prometheus text.
pub async fn collect_metrics(coordinator: &Coordinator) -> String {
    match coordinator.get_snapshot().await {
        Ok(snapshot) => render(&snapshot, true),
        Err(e) => {
            let mut output = String::new();
            write_store_up(&mut output, false);
            writeln!(output, "# snapshot failed: {e}").ok();
            output
        }
    }
}

/// Format a snapshot as Prometheus text.
pub fn render(snapshot: &Snapshot, store_up: bool) -> String {
    let mut output = String::new();
    let stats = &snapshot.stats;

    write_store_up(&mut output, store_up);

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP hivesync_workers Number of registered workers by status"
    )
    .ok();
    writeln!(output, "# TYPE hivesync_workers gauge").ok();
    for status in WorkerStatus::all() {
        writeln!(
            output,
            "hivesync_workers{{status=\"{}\"}} {}",
            status.as_str().to_ascii_lowercase(),
            stats.workers(*status)
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(output, "# HELP hivesync_tasks Number of tasks by status").ok();
    writeln!(output, "# TYPE hivesync_tasks gauge").ok();
    for status in TaskStatus::all() {
        writeln!(
            output,
            "hivesync_tasks{{status=\"{}\"}} {}",
            status.as_str().to_ascii_lowercase(),
            stats.tasks(*status)
        )
        .ok();
    }

    let retries: u64 = snapshot.tasks.iter().map(|t| u64::from(t.retries)).sum();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP hivesync_task_retries Sum of requeue counts over all tasks"
    )
    .ok();
    writeln!(output, "# TYPE hivesync_task_retries gauge").ok();
    writeln!(output, "hivesync_task_retries {retries}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP hivesync_locks_held Number of held resource locks").ok();
    writeln!(output, "# TYPE hivesync_locks_held gauge").ok();
    writeln!(output, "hivesync_locks_held {}", stats.locks_held).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP hivesync_messages Number of stored messages").ok();
    writeln!(output, "# TYPE hivesync_messages gauge").ok();
    writeln!(
        output,
        "hivesync_messages{{state=\"total\"}} {}",
        stats.messages_total
    )
    .ok();
    writeln!(
        output,
        "hivesync_messages{{state=\"undelivered\"}} {}",
        stats.messages_undelivered
    )
    .ok();

    output
}

fn write_store_up(output: &mut String, up: bool) {
    writeln!(output, "# HELP hivesync_store_up Whether the store answered the last scrape").ok();
    writeln!(output, "# TYPE hivesync_store_up gauge").ok();
    writeln!(output, "hivesync_store_up {}", u8::from(up)).ok();
}
