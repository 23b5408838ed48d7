//! JSON lines output of worker events for scripting.

use std::io::{self, Write};

use serde::Serialize;

use hivesync_core::{Message, Task, WorkerId};

/// JSON event types that can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    WorkerRegistered,
    WorkerStopped,
    TaskClaimed,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskDeferred,
    MessageReceived,
    Error,
}

/// A JSON event written to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: JsonEventType, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }
}

/// Writes [`JsonEvent`]s to stdout when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutput {
    enabled: bool,
}

impl JsonOutput {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn emit(&self, event: JsonEvent) {
        if !self.enabled {
            return;
        }
        if let Ok(json) = serde_json::to_string(&event) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{json}");
            let _ = stdout.flush();
        }
    }

    pub fn worker_registered(&self, worker_id: &WorkerId) {
        self.emit(JsonEvent::new(
            JsonEventType::WorkerRegistered,
            serde_json::json!({ "worker_id": worker_id }),
        ));
    }

    pub fn worker_stopped(&self, worker_id: &WorkerId) {
        self.emit(JsonEvent::new(
            JsonEventType::WorkerStopped,
            serde_json::json!({ "worker_id": worker_id }),
        ));
    }

    pub fn task_claimed(&self, task: &Task) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskClaimed,
            serde_json::json!({
                "task_id": task.id,
                "title": task.title,
                "priority": task.priority,
            }),
        ));
    }

    pub fn task_progress(&self, task: &Task, progress: u8) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskProgress,
            serde_json::json!({ "task_id": task.id, "progress": progress }),
        ));
    }

    pub fn task_completed(&self, task: &Task) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskCompleted,
            serde_json::json!({ "task_id": task.id }),
        ));
    }

    pub fn task_failed(&self, task: &Task, error: &str) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskFailed,
            serde_json::json!({ "task_id": task.id, "error": error }),
        ));
    }

    /// Task handed back because its resources were held elsewhere.
    pub fn task_deferred(&self, task: &Task, reason: &str) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskDeferred,
            serde_json::json!({ "task_id": task.id, "reason": reason }),
        ));
    }

    pub fn message_received(&self, message: &Message) {
        self.emit(JsonEvent::new(
            JsonEventType::MessageReceived,
            serde_json::json!({
                "message_id": message.id,
                "from": message.from,
                "type": message.kind,
                "payload": message.payload,
            }),
        ));
    }

    pub fn error(&self, message: &str) {
        self.emit(JsonEvent::new(
            JsonEventType::Error,
            serde_json::json!({ "message": message }),
        ));
    }
}
