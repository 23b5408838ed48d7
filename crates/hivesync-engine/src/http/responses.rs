//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use hivesync_core::{MessageId, Recipient, TaskId, TaskStatus, WorkerStatus};

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable error kind, e.g. `resource_conflict`.
    pub kind: String,
}

// ============================================================================
// Worker types
// ============================================================================

/// Request body for worker registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: Option<u32>,
}

/// Request body for a heartbeat.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
}

/// Response body for a heartbeat.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// `recorded`, `unknown_worker` or `deferred`.
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub deregistered: bool,
}

// ============================================================================
// Task types
// ============================================================================

/// Response body for task creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// Request body for a progress report.
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub worker_id: String,
    #[serde(default)]
    pub progress: u8,
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub requeued: bool,
}

// ============================================================================
// Lock types
// ============================================================================

/// Request body for claiming or releasing resources.
#[derive(Debug, Deserialize)]
pub struct ResourcesRequest {
    pub worker_id: String,
    pub resources: Vec<String>,
}

// ============================================================================
// Message types
// ============================================================================

/// Request body for sending a message.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub from: String,
    /// Worker id or `"broadcast"`.
    pub to: Recipient,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: MessageId,
}

/// Query for `GET /v1/messages`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}
