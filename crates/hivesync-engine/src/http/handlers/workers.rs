//! Worker presence handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use hivesync_core::{CapabilitySet, Message, Task, Worker, WorkerId};

use crate::coordinator::Coordinator;
use crate::http::responses::{
    DeregisterResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
};
use crate::http::ApiError;
use crate::registry::HeartbeatOutcome;

pub async fn register_worker(
    State(coord): State<Arc<Coordinator>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Worker>), ApiError> {
    let capabilities: CapabilitySet = req.capabilities.iter().map(String::as_str).collect();
    let worker = coord
        .register_with(
            &WorkerId::new(req.worker_id),
            capabilities,
            req.max_concurrent_tasks,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub async fn list_workers(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(coord.registry().list().await?))
}

/// Heartbeats never fail; an unknown worker is told so in the body.
pub async fn heartbeat(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let outcome = coord
        .heartbeat(&WorkerId::new(id), req.status, req.current_task)
        .await;
    let outcome = match outcome {
        HeartbeatOutcome::Recorded => "recorded",
        HeartbeatOutcome::UnknownWorker => "unknown_worker",
        HeartbeatOutcome::Deferred => "deferred",
    };
    Json(HeartbeatResponse {
        outcome: outcome.to_string(),
    })
}

pub async fn deregister_worker(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<DeregisterResponse>, ApiError> {
    let deregistered = coord.deregister(&WorkerId::new(id)).await?;
    Ok(Json(DeregisterResponse { deregistered }))
}

/// Drain the worker's mailbox.
pub async fn get_messages(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(coord.get_messages(&WorkerId::new(id)).await?))
}

pub async fn assigned_tasks(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(coord.assigned_tasks(&WorkerId::new(id)).await?))
}

/// Pull the next task; `null` when nothing is eligible.
pub async fn claim_next_task(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Option<Task>>, ApiError> {
    Ok(Json(coord.claim_next_task(&WorkerId::new(id)).await?))
}
