//! Task handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use hivesync_core::{CoordError, NewTask, Task, TaskId, WorkerId};

use crate::coordinator::Coordinator;
use crate::http::responses::{CreateTaskResponse, ProgressRequest, RetryResponse};
use crate::http::ApiError;

pub async fn create_task(
    State(coord): State<Arc<Coordinator>>,
    Json(req): Json<NewTask>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let task = coord.create_task_with(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id,
            status: task.status,
        }),
    ))
}

pub async fn list_tasks(State(coord): State<Arc<Coordinator>>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(coord.tasks().list().await?))
}

pub async fn get_task(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = TaskId::new(id);
    match coord.tasks().get(&id).await? {
        Some(task) => Ok(Json(task)),
        None => Err(CoordError::UnknownTask(id).into()),
    }
}

pub async fn update_progress(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    Json(req): Json<ProgressRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = coord
        .report_task(
            &WorkerId::new(req.worker_id),
            &TaskId::new(id),
            req.progress,
            req.status,
            req.error,
        )
        .await?;
    Ok(Json(task))
}

pub async fn retry_task(
    State(coord): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let requeued = coord.retry_task(&TaskId::new(id)).await?;
    Ok(Json(RetryResponse { requeued }))
}
