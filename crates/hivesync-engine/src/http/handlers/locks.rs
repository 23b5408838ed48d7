//! Resource lock handlers.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use hivesync_core::WorkerId;

use crate::coordinator::Coordinator;
use crate::http::responses::ResourcesRequest;
use crate::http::ApiError;

/// All-or-nothing claim. 409 names the first conflicting resource.
pub async fn claim_resources(
    State(coord): State<Arc<Coordinator>>,
    Json(req): Json<ResourcesRequest>,
) -> Result<StatusCode, ApiError> {
    coord
        .claim_resources(&WorkerId::new(req.worker_id), req.resources)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn release_resources(
    State(coord): State<Arc<Coordinator>>,
    Json(req): Json<ResourcesRequest>,
) -> Result<StatusCode, ApiError> {
    coord
        .release_resources(&WorkerId::new(req.worker_id), req.resources)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
