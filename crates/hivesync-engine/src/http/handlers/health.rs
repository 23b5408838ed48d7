//! Health, metrics and snapshot handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use hivesync_core::Snapshot;

use crate::coordinator::Coordinator;
use crate::http::ApiError;

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(coord): State<Arc<Coordinator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&coord).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Full fleet view.
pub async fn snapshot(State(coord): State<Arc<Coordinator>>) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(coord.get_snapshot().await?))
}
