use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};

use hivesync_core::Message;

use crate::coordinator::Coordinator;
use crate::http::responses::{HistoryQuery, SendMessageRequest, SendMessageResponse};
use crate::http::ApiError;

const DEFAULT_HISTORY_LIMIT: usize = 100;

pub async fn send_message(
    State(coord): State<Arc<Coordinator>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    let message_id = coord
        .send_message(&req.from, req.to, &req.kind, req.payload, req.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(SendMessageResponse { message_id })))
}

pub async fn message_history(
    State(coord): State<Arc<Coordinator>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(coord.message_history(limit).await?))
}
