//! Mapping of coordination errors to HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use hivesync_core::CoordError;

use super::responses::ErrorResponse;

/// Handler error wrapping a [`CoordError`].
#[derive(Debug)]
pub struct ApiError(pub CoordError);

impl From<CoordError> for ApiError {
    fn from(e: CoordError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoordError::DependencyCycle { .. } | CoordError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            CoordError::UnknownWorker(_) | CoordError::UnknownTask(_) => StatusCode::NOT_FOUND,
            CoordError::ResourceConflict { .. } | CoordError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            CoordError::NotOwner { .. } => StatusCode::FORBIDDEN,
            CoordError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordError::Corrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            CoordError::DependencyCycle { .. } => "dependency_cycle",
            CoordError::ResourceConflict { .. } => "resource_conflict",
            CoordError::UnknownWorker(_) => "unknown_worker",
            CoordError::UnknownTask(_) => "unknown_task",
            CoordError::NotOwner { .. } => "not_owner",
            CoordError::InvalidTransition { .. } => "invalid_transition",
            CoordError::InvalidInput(_) => "invalid_input",
            CoordError::StoreUnavailable(_) => "store_unavailable",
            CoordError::Corrupted(_) => "corrupted",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: self.kind().to_string(),
            }),
        )
            .into_response()
    }
}
