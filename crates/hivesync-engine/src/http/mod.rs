//! HTTP gateway.
//!
//! Provides endpoints for:
//! - Worker presence (`/v1/workers`, heartbeats, mailbox, pulling work)
//! - Tasks (`/v1/tasks`, progress reports, operator retry)
//! - Resource locks (`/v1/locks/claim`, `/v1/locks/release`)
//! - Messages (`/v1/messages`)
//! - Fleet view (`/v1/snapshot`) and push channel (`/v1/events`)
//! - Health check (`/health`) and Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;

mod error;
mod handlers;
pub mod responses;

pub use error::ApiError;

/// Create the HTTP router.
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    // Dashboards are served from other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Workers
        .route(
            "/v1/workers",
            post(handlers::register_worker).get(handlers::list_workers),
        )
        .route("/v1/workers/:id/heartbeat", post(handlers::heartbeat))
        .route("/v1/workers/:id/deregister", post(handlers::deregister_worker))
        .route("/v1/workers/:id/messages", get(handlers::get_messages))
        .route("/v1/workers/:id/tasks", get(handlers::assigned_tasks))
        .route("/v1/workers/:id/claim-next", post(handlers::claim_next_task))
        // Tasks
        .route(
            "/v1/tasks",
            post(handlers::create_task).get(handlers::list_tasks),
        )
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/progress", post(handlers::update_progress))
        .route("/v1/tasks/:id/retry", post(handlers::retry_task))
        // Locks
        .route("/v1/locks/claim", post(handlers::claim_resources))
        .route("/v1/locks/release", post(handlers::release_resources))
        // Messages
        .route(
            "/v1/messages",
            post(handlers::send_message).get(handlers::message_history),
        )
        // Observability
        .route("/v1/snapshot", get(handlers::snapshot))
        .route("/v1/events", get(handlers::events))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn router() -> Router {
        create_router(Arc::new(Coordinator::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = call(&router(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_worker_claims_and_completes_task() {
        let router = router();

        let (status, _) = call(
            &router,
            "POST",
            "/v1/workers",
            Some(json!({ "worker_id": "w1", "capabilities": ["python"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, created) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({ "title": "Build", "priority": 1, "resources": ["a.py"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "QUEUED");
        let task_id = created["task_id"].as_str().unwrap().to_string();

        let (status, claimed) = call(&router, "POST", "/v1/workers/w1/claim-next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["id"], task_id.as_str());
        assert_eq!(claimed["status"], "ASSIGNED");

        let (status, _) = call(
            &router,
            "POST",
            "/v1/locks/claim",
            Some(json!({ "worker_id": "w1", "resources": ["a.py"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let progress_uri = format!("/v1/tasks/{task_id}/progress");
        let (status, _) = call(
            &router,
            "POST",
            &progress_uri,
            Some(json!({ "worker_id": "w2", "progress": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, task) = call(
            &router,
            "POST",
            &progress_uri,
            Some(json!({ "worker_id": "w1", "progress": 10, "status": "IN_PROGRESS" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "IN_PROGRESS");

        let (status, task) = call(
            &router,
            "POST",
            &progress_uri,
            Some(json!({ "worker_id": "w1", "progress": 100, "status": "COMPLETED" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "COMPLETED");

        let (_, snapshot) = call(&router, "GET", "/v1/snapshot", None).await;
        assert_eq!(snapshot["locks"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let router = router();

        let (status, body) = call(&router, "GET", "/v1/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "unknown_task");

        let (status, _) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({ "title": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        for id in ["w1", "w2"] {
            call(&router, "POST", "/v1/workers", Some(json!({ "worker_id": id }))).await;
        }
        call(
            &router,
            "POST",
            "/v1/locks/claim",
            Some(json!({ "worker_id": "w1", "resources": ["db"] })),
        )
        .await;
        let (status, body) = call(
            &router,
            "POST",
            "/v1/locks/claim",
            Some(json!({ "worker_id": "w2", "resources": ["db"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "resource_conflict");
    }

    #[tokio::test]
    async fn test_heartbeat_and_messages() {
        let router = router();

        let (_, body) = call(
            &router,
            "POST",
            "/v1/workers/ghost/heartbeat",
            Some(json!({ "status": "IDLE" })),
        )
        .await;
        assert_eq!(body["outcome"], "unknown_worker");

        call(&router, "POST", "/v1/workers", Some(json!({ "worker_id": "w2" }))).await;
        let (status, _) = call(
            &router,
            "POST",
            "/v1/messages",
            Some(json!({ "from": "w1", "to": "w2", "type": "note", "payload": { "n": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, inbox) = call(&router, "GET", "/v1/workers/w2/messages", None).await;
        assert_eq!(inbox.as_array().unwrap().len(), 1);
        assert_eq!(inbox[0]["payload"]["n"], 1);

        let (_, inbox) = call(&router, "GET", "/v1/workers/w2/messages", None).await;
        assert!(inbox.as_array().unwrap().is_empty());

        // Delivered messages stay in the audit history.
        let (status, history) = call(&router, "GET", "/v1/messages?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["type"], "note");
    }
}
