//! HTTP surface: webhook intake plus queue and job status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use tracing::warn;

use crate::producers::WebhookIntake;
use crate::queue::{Producer, TaskQueue};
use crate::schedule::JobScheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub intake: Arc<WebhookIntake>,
    /// None when cron scheduling is disabled.
    pub scheduler: Option<Arc<JobScheduler>>,
}

/// Build the Axum router.
pub fn dispatch_routes(
    queue: Arc<TaskQueue>,
    intake: Arc<WebhookIntake>,
    scheduler: Option<Arc<JobScheduler>>,
) -> Router {
    let state = AppState {
        queue,
        intake,
        scheduler,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/queue", get(queue_status))
        .route("/api/jobs", get(list_jobs))
        .route("/webhooks/{source}", post(receive_webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-dispatch"
    }))
}

async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.status())
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = match &state.scheduler {
        Some(scheduler) => scheduler.jobs().await,
        None => Vec::new(),
    };
    Json(jobs)
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(producer) =
        Producer::webhook_source(&source).filter(|p| state.intake.has_handler(*p))
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown webhook source '{source}'") })),
        );
    };

    let delivery_id = producer
        .delivery_header()
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let Some(delivery_id) = delivery_id else {
        warn!(producer = %producer, "Webhook without delivery id rejected");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "missing delivery id header" })),
        );
    };

    let outcome = state.intake.accept(producer, delivery_id, payload);
    let body = serde_json::to_value(&outcome).unwrap_or_else(|_| serde_json::json!({}));
    (StatusCode::ACCEPTED, Json(body))
}
