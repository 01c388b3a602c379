use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::backend::BackendPool;
use crate::error::{Result, TarotError};
use crate::health::{HealthChecker, OverallStatus};
use crate::metrics::QueueMetrics;
use crate::queue::TaskQueue;
use crate::response::{ComponentHealthResponse, MetricsResponse, StatusResponse, SubmitResponse};
use crate::task::Task;
use crate::validation::{validate_task_id, ReadingRequest};

/// Everything a handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub backends: Arc<BackendPool>,
    pub metrics: Arc<QueueMetrics>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(queue: Arc<TaskQueue>, backends: Arc<BackendPool>, metrics: Arc<QueueMetrics>) -> Self {
        let health = Arc::new(HealthChecker::new(Arc::clone(&queue), Arc::clone(&backends)));
        Self {
            queue,
            backends,
            metrics,
            health,
        }
    }
}

/// Accept a reading and queue it for interpretation
pub async fn submit_reading(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ReadingRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = payload.map_err(|e| TarotError::Validation(e.body_text()))?;
    let request = request.validated()?;

    let task = Task::new(request.user_id, request.question, request.cards);
    state.queue.push(&task).await?;
    tracing::info!(task_id = %task.id, user_id = %task.user_id, "Reading submitted");

    Ok((StatusCode::CREATED, Json(SubmitResponse::pending(task.id))))
}

/// Status plus the interpretation (or failure text) once finished
pub async fn get_reading(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<impl IntoResponse> {
    validate_task_id(&task_id)?;
    let progress = state
        .queue
        .progress(&task_id)
        .await?
        .ok_or_else(|| TarotError::NotFound(format!("task {}", task_id)))?;
    Ok(Json(progress))
}

pub async fn get_reading_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse> {
    validate_task_id(&task_id)?;
    let status = state
        .queue
        .status(&task_id)
        .await?
        .ok_or_else(|| TarotError::NotFound(format!("task {}", task_id)))?;
    Ok(Json(StatusResponse { task_id, status }))
}

/// Ready to take readings: the store answers and some backend is healthy
pub async fn tarot_health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.queue.ping().await?;
    state.backends.health_check()?;
    Ok(Json(ComponentHealthResponse::ok("tarot")))
}

pub async fn redis_health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.queue.ping().await?;
    Ok(Json(ComponentHealthResponse::ok("redis")))
}

/// Aggregated health report
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = match report.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let queue_depth = match state.queue.len().await {
        Ok(depth) => Some(depth),
        Err(e) => {
            tracing::warn!(error = %e, "Could not read queue depth");
            None
        }
    };
    Json(MetricsResponse {
        queue_depth,
        queue: state.metrics.snapshot(),
    })
}
