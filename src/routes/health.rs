use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::routes::upload::ALLOWED_EXTENSIONS;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub completed_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
}

/// GET /health: liveness plus current queue load.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.queue.snapshot().await;
    Json(HealthResponse {
        status: "healthy",
        service: "background-remover",
        version: env!("CARGO_PKG_VERSION"),
        queue: QueueHealth {
            active_jobs: snapshot.active_jobs,
            queued_jobs: snapshot.queued_jobs,
            completed_jobs: snapshot.completed_jobs,
            max_concurrent_jobs: snapshot.max_concurrent_jobs,
            max_queue_size: snapshot.max_queue_size,
        },
    })
}

#[derive(Serialize)]
pub struct ApiInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
    pub max_per_client: usize,
    pub inline_size_threshold: usize,
    pub max_content_length: usize,
    pub allowed_extensions: &'static [&'static str],
    pub endpoints: Vec<&'static str>,
}

/// GET /
pub async fn api_info(State(state): State<AppState>) -> Json<ApiInfo> {
    let settings = state.queue.settings();
    Json(ApiInfo {
        name: "Background Remover API",
        version: env!("CARGO_PKG_VERSION"),
        max_concurrent_jobs: settings.max_concurrent_jobs,
        max_queue_size: settings.max_queue_size,
        max_per_client: settings.max_per_client,
        inline_size_threshold: settings.inline_size_threshold,
        max_content_length: state.config.max_content_length,
        allowed_extensions: ALLOWED_EXTENSIONS,
        endpoints: vec![
            "GET /health",
            "GET /metrics",
            "POST /remove-background",
            "POST /remove-background-preview",
            "POST /remove-background-base64",
            "POST /queue/remove-background",
            "GET /queue/job/{job_id}",
            "GET /queue/result/{job_id}",
            "GET /queue/status",
        ],
    })
}
