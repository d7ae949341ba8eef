pub mod health;
pub mod metrics;
pub mod queue;
pub mod remove;
pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// All HTTP endpoints, without the middleware stack.
///
/// Extractors are allowed bodies up to `max_content_length` instead of
/// axum's 2 MiB default.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_content_length;
    Router::new()
        .route("/", get(health::api_info))
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/remove-background", post(remove::remove_background))
        .route(
            "/remove-background-preview",
            post(remove::remove_background_preview),
        )
        .route(
            "/remove-background-base64",
            post(remove::remove_background_base64),
        )
        .route("/queue/remove-background", post(queue::submit_job))
        .route("/queue/job/{job_id}", get(queue::job_status))
        .route("/queue/result/{job_id}", get(queue::job_result))
        .route("/queue/status", get(queue::queue_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
