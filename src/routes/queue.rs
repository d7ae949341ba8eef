use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app_state::AppState;
use crate::error::ApiResult;
use crate::models::api::{JobStatusView, QueueSnapshot, SubmitResponse};
use crate::models::job::{JobId, JobKind, JobState};
use crate::routes::upload::{read_upload, ClientKey};
use crate::services::retrieval;

/// POST /queue/remove-background: always goes through the queue.
pub async fn submit_job(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    let upload = read_upload(multipart, false).await?;
    let job_id = state
        .queue
        .submit(JobKind::DirectUpload, &client, upload.payload)
        .await?;
    Ok(Json(queued_response(&state, job_id).await))
}

/// Build the 'accepted' body, reading back the current queue position.
pub async fn queued_response(state: &AppState, job_id: JobId) -> SubmitResponse {
    let queue_position = state
        .queue
        .status(&job_id)
        .await
        .map_or(0, |status| status.queue_position);
    SubmitResponse {
        message: format!("Job queued. Check /queue/job/{} for progress", job_id),
        job_id,
        status: JobState::Queued,
        queue_position,
    }
}

/// GET /queue/job/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    let status = retrieval::get_status(&state.queue, &JobId::from(job_id)).await?;
    Ok(Json(status))
}

/// GET /queue/result/{job_id}: raw output bytes with metadata headers.
pub async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let job_id = JobId::from(job_id);
    let blob = retrieval::get_result(&state.queue, state.storage(), &job_id).await?;
    let meta = &blob.metadata;

    let headers = [
        (header::CONTENT_TYPE, blob.mime_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!(
                "inline; filename=\"removed_bg_{}.{}\"",
                job_id,
                blob.format.extension()
            ),
        ),
        (header::CACHE_CONTROL, "no-cache".to_string()),
    ];
    let image_headers = [
        ("x-image-width", meta.width.to_string()),
        ("x-image-height", meta.height.to_string()),
        ("x-original-size", meta.original_size.to_string()),
        ("x-optimized-size", meta.optimized_size.to_string()),
        ("x-compression-ratio", format!("{:.4}", meta.compression_ratio)),
    ];

    Ok((headers, image_headers, blob.bytes).into_response())
}

/// GET /queue/status
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.queue.snapshot().await)
}
