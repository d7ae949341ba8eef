use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::api::{Base64Request, Base64Response};
use crate::models::job::{JobKind, JobPayload, ProcessingOptions};
use crate::routes::queue::queued_response;
use crate::routes::upload::{check_image_bytes, read_upload, validate_options, ClientKey};
use crate::services::processor::ProcessedImage;
use crate::services::queue::Route;

/// Outcome of a request that may run inline or be queued.
enum Handled {
    Inline(ProcessedImage, Uuid),
    Queued(Response),
}

async fn run_or_enqueue(
    state: &AppState,
    client: &str,
    kind: JobKind,
    payload: JobPayload,
) -> ApiResult<Handled> {
    match state.queue.route(payload.len()).await {
        Route::Inline(slot) => {
            let processing_id = Uuid::new_v4();
            tracing::info!(%processing_id, kind = %kind, size = payload.len(), "Processing inline");
            let image = state.processor.process_inline(&payload).await;
            drop(slot);
            Ok(Handled::Inline(image?, processing_id))
        }
        Route::Enqueue => {
            let job_id = state.queue.submit(kind, client, payload).await?;
            let body = queued_response(state, job_id).await;
            Ok(Handled::Queued((StatusCode::ACCEPTED, Json(body)).into_response()))
        }
    }
}

fn metadata_headers(image: &ProcessedImage, processing_id: Uuid) -> [(&'static str, String); 4] {
    [
        ("x-processing-id", processing_id.to_string()),
        ("x-image-width", image.metadata.width.to_string()),
        ("x-image-height", image.metadata.height.to_string()),
        (
            "x-compression-ratio",
            format!("{:.4}", image.metadata.compression_ratio),
        ),
    ]
}

/// POST /remove-background: returns the result as a download.
pub async fn remove_background(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    multipart: Multipart,
) -> ApiResult<Response> {
    let upload = read_upload(multipart, false).await?;
    let download_name = format!("removed_bg_{}", upload.stem());

    match run_or_enqueue(&state, &client, JobKind::DirectUpload, upload.payload).await? {
        Handled::Queued(response) => Ok(response),
        Handled::Inline(image, processing_id) => {
            let headers = [
                (header::CONTENT_TYPE, image.format.mime_type().to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!(
                        "attachment; filename=\"{}.{}\"",
                        download_name,
                        image.format.extension()
                    ),
                ),
                (
                    header::ACCESS_CONTROL_EXPOSE_HEADERS,
                    "Content-Disposition".to_string(),
                ),
                (
                    header::CACHE_CONTROL,
                    "no-cache, no-store, must-revalidate".to_string(),
                ),
                (header::PRAGMA, "no-cache".to_string()),
                (header::EXPIRES, "0".to_string()),
            ];
            let extra = metadata_headers(&image, processing_id);
            Ok((headers, extra, image.bytes).into_response())
        }
    }
}

/// POST /remove-background-preview: returns an image for in-browser display.
pub async fn remove_background_preview(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    multipart: Multipart,
) -> ApiResult<Response> {
    let upload = read_upload(multipart, true).await?;

    match run_or_enqueue(&state, &client, JobKind::Preview, upload.payload).await? {
        Handled::Queued(response) => Ok(response),
        Handled::Inline(image, processing_id) => {
            let headers = [(header::CONTENT_TYPE, image.format.mime_type().to_string())];
            let extra = metadata_headers(&image, processing_id);
            Ok((headers, extra, image.bytes).into_response())
        }
    }
}

/// POST /remove-background-base64: base64 in, base64 out.
pub async fn remove_background_base64(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    Json(request): Json<Base64Request>,
) -> ApiResult<Response> {
    let encoded = request
        .image
        .as_deref()
        .filter(|image| !image.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No image data provided".to_string()))?;

    // Accept data URLs as well as bare base64
    let encoded = encoded
        .split_once("base64,")
        .map_or(encoded, |(_, data)| data)
        .trim();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ApiError::BadRequest("Invalid base64 data".to_string()))?;
    check_image_bytes(&bytes)?;

    let defaults = ProcessingOptions::default();
    let options = ProcessingOptions {
        format: request.format.unwrap_or(defaults.format),
        quality: request.quality.unwrap_or(defaults.quality),
        max_width: request.max_width,
        max_height: request.max_height,
        preview: false,
    };
    validate_options(&options)?;

    let payload = JobPayload::new(bytes, options);
    match run_or_enqueue(&state, &client, JobKind::DirectBase64, payload).await? {
        Handled::Queued(response) => Ok(response),
        Handled::Inline(image, processing_id) => Ok(Json(Base64Response {
            success: true,
            image: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            mimetype: image.format.mime_type().to_string(),
            processing_id,
            metadata: image.metadata,
        })
        .into_response()),
    }
}
