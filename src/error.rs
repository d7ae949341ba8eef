use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::processor::ProcessingError;
use crate::services::queue::AdmissionError;
use crate::services::retrieval::RetrievalError;

/// Error type for HTTP handlers. Renders as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("{0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Admission(AdmissionError::QueueFull { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL")
            }
            ApiError::Admission(AdmissionError::TooManyFromClient { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_FROM_CLIENT")
            }
            ApiError::Retrieval(RetrievalError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Retrieval(RetrievalError::NotCompleted { .. }) => {
                (StatusCode::CONFLICT, "NOT_COMPLETED")
            }
            ApiError::Retrieval(RetrievalError::ResultMissing(_)) => {
                (StatusCode::GONE, "RESULT_EXPIRED")
            }
            ApiError::Retrieval(RetrievalError::Storage(e)) => {
                tracing::error!(error = %e, "Result storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            ApiError::Processing(e) if e.is_client_error() => {
                (StatusCode::BAD_REQUEST, "INVALID_IMAGE")
            }
            ApiError::Processing(e) => {
                tracing::error!(error = %e, "Inline processing failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_FAILED")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        };

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR if code == "INTERNAL_ERROR" => {
                "An internal error occurred".to_string()
            }
            _ => self.to_string(),
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}
