use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Multipart};
use axum::http::request::Parts;
use garde::Validate;

use crate::error::{ApiError, ApiResult};
use crate::models::job::{JobPayload, OutputFormat, ProcessingOptions};
use crate::services::transform::MIN_IMAGE_BYTES;

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp"];

/// Identity used for per-client admission limits: first `X-Forwarded-For`
/// hop, else the peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let key = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Ok(ClientKey(key))
    }
}

/// A parsed multipart upload.
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub payload: JobPayload,
}

impl Upload {
    /// Filename without its extension.
    pub fn stem(&self) -> &str {
        self.filename
            .rsplit_once('.')
            .map_or(self.filename.as_str(), |(stem, _)| stem)
    }
}

pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read the `file` part plus optional `format`, `quality`, `max_width` and
/// `max_height` fields.
pub async fn read_upload(mut multipart: Multipart, preview: bool) -> ApiResult<Upload> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut options = ProcessingOptions {
        preview,
        ..ProcessingOptions::default()
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
                file = Some((filename, data.to_vec()));
            }
            "format" | "quality" | "max_width" | "max_height" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
                apply_option(&mut options, &name, value.trim())?;
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;
    if filename.is_empty() {
        return Err(ApiError::BadRequest("No file selected".to_string()));
    }
    if !allowed_file(&filename) {
        return Err(ApiError::BadRequest(format!(
            "File type not allowed (allowed: {})",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    check_image_bytes(&bytes)?;
    validate_options(&options)?;

    Ok(Upload {
        filename,
        payload: JobPayload::new(bytes, options),
    })
}

fn apply_option(options: &mut ProcessingOptions, name: &str, value: &str) -> ApiResult<()> {
    if value.is_empty() {
        return Ok(());
    }
    let invalid = |_| ApiError::BadRequest(format!("Invalid value for {}: {}", name, value));
    match name {
        "format" => {
            options.format = value
                .parse::<OutputFormat>()
                .map_err(|_| ApiError::BadRequest(format!("Unsupported output format: {}", value)))?
        }
        "quality" => options.quality = value.parse().map_err(invalid)?,
        "max_width" => options.max_width = Some(value.parse().map_err(invalid)?),
        "max_height" => options.max_height = Some(value.parse().map_err(invalid)?),
        _ => {}
    }
    Ok(())
}

/// Reject payloads that cannot hold an image before they reach admission.
pub fn check_image_bytes(bytes: &[u8]) -> ApiResult<()> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("File is empty or corrupted".to_string()));
    }
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ApiError::BadRequest(
            "File too small to be a valid image".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_options(options: &ProcessingOptions) -> ApiResult<()> {
    options
        .validate()
        .map_err(|report| ApiError::BadRequest(format!("Invalid options: {}", report)))
}
