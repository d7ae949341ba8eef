use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;

/// Background removal backend. Takes encoded image bytes and returns an
/// encoded image (PNG with alpha) with the background cut out.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove(&self, image: &[u8]) -> Result<Vec<u8>, RemoverError>;
}

/// Client for a rembg-compatible HTTP server (`rembg s`).
pub struct RembgClient {
    http: Client,
    url: String,
}

impl RembgClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl BackgroundRemover for RembgClient {
    async fn remove(&self, image: &[u8]) -> Result<Vec<u8>, RemoverError> {
        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(image.to_vec()).file_name("input"),
        );

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(RemoverError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoverError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(RemoverError::Http)?;
        if bytes.is_empty() {
            return Err(RemoverError::EmptyOutput);
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoverError {
    #[error("Background removal request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Background removal service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Background removal produced no output")]
    EmptyOutput,
}
