#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

use bg_remover_queue::app_state::AppState;
use bg_remover_queue::config::AppConfig;
use bg_remover_queue::routes;
use bg_remover_queue::services::processor::Processor;
use bg_remover_queue::services::remover::{BackgroundRemover, RemoverError};
use bg_remover_queue::services::scheduler::Scheduler;
use bg_remover_queue::services::storage::ResultStorage;

pub const BOUNDARY: &str = "----bg-remover-test-boundary";

/// Returns the input unchanged, standing in for the rembg backend.
pub struct EchoRemover;

#[async_trait]
impl BackgroundRemover for EchoRemover {
    async fn remove(&self, image: &[u8]) -> Result<Vec<u8>, RemoverError> {
        Ok(image.to_vec())
    }
}

/// Echoes after a delay and records the highest number of overlapping calls.
#[derive(Default)]
pub struct SlowRemover {
    pub delay: Duration,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowRemover {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl BackgroundRemover for SlowRemover {
    async fn remove(&self, image: &[u8]) -> Result<Vec<u8>, RemoverError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(image.to_vec())
    }
}

/// A running test application. Dropping it stops the dispatcher and
/// removes the output folder.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _shutdown: Option<watch::Sender<bool>>,
    _dir: TempDir,
}

/// Small limits so admission failures are easy to reach.
pub fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_concurrent_jobs: 1,
        max_queue_size: 3,
        max_per_client: 2,
        poll_interval_ms: 20,
        error_backoff_ms: 50,
        job_timeout_secs: 10,
        ..AppConfig::default()
    }
}

/// Build the router without a dispatcher: queued jobs stay queued.
pub async fn build_test_app(config: AppConfig) -> TestApp {
    build_test_app_with(config, Arc::new(EchoRemover)).await
}

/// Same as [`build_test_app`] with a chosen remover backend.
pub async fn build_test_app_with(
    config: AppConfig,
    remover: Arc<dyn BackgroundRemover>,
) -> TestApp {
    let dir = TempDir::new().unwrap();
    let storage = ResultStorage::new(dir.path()).await.unwrap();
    let processor = Processor::new(remover, Arc::new(storage));
    let state = AppState::new(config, processor);

    TestApp {
        router: routes::router(state.clone()),
        state,
        _shutdown: None,
        _dir: dir,
    }
}

/// Build the router and start the dispatcher.
pub async fn build_running_app(config: AppConfig) -> TestApp {
    let mut app = build_test_app(config).await;
    let (tx, rx) = watch::channel(false);
    let scheduler = Scheduler::new(app.state.queue.clone(), app.state.processor.clone());
    tokio::spawn(scheduler.run(rx));
    app._shutdown = Some(tx);
    app
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 200, 255])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Encode a multipart body with a `file` part and optional text fields.
pub fn multipart_body(filename: &str, bytes: &[u8], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_upload(
    app: &Router,
    uri: &str,
    client: &str,
    filename: &str,
    bytes: &[u8],
    fields: &[(&str, &str)],
) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("x-forwarded-for", client)
        .body(Body::from(multipart_body(filename, bytes, fields)))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(
    app: &Router,
    uri: &str,
    client: &str,
    body: serde_json::Value,
) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", client)
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Poll `/queue/job/{id}` until the job is completed or failed.
pub async fn wait_for_terminal(app: &Router, job_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let status = body_json(get(app, &format!("/queue/job/{job_id}")).await).await;
        match status["status"].as_str() {
            Some("completed") | Some("failed") => return status,
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
    panic!("job {job_id} did not finish in time");
}
