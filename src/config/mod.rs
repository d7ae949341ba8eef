use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:5001").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding processed results.
    #[serde(default = "default_output_folder")]
    pub output_folder: String,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Jobs allowed in `Processing` at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Jobs allowed to wait for dispatch.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Live (queued + processing) jobs allowed per client.
    #[serde(default = "default_max_per_client")]
    pub max_per_client: usize,

    /// Payloads below this size may run inline when the service is idle.
    #[serde(default = "default_inline_size_threshold")]
    pub inline_size_threshold: usize,

    /// Finished jobs kept around for delayed retrieval.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Per-job execution limit in seconds. 0 disables the limit.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Stored results older than this are removed at startup.
    #[serde(default = "default_file_max_age_secs")]
    pub file_max_age_secs: u64,

    /// rembg-compatible removal endpoint.
    #[serde(default = "default_rembg_url")]
    pub rembg_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_output_folder() -> String {
    "outputs".to_string()
}

fn default_max_content_length() -> usize {
    16 * 1024 * 1024
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_max_queue_size() -> usize {
    20
}

fn default_max_per_client() -> usize {
    2
}

fn default_inline_size_threshold() -> usize {
    5 * 1024 * 1024
}

fn default_completed_retention() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    5000
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_file_max_age_secs() -> u64 {
    3600
}

fn default_rembg_url() -> String {
    "http://127.0.0.1:7000/api/remove".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Limits and timings consumed by the job queue and dispatcher.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_queue_size: self.max_queue_size,
            max_per_client: self.max_per_client,
            inline_size_threshold: self.inline_size_threshold,
            completed_retention: self.completed_retention,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            output_folder: default_output_folder(),
            max_content_length: default_max_content_length(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            max_per_client: default_max_per_client(),
            inline_size_threshold: default_inline_size_threshold(),
            completed_retention: default_completed_retention(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            file_max_age_secs: default_file_max_age_secs(),
            rembg_url: default_rembg_url(),
        }
    }
}

/// Admission and scheduling policy.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
    pub max_per_client: usize,
    pub inline_size_threshold: usize,
    pub completed_retention: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub job_timeout: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            max_per_client: default_max_per_client(),
            inline_size_threshold: default_inline_size_threshold(),
            completed_retention: default_completed_retention(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            error_backoff: Duration::from_millis(default_error_backoff_ms()),
            job_timeout: Some(Duration::from_secs(default_job_timeout_secs())),
        }
    }
}
