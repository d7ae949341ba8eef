use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{JobId, JobKind, JobState, OutputFormat, ResultMetadata};

/// Response after a job has been admitted to the queue.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobState,
    pub queue_position: usize,
    pub message: String,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobState,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based position while queued, 0 otherwise.
    pub queue_position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMetadata>,
}

/// Short entry in the queue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentJob {
    pub job_id: JobId,
    pub status: JobState,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue_length: usize,
    pub active_jobs: usize,
    /// Requests being processed inline, outside the queue.
    pub inline_jobs: usize,
    pub queued_jobs: usize,
    pub completed_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
    pub recent_jobs: Vec<RecentJob>,
}

/// JSON body accepted by the base64 endpoint.
#[derive(Debug, Deserialize)]
pub struct Base64Request {
    pub image: Option<String>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Base64Response {
    pub success: bool,
    pub image: String,
    pub mimetype: String,
    pub processing_id: uuid::Uuid,
    pub metadata: ResultMetadata,
}
