use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// Identifier of a tracked job.
///
/// Built from a process-wide sequence number and the creation time, so ids
/// are unique and sort in creation order when compared by `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(seq: u64, created_at: DateTime<Utc>) -> Self {
        Self(format!("job_{}_{}", seq, created_at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which endpoint family produced the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    DirectUpload,
    DirectBase64,
    Preview,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Encoded output format.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "png")]
    Png,
    #[serde(alias = "jpeg", alias = "jpg", alias = "JPG")]
    #[strum(to_string = "JPEG", serialize = "JPG")]
    Jpeg,
    #[serde(alias = "webp")]
    Webp,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// Longest edge used for preview jobs when the caller gives no cap.
pub const PREVIEW_MAX_DIMENSION: u32 = 1024;

/// Output options attached to a submission.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessingOptions {
    #[garde(skip)]
    #[serde(default)]
    pub format: OutputFormat,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_quality")]
    pub quality: u8,

    #[garde(range(min = 1))]
    #[serde(default)]
    pub max_width: Option<u32>,

    #[garde(range(min = 1))]
    #[serde(default)]
    pub max_height: Option<u32>,

    #[garde(skip)]
    #[serde(default)]
    pub preview: bool,
}

fn default_quality() -> u8 {
    85
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            quality: default_quality(),
            max_width: None,
            max_height: None,
            preview: false,
        }
    }
}

impl ProcessingOptions {
    /// Dimension caps actually applied, including the preview default.
    pub fn dimension_caps(&self) -> (Option<u32>, Option<u32>) {
        if self.preview {
            (
                Some(self.max_width.unwrap_or(PREVIEW_MAX_DIMENSION)),
                Some(self.max_height.unwrap_or(PREVIEW_MAX_DIMENSION)),
            )
        } else {
            (self.max_width, self.max_height)
        }
    }
}

/// Raw input plus the requested output options.
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub bytes: Vec<u8>,
    pub options: ProcessingOptions,
}

impl JobPayload {
    pub fn new(bytes: Vec<u8>, options: ProcessingOptions) -> Self {
        Self { bytes, options }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Derived facts about a produced image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub width: u32,
    pub height: u32,
    pub original_size: usize,
    pub optimized_size: usize,
    pub compression_ratio: f64,
}

impl ResultMetadata {
    pub fn new(width: u32, height: u32, original_size: usize, optimized_size: usize) -> Self {
        Self {
            width,
            height,
            original_size,
            optimized_size,
            compression_ratio: compression_ratio(original_size, optimized_size),
        }
    }
}

/// `1 - optimized/original`, reported as 0 when the original is empty.
pub fn compression_ratio(original_size: usize, optimized_size: usize) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    1.0 - optimized_size as f64 / original_size as f64
}

/// Output of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub storage_key: String,
    pub format: OutputFormat,
    pub metadata: ResultMetadata,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition for job {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// A tracked unit of background-removal work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub seq: u64,
    pub kind: JobKind,
    pub client_key: String,
    payload: Option<JobPayload>,
    state: JobState,
    progress: u8,
    status_message: String,
    pub created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<JobResult>,
    failure_reason: Option<String>,
}

impl Job {
    pub fn new(seq: u64, kind: JobKind, client_key: String, payload: JobPayload) -> Self {
        let created_at = Utc::now();
        Self {
            id: JobId::new(seq, created_at),
            seq,
            kind,
            client_key,
            payload: Some(payload),
            state: JobState::Queued,
            progress: 0,
            status_message: "Waiting in queue".to_string(),
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            failure_reason: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `Queued -> Processing`. Hands the payload to the caller; the record
    /// keeps no copy of the input once dispatched.
    pub fn start(&mut self) -> Result<JobPayload, TransitionError> {
        let payload = match (self.state, self.payload.take()) {
            (JobState::Queued, Some(payload)) => payload,
            (_, payload) => {
                self.payload = payload;
                return Err(self.transition_error(JobState::Processing));
            }
        };
        self.state = JobState::Processing;
        self.started_at = Some(Utc::now());
        self.status_message = "Processing started".to_string();
        Ok(payload)
    }

    /// Record a checkpoint. Ignored for terminal jobs; values below the
    /// current progress and 100 itself are clamped so only a terminal
    /// transition reaches 100.
    pub fn record_progress(&mut self, progress: u8, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.progress = self.progress.max(progress.min(99));
        self.status_message = message.into();
    }

    pub fn complete(&mut self, result: JobResult) -> Result<(), TransitionError> {
        if self.state != JobState::Processing {
            return Err(self.transition_error(JobState::Completed));
        }
        self.state = JobState::Completed;
        self.progress = 100;
        self.status_message = "Completed".to_string();
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    /// Any non-terminal job may fail.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(self.transition_error(JobState::Failed));
        }
        let reason = reason.into();
        self.state = JobState::Failed;
        self.progress = 100;
        self.status_message = format!("Failed: {}", reason);
        self.completed_at = Some(Utc::now());
        self.payload = None;
        self.failure_reason = Some(reason);
        Ok(())
    }

    fn transition_error(&self, to: JobState) -> TransitionError {
        TransitionError {
            id: self.id.clone(),
            from: self.state,
            to,
        }
    }
}
