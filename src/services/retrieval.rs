use crate::models::api::JobStatusView;
use crate::models::job::{JobId, JobState, OutputFormat, ResultMetadata};
use crate::services::queue::JobQueue;
use crate::services::storage::{ResultStorage, StorageError};

/// Output bytes of a completed job plus the metadata computed when it ran.
#[derive(Debug, Clone)]
pub struct ResultBlob {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub metadata: ResultMetadata,
}

impl ResultBlob {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }
}

pub async fn get_status(queue: &JobQueue, id: &JobId) -> Result<JobStatusView, RetrievalError> {
    queue
        .status(id)
        .await
        .ok_or_else(|| RetrievalError::NotFound(id.clone()))
}

/// Fetch the output of a `Completed` job whose blob is still stored.
pub async fn get_result(
    queue: &JobQueue,
    storage: &ResultStorage,
    id: &JobId,
) -> Result<ResultBlob, RetrievalError> {
    let result = queue.completed_result(id).await?;

    let bytes = match storage.get(&result.storage_key).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            tracing::warn!(job_id = %id, key = %result.storage_key, "Result file missing");
            return Err(RetrievalError::ResultMissing(id.clone()));
        }
        Err(e) => return Err(RetrievalError::Storage(e)),
    };

    Ok(ResultBlob {
        bytes,
        format: result.format,
        metadata: result.metadata,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} is not completed (status: {state})")]
    NotCompleted { id: JobId, state: JobState },

    #[error("Result for job {0} is no longer available")]
    ResultMissing(JobId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
