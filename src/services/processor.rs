use std::sync::Arc;

use async_trait::async_trait;

use crate::models::job::{JobId, JobPayload, JobResult, OutputFormat, ResultMetadata};
use crate::services::queue::{DispatchedJob, JobQueue};
use crate::services::remover::{BackgroundRemover, RemoverError};
use crate::services::storage::{ResultStorage, StorageError};
use crate::services::transform::{ImageOptimizer, TransformError};

/// Receives checkpoint updates while an image is processed.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// Writes checkpoints to the job record.
pub struct QueueProgress<'a> {
    pub queue: &'a JobQueue,
    pub id: &'a JobId,
}

#[async_trait]
impl<'a> ProgressReporter for QueueProgress<'a> {
    async fn report(&self, progress: u8, message: &str) {
        self.queue.record_progress(self.id, progress, message).await;
    }
}

/// Inline runs have no record to update.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, progress: u8, message: &str) {
        tracing::trace!(progress, step = message, "Inline progress");
    }
}

/// Final image plus the metadata reported to clients.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub metadata: ResultMetadata,
    /// False when optimization failed and the raw removal output was kept.
    pub optimized: bool,
}

/// Runs one image through validate -> remove -> optimize, and for queued
/// jobs persists the output and finalizes the record.
pub struct Processor {
    optimizer: ImageOptimizer,
    remover: Arc<dyn BackgroundRemover>,
    storage: Arc<ResultStorage>,
}

impl Processor {
    pub fn new(remover: Arc<dyn BackgroundRemover>, storage: Arc<ResultStorage>) -> Self {
        Self {
            optimizer: ImageOptimizer,
            remover,
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<ResultStorage> {
        &self.storage
    }

    /// Shared pipeline for the queued and inline paths.
    pub async fn process(
        &self,
        payload: &JobPayload,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessedImage, ProcessingError> {
        progress.report(10, "Validating image").await;
        let info = self
            .optimizer
            .validate(&payload.bytes)
            .map_err(ProcessingError::Validation)?;

        progress.report(30, "Removing background").await;
        let removed = self
            .remover
            .remove(&payload.bytes)
            .await
            .map_err(ProcessingError::Removal)?;

        progress.report(60, "Optimizing output").await;
        let optimizer = self.optimizer;
        let options = payload.options.clone();
        let removed = Arc::new(removed);
        let source = removed.clone();
        let optimized =
            tokio::task::spawn_blocking(move || optimizer.optimize(&source, &options)).await;

        let original_size = payload.len();
        let image = match optimized {
            Ok(Ok(out)) => ProcessedImage {
                metadata: ResultMetadata::new(out.width, out.height, original_size, out.bytes.len()),
                bytes: out.bytes,
                format: payload.options.format,
                optimized: true,
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Optimization failed, keeping unoptimized output");
                self.unoptimized(removed, original_size, (info.width, info.height))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Optimization task aborted, keeping unoptimized output");
                self.unoptimized(removed, original_size, (info.width, info.height))
            }
        };
        Ok(image)
    }

    fn unoptimized(
        &self,
        removed: Arc<Vec<u8>>,
        original_size: usize,
        fallback_dims: (u32, u32),
    ) -> ProcessedImage {
        let bytes = Arc::try_unwrap(removed).unwrap_or_else(|shared| (*shared).clone());
        let (width, height) = self.optimizer.dimensions(&bytes).unwrap_or(fallback_dims);
        ProcessedImage {
            metadata: ResultMetadata::new(width, height, original_size, bytes.len()),
            bytes,
            format: OutputFormat::Png,
            optimized: false,
        }
    }

    /// Synchronous path for small jobs on an idle service. Nothing is
    /// recorded in the job store.
    pub async fn process_inline(
        &self,
        payload: &JobPayload,
    ) -> Result<ProcessedImage, ProcessingError> {
        metrics::counter!("bg_jobs_inline_total").increment(1);
        self.process(payload, &NoProgress).await
    }

    /// Execute a dispatched job to a terminal state.
    pub async fn run_job(&self, queue: &JobQueue, job: DispatchedJob) {
        let DispatchedJob { id, kind, payload } = job;
        tracing::info!(job_id = %id, kind = %kind, size = payload.len(), "Processing job");
        let progress = QueueProgress { queue, id: &id };

        let outcome = match self.process(&payload, &progress).await {
            Ok(image) => {
                progress.report(80, "Saving result").await;
                self.persist(&id, image).await
            }
            Err(e) => Err(e),
        };

        let retired = match outcome {
            Ok(result) => {
                tracing::info!(
                    job_id = %id,
                    width = result.metadata.width,
                    height = result.metadata.height,
                    optimized_size = result.metadata.optimized_size,
                    compression_ratio = result.metadata.compression_ratio,
                    "Job completed successfully"
                );
                let storage_key = result.storage_key.clone();
                let retired = queue.complete(&id, result).await;
                if !retired.applied {
                    // Already terminal, e.g. failed by the timeout supervisor
                    self.discard_results(&[storage_key]).await;
                }
                retired
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Job processing failed");
                queue.fail(&id, &e.to_string()).await
            }
        };
        self.discard_results(&retired.expired_results).await;
    }

    /// Delete stored outputs whose job records fell out of retention.
    pub async fn discard_results(&self, keys: &[String]) {
        for key in keys {
            match self.storage.delete(key).await {
                Ok(()) => tracing::debug!(key = %key, "Deleted expired result"),
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to delete expired result"),
            }
        }
    }

    async fn persist(&self, id: &JobId, image: ProcessedImage) -> Result<JobResult, ProcessingError> {
        let storage_key = format!("{}_output.{}", id, image.format.extension());
        self.storage
            .put(&storage_key, &image.bytes)
            .await
            .map_err(ProcessingError::Storage)?;
        Ok(JobResult {
            storage_key,
            format: image.format,
            metadata: image.metadata,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Validation(#[source] TransformError),

    #[error("Failed to process image: {0}")]
    Removal(#[source] RemoverError),

    #[error("Failed to save result: {0}")]
    Storage(#[source] StorageError),
}

impl ProcessingError {
    /// Bad input rather than a server-side fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProcessingError::Validation(_))
    }
}
