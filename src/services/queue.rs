use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::config::QueueSettings;
use crate::models::api::{JobStatusView, QueueSnapshot};
use crate::models::job::{Job, JobId, JobKind, JobPayload, JobResult, TransitionError};
use crate::services::retrieval::RetrievalError;
use crate::services::store::JobStore;

const RECENT_JOBS_LIMIT: usize = 10;

/// Where a "smart" request should run.
pub enum Route<'a> {
    /// Run now. The slot counts against `max_concurrent_jobs` until dropped.
    Inline(InlineSlot<'a>),
    Enqueue,
}

/// Concurrency slot held by an inline run.
pub struct InlineSlot<'a> {
    queue: &'a JobQueue,
}

impl Drop for InlineSlot<'_> {
    fn drop(&mut self) {
        let remaining = self.queue.inline_active.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("bg_jobs_inline_active").set(remaining as f64);
        self.queue.wakeup.notify_one();
    }
}

/// Outcome of a terminal transition.
#[derive(Debug, Default)]
pub struct Retired {
    /// False when the job was unknown or already terminal.
    pub applied: bool,
    /// Storage keys of results whose records fell out of retention.
    pub expired_results: Vec<String>,
}

/// A job handed out by [`JobQueue::dispatch_next`], already `Processing`.
#[derive(Debug)]
pub struct DispatchedJob {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
}

/// Shared job queue and store.
///
/// Every read-modify-write against the store happens inside one critical
/// section on `store`; nothing awaits while holding the lock.
pub struct JobQueue {
    store: Mutex<JobStore>,
    settings: QueueSettings,
    next_seq: AtomicU64,
    /// Inline runs in flight. Only incremented while `store` is locked.
    inline_active: AtomicUsize,
    wakeup: Notify,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            store: Mutex::new(JobStore::new(settings.completed_retention)),
            settings,
            next_seq: AtomicU64::new(1),
            inline_active: AtomicUsize::new(0),
            wakeup: Notify::new(),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Admit a job: capacity check, per-client check, then insert.
    pub async fn submit(
        &self,
        kind: JobKind,
        client_key: &str,
        payload: JobPayload,
    ) -> Result<JobId, AdmissionError> {
        let mut store = self.store.lock().await;

        if store.queued_len() >= self.settings.max_queue_size {
            metrics::counter!("bg_jobs_rejected_total", "reason" => "queue_full").increment(1);
            tracing::warn!(client = %client_key, queued = store.queued_len(), "Queue full, rejecting job");
            return Err(AdmissionError::QueueFull {
                max_queue_size: self.settings.max_queue_size,
            });
        }

        let live = store.live_count_for_client(client_key);
        if live >= self.settings.max_per_client {
            metrics::counter!("bg_jobs_rejected_total", "reason" => "too_many_from_client")
                .increment(1);
            tracing::warn!(client = %client_key, live, "Per-client limit reached, rejecting job");
            return Err(AdmissionError::TooManyFromClient {
                max_per_client: self.settings.max_per_client,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(seq, kind, client_key.to_string(), payload);
        let id = job.id.clone();
        store.enqueue(job);

        metrics::counter!("bg_jobs_submitted_total").increment(1);
        metrics::gauge!("bg_queue_depth").set(store.queued_len() as f64);
        tracing::info!(
            job_id = %id,
            kind = %kind,
            client = %client_key,
            position = store.queue_position(&id),
            "Job queued"
        );
        drop(store);

        self.wakeup.notify_one();
        Ok(id)
    }

    /// Inline iff a slot is free, nothing is waiting, and the payload is
    /// small. The slot is reserved in the same critical section.
    pub async fn route(&self, payload_len: usize) -> Route<'_> {
        let store = self.store.lock().await;
        if self.active_count(&store) < self.settings.max_concurrent_jobs
            && store.queued_len() == 0
            && payload_len < self.settings.inline_size_threshold
        {
            let active = self.inline_active.fetch_add(1, Ordering::AcqRel) + 1;
            metrics::gauge!("bg_jobs_inline_active").set(active as f64);
            Route::Inline(InlineSlot { queue: self })
        } else {
            Route::Enqueue
        }
    }

    /// Queued jobs in `Processing` plus inline runs.
    fn active_count(&self, store: &JobStore) -> usize {
        store.processing_count() + self.inline_active.load(Ordering::Acquire)
    }

    /// Pop the queue head and mark it `Processing`, if a slot is free.
    pub async fn dispatch_next(&self) -> Result<Option<DispatchedJob>, DispatchError> {
        let mut store = self.store.lock().await;
        if self.active_count(&store) >= self.settings.max_concurrent_jobs {
            return Ok(None);
        }
        let Some(id) = store.pop_queued() else {
            return Ok(None);
        };

        let Some(job) = store.get_live_mut(&id) else {
            return Err(DispatchError::MissingRecord(id));
        };
        let kind = job.kind;
        match job.start() {
            Ok(payload) => {
                metrics::gauge!("bg_queue_depth").set(store.queued_len() as f64);
                metrics::gauge!("bg_jobs_active").set(store.processing_count() as f64);
                Ok(Some(DispatchedJob { id, kind, payload }))
            }
            Err(source) => {
                // Off the queue already; retire it so it stops counting
                // against its client
                let _ = job.fail(format!("Could not be started: {}", source));
                metrics::counter!("bg_jobs_failed_total").increment(1);
                let expired_results = self.retire(&mut store, &id);
                Err(DispatchError::Unstartable {
                    source,
                    expired_results,
                })
            }
        }
    }

    pub async fn record_progress(&self, id: &JobId, progress: u8, message: &str) {
        let mut store = self.store.lock().await;
        if let Some(job) = store.get_live_mut(id) {
            job.record_progress(progress, message);
            tracing::debug!(job_id = %id, progress = job.progress(), step = message, "Job progress");
        }
    }

    /// `Processing -> Completed`, then retire the record.
    pub async fn complete(&self, id: &JobId, result: JobResult) -> Retired {
        let mut store = self.store.lock().await;
        let Some(job) = store.get_live_mut(id) else {
            tracing::warn!(job_id = %id, "Completion for unknown or retired job");
            return Retired::default();
        };
        if let Err(e) = job.complete(result) {
            tracing::warn!(job_id = %id, error = %e, "Rejected completion");
            return Retired::default();
        }
        if let Some(started) = job.started_at() {
            let elapsed = (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("bg_processing_seconds").record(elapsed);
        }
        metrics::counter!("bg_jobs_completed_total").increment(1);
        Retired {
            applied: true,
            expired_results: self.retire(&mut store, id),
        }
    }

    /// Any non-terminal state -> `Failed`, then retire the record.
    pub async fn fail(&self, id: &JobId, reason: &str) -> Retired {
        let mut store = self.store.lock().await;
        let Some(job) = store.get_live_mut(id) else {
            return Retired::default();
        };
        if let Err(e) = job.fail(reason) {
            tracing::warn!(job_id = %id, error = %e, "Rejected failure transition");
            return Retired::default();
        }
        metrics::counter!("bg_jobs_failed_total").increment(1);
        tracing::warn!(job_id = %id, reason, "Job failed");
        Retired {
            applied: true,
            expired_results: self.retire(&mut store, id),
        }
    }

    /// Move a terminal job to retention. Returns the storage keys of
    /// evicted results; the caller deletes them once the lock is released.
    fn retire(&self, store: &mut JobStore, id: &JobId) -> Vec<String> {
        let expired = store
            .move_to_completed(id)
            .into_iter()
            .filter_map(|evicted| {
                tracing::debug!(job_id = %evicted.id, "Evicted finished job from retention");
                evicted.result().map(|result| result.storage_key.clone())
            })
            .collect();
        metrics::gauge!("bg_jobs_active").set(store.processing_count() as f64);
        metrics::gauge!("bg_queue_depth").set(store.queued_len() as f64);
        self.wakeup.notify_one();
        expired
    }

    pub async fn status(&self, id: &JobId) -> Option<JobStatusView> {
        let store = self.store.lock().await;
        let job = store.get(id)?;
        Some(JobStatusView {
            job_id: job.id.clone(),
            kind: job.kind,
            status: job.state(),
            progress: job.progress(),
            message: job.status_message().to_string(),
            created_at: job.created_at,
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            queue_position: store.queue_position(id),
            error: job.failure_reason().map(str::to_string),
            result: job.result().map(|r| r.metadata.clone()),
        })
    }

    /// Result record of a job that finished successfully.
    pub async fn completed_result(&self, id: &JobId) -> Result<JobResult, RetrievalError> {
        let store = self.store.lock().await;
        if let Some(job) = store.get_completed(id) {
            return job
                .result()
                .cloned()
                .ok_or_else(|| RetrievalError::NotCompleted {
                    id: id.clone(),
                    state: job.state(),
                });
        }
        match store.get(id) {
            Some(job) => Err(RetrievalError::NotCompleted {
                id: id.clone(),
                state: job.state(),
            }),
            None => Err(RetrievalError::NotFound(id.clone())),
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let store = self.store.lock().await;
        QueueSnapshot {
            queue_length: store.queued_len(),
            active_jobs: store.processing_count(),
            inline_jobs: self.inline_active.load(Ordering::Acquire),
            queued_jobs: store.queued_len(),
            completed_jobs: store.completed_len(),
            max_concurrent_jobs: self.settings.max_concurrent_jobs,
            max_queue_size: self.settings.max_queue_size,
            recent_jobs: store.recent_jobs(RECENT_JOBS_LIMIT),
        }
    }

    /// Park until work may be available or `timeout` elapses.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wakeup.notified()).await;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Queue is full ({max_queue_size} jobs waiting), try again later")]
    QueueFull { max_queue_size: usize },

    #[error("Too many active jobs for this client (limit {max_per_client})")]
    TooManyFromClient { max_per_client: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Queued job {0} has no live record")]
    MissingRecord(JobId),

    #[error("Queued job could not be started: {source}")]
    Unstartable {
        #[source]
        source: TransitionError,
        /// Results evicted while retiring the job.
        expired_results: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobState, OutputFormat, ProcessingOptions, ResultMetadata};

    fn settings(max_concurrent: usize, max_queue: usize, per_client: usize) -> QueueSettings {
        QueueSettings {
            max_concurrent_jobs: max_concurrent,
            max_queue_size: max_queue,
            max_per_client: per_client,
            ..QueueSettings::default()
        }
    }

    fn payload() -> JobPayload {
        JobPayload::new(vec![0; 32], ProcessingOptions::default())
    }

    fn result_for(id: &JobId) -> JobResult {
        JobResult {
            storage_key: format!("{}.png", id),
            format: OutputFormat::Png,
            metadata: ResultMetadata::new(2, 2, 32, 16),
        }
    }

    #[tokio::test]
    async fn test_queue_full_rejects_without_creating_job() {
        let queue = JobQueue::new(settings(1, 2, 10));
        queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        queue.submit(JobKind::DirectUpload, "b", payload()).await.unwrap();

        let err = queue
            .submit(JobKind::DirectUpload, "c", payload())
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { max_queue_size: 2 });

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.queue_length, 2);
        assert_eq!(snapshot.recent_jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_per_client_limit_counts_queued_and_processing() {
        let queue = JobQueue::new(settings(1, 10, 2));
        let first = queue.submit(JobKind::Preview, "same", payload()).await.unwrap();
        queue.submit(JobKind::Preview, "same", payload()).await.unwrap();

        let dispatched = queue.dispatch_next().await.unwrap().unwrap();
        assert_eq!(dispatched.id, first);

        let err = queue
            .submit(JobKind::Preview, "same", payload())
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::TooManyFromClient { max_per_client: 2 });
        assert!(queue.submit(JobKind::Preview, "other", payload()).await.is_ok());

        assert!(queue.complete(&first, result_for(&first)).await.applied);
        assert!(queue.submit(JobKind::Preview, "same", payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_respect_capacity() {
        let queue = std::sync::Arc::new(JobQueue::new(settings(1, 5, 100)));
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .submit(JobKind::DirectUpload, &format!("client-{i}"), payload())
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let accepted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(accepted, 5);
        assert_eq!(queue.snapshot().await.queue_length, 5);
    }

    #[tokio::test]
    async fn test_dispatch_is_fifo_and_capped() {
        let queue = JobQueue::new(settings(2, 10, 10));
        let a = queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        let b = queue.submit(JobKind::DirectUpload, "b", payload()).await.unwrap();
        let c = queue.submit(JobKind::DirectUpload, "c", payload()).await.unwrap();

        assert_eq!(queue.dispatch_next().await.unwrap().unwrap().id, a);
        assert_eq!(queue.dispatch_next().await.unwrap().unwrap().id, b);
        assert!(queue.dispatch_next().await.unwrap().is_none());

        let status = queue.status(&c).await.unwrap();
        assert_eq!(status.status, JobState::Queued);
        assert_eq!(status.queue_position, 1);

        queue.fail(&a, "boom").await;
        assert_eq!(queue.dispatch_next().await.unwrap().unwrap().id, c);
        assert_eq!(queue.snapshot().await.active_jobs, 2);
    }

    #[tokio::test]
    async fn test_route_decision() {
        let queue = JobQueue::new(QueueSettings {
            inline_size_threshold: 100,
            ..settings(1, 10, 10)
        });
        assert!(matches!(queue.route(10).await, Route::Inline(_)));
        assert!(matches!(queue.route(100).await, Route::Enqueue));

        queue.submit(JobKind::DirectBase64, "a", payload()).await.unwrap();
        assert!(matches!(queue.route(10).await, Route::Enqueue));

        queue.dispatch_next().await.unwrap().unwrap();
        assert!(matches!(queue.route(10).await, Route::Enqueue));
    }

    #[tokio::test]
    async fn test_inline_run_holds_a_concurrency_slot() {
        let queue = JobQueue::new(QueueSettings {
            inline_size_threshold: 100,
            ..settings(1, 10, 10)
        });

        let slot = queue.route(10).await;
        assert!(matches!(slot, Route::Inline(_)));
        assert_eq!(queue.snapshot().await.inline_jobs, 1);

        // The only slot is taken: no second inline run, no dispatch
        assert!(matches!(queue.route(10).await, Route::Enqueue));
        queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        assert!(queue.dispatch_next().await.unwrap().is_none());

        drop(slot);
        assert_eq!(queue.snapshot().await.inline_jobs, 0);
        assert!(queue.dispatch_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_routing_reserves_at_most_the_cap() {
        let queue = std::sync::Arc::new(JobQueue::new(QueueSettings {
            inline_size_threshold: 100,
            ..settings(2, 10, 10)
        }));
        let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(8));
        let peak = std::sync::Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (queue, barrier, peak) = (queue.clone(), barrier.clone(), peak.clone());
                tokio::spawn(async move {
                    let route = queue.route(10).await;
                    let inline = matches!(route, Route::Inline(_));
                    if inline {
                        let running = queue.snapshot().await.inline_jobs;
                        peak.fetch_max(running, Ordering::SeqCst);
                    }
                    // Every task holds its decision until all have routed
                    barrier.wait().await;
                    inline
                })
            })
            .collect();

        let inline = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(inline, 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.snapshot().await.inline_jobs, 0);
    }

    #[tokio::test]
    async fn test_unstartable_job_is_retired() {
        let queue = JobQueue::new(settings(1, 10, 1));
        let id = queue.submit(JobKind::DirectUpload, "same", payload()).await.unwrap();

        // A record that is no longer `Queued` cannot be started
        queue
            .store
            .lock()
            .await
            .get_live_mut(&id)
            .unwrap()
            .fail("cancelled")
            .unwrap();

        assert!(matches!(
            queue.dispatch_next().await,
            Err(DispatchError::Unstartable { .. })
        ));
        assert_eq!(queue.status(&id).await.unwrap().status, JobState::Failed);
        assert_eq!(queue.snapshot().await.queue_length, 0);
        assert!(queue.submit(JobKind::DirectUpload, "same", payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_reports_expired_result_keys() {
        let queue = JobQueue::new(QueueSettings {
            completed_retention: 1,
            ..settings(1, 10, 10)
        });
        let first = queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        let second = queue.submit(JobKind::DirectUpload, "b", payload()).await.unwrap();

        queue.dispatch_next().await.unwrap().unwrap();
        let retired = queue.complete(&first, result_for(&first)).await;
        assert!(retired.applied);
        assert!(retired.expired_results.is_empty());

        queue.dispatch_next().await.unwrap().unwrap();
        let retired = queue.fail(&second, "boom").await;
        assert_eq!(retired.expired_results, vec![format!("{}.png", first)]);
        assert!(queue.status(&first).await.is_none());
    }

    #[tokio::test]
    async fn test_completed_result_distinguishes_errors() {
        let queue = JobQueue::new(settings(2, 10, 10));
        let ok = queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        let bad = queue.submit(JobKind::DirectUpload, "b", payload()).await.unwrap();

        assert!(matches!(
            queue.completed_result(&ok).await,
            Err(RetrievalError::NotCompleted { state: JobState::Queued, .. })
        ));

        queue.dispatch_next().await.unwrap();
        queue.dispatch_next().await.unwrap();
        queue.complete(&ok, result_for(&ok)).await;
        queue.fail(&bad, "invalid image").await;

        assert_eq!(queue.completed_result(&ok).await.unwrap().metadata.width, 2);
        assert!(matches!(
            queue.completed_result(&bad).await,
            Err(RetrievalError::NotCompleted { state: JobState::Failed, .. })
        ));
        assert!(matches!(
            queue.completed_result(&JobId::from("nope".to_string())).await,
            Err(RetrievalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_job_not_mutated_again() {
        let queue = JobQueue::new(settings(1, 10, 10));
        let id = queue.submit(JobKind::DirectUpload, "a", payload()).await.unwrap();
        queue.dispatch_next().await.unwrap();
        assert!(queue.complete(&id, result_for(&id)).await.applied);
        assert!(!queue.fail(&id, "late").await.applied);

        let status = queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert_eq!(status.queue_position, 0);
    }
}
