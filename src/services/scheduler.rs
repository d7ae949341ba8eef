use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::services::processor::Processor;
use crate::services::queue::{DispatchError, DispatchedJob, JobQueue};

/// Dispatch loop: moves queued jobs into free worker slots.
///
/// Workers are fire-and-forget; each runs under a supervisor task that
/// turns a panic or timeout into a `Failed` record.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    processor: Arc<Processor>,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<Processor>) -> Self {
        Self { queue, processor }
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.queue.settings().clone();
        tracing::info!(
            max_concurrent_jobs = settings.max_concurrent_jobs,
            max_queue_size = settings.max_queue_size,
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.dispatch_ready().await {
                Ok(0) => {
                    tracing::trace!("Nothing to dispatch, waiting");
                    settings.poll_interval
                }
                Ok(dispatched) => {
                    tracing::debug!(dispatched, "Dispatched jobs");
                    settings.poll_interval
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler error, backing off");
                    // The backoff is not interruptible by new work
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep(settings.error_backoff) => {}
                    }
                    continue;
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.wait_for_work(wait) => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Dispatch as many jobs as free slots allow. Returns how many started.
    pub async fn dispatch_ready(&self) -> Result<usize, DispatchError> {
        let mut dispatched = 0;
        loop {
            match self.queue.dispatch_next().await {
                Ok(Some(job)) => {
                    tracing::info!(job_id = %job.id, kind = %job.kind, "Dispatching job");
                    self.spawn_worker(job);
                    dispatched += 1;
                }
                Ok(None) => return Ok(dispatched),
                Err(e) => {
                    if let DispatchError::Unstartable {
                        expired_results, ..
                    } = &e
                    {
                        self.processor.discard_results(expired_results).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn spawn_worker(&self, job: DispatchedJob) {
        let queue = self.queue.clone();
        let processor = self.processor.clone();
        let timeout = queue.settings().job_timeout;
        let id = job.id.clone();

        tokio::spawn(async move {
            let worker = {
                let queue = queue.clone();
                let processor = processor.clone();
                tokio::spawn(async move { processor.run_job(&queue, job).await })
            };
            let abort = worker.abort_handle();

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, worker).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        let reason = format!("Processing timed out after {} seconds", limit.as_secs());
                        tracing::error!(job_id = %id, "Worker timed out");
                        let retired = queue.fail(&id, &reason).await;
                        processor.discard_results(&retired.expired_results).await;
                        return;
                    }
                },
                None => worker.await,
            };

            if let Err(e) = joined {
                tracing::error!(job_id = %id, error = %e, "Worker crashed");
                let retired = queue.fail(&id, &format!("Worker crashed: {}", e)).await;
                processor.discard_results(&retired.expired_results).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::models::job::{JobId, JobKind, JobPayload, JobState, ProcessingOptions};
    use crate::services::remover::{BackgroundRemover, RemoverError};
    use crate::services::storage::ResultStorage;
    use crate::services::transform::tests::png_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps before echoing, tracking how many calls overlap.
    struct SlowRemover {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowRemover {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackgroundRemover for SlowRemover {
        async fn remove(&self, image: &[u8]) -> Result<Vec<u8>, RemoverError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(image.to_vec())
        }
    }

    struct PanickingRemover;

    #[async_trait]
    impl BackgroundRemover for PanickingRemover {
        async fn remove(&self, _image: &[u8]) -> Result<Vec<u8>, RemoverError> {
            panic!("native library aborted");
        }
    }

    fn settings(max_concurrent: usize) -> QueueSettings {
        QueueSettings {
            max_concurrent_jobs: max_concurrent,
            max_queue_size: 10,
            max_per_client: 10,
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(50),
            ..QueueSettings::default()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        queue: Arc<JobQueue>,
        shutdown: watch::Sender<bool>,
    }

    async fn start(settings: QueueSettings, remover: Arc<dyn BackgroundRemover>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(ResultStorage::new(dir.path()).await.unwrap());
        let processor = Arc::new(Processor::new(remover, storage));
        let queue = Arc::new(JobQueue::new(settings));
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(Scheduler::new(queue.clone(), processor).run(rx));
        Harness {
            _dir: dir,
            queue,
            shutdown,
        }
    }

    async fn submit(queue: &JobQueue) -> JobId {
        queue
            .submit(
                JobKind::DirectUpload,
                "client",
                JobPayload::new(png_bytes(4, 4), ProcessingOptions::default()),
            )
            .await
            .unwrap()
    }

    async fn wait_terminal(queue: &JobQueue, ids: &[JobId], max_active: usize) {
        for _ in 0..500 {
            let snapshot = queue.snapshot().await;
            assert!(snapshot.active_jobs <= max_active, "too many active jobs");

            let mut done = true;
            for id in ids {
                if !queue.status(id).await.unwrap().status.is_terminal() {
                    done = false;
                }
            }
            if done {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not finish in time");
    }

    #[tokio::test]
    async fn test_single_slot_runs_jobs_in_submission_order() {
        let remover = Arc::new(SlowRemover::new(Duration::from_millis(100)));
        let harness = start(settings(1), remover.clone()).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(submit(&harness.queue).await);
        }
        wait_terminal(&harness.queue, &ids, 1).await;

        let mut finished = Vec::new();
        for id in &ids {
            let status = harness.queue.status(id).await.unwrap();
            assert_eq!(status.status, JobState::Completed);
            finished.push((status.started_at.unwrap(), status.completed_at.unwrap()));
        }
        assert!(finished.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].1 <= w[1].1));
        assert_eq!(remover.peak.load(Ordering::SeqCst), 1);

        harness.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let remover = Arc::new(SlowRemover::new(Duration::from_millis(50)));
        let harness = start(settings(2), remover.clone()).await;

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(submit(&harness.queue).await);
        }
        wait_terminal(&harness.queue, &ids, 2).await;

        assert!(remover.peak.load(Ordering::SeqCst) <= 2);
        let snapshot = harness.queue.snapshot().await;
        assert_eq!(snapshot.queue_length, 0);
        assert_eq!(snapshot.completed_jobs, 6);
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_frees_slot() {
        let remover = Arc::new(SlowRemover::new(Duration::from_secs(30)));
        let harness = start(
            QueueSettings {
                job_timeout: Some(Duration::from_millis(100)),
                ..settings(1)
            },
            remover,
        )
        .await;

        let first = submit(&harness.queue).await;
        let second = submit(&harness.queue).await;
        wait_terminal(&harness.queue, &[first.clone(), second.clone()], 1).await;

        let status = harness.queue.status(&first).await.unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert!(status.error.unwrap().contains("timed out"));
        assert_eq!(
            harness.queue.status(&second).await.unwrap().status,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_panicking_worker_is_recorded_as_failed() {
        let harness = start(settings(1), Arc::new(PanickingRemover)).await;

        let id = submit(&harness.queue).await;
        wait_terminal(&harness.queue, &[id.clone()], 1).await;

        let status = harness.queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert!(status.error.unwrap().starts_with("Worker crashed"));

        // The scheduler keeps serving after a crash
        let next = submit(&harness.queue).await;
        wait_terminal(&harness.queue, &[next], 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatching() {
        let remover = Arc::new(SlowRemover::new(Duration::from_millis(10)));
        let harness = start(settings(1), remover).await;
        harness.shutdown.send(true).unwrap();
        sleep(Duration::from_millis(50)).await;

        let id = submit(&harness.queue).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            harness.queue.status(&id).await.unwrap().status,
            JobState::Queued
        );
    }
}
