use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{processor::Processor, queue::JobQueue, storage::ResultStorage};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub queue: Arc<JobQueue>,
    pub processor: Arc<Processor>,
    pub metrics: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(config: AppConfig, processor: Processor) -> Self {
        let queue = JobQueue::new(config.queue_settings());
        Self {
            config: Arc::new(config),
            queue: Arc::new(queue),
            processor: Arc::new(processor),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(Arc::new(handle));
        self
    }

    pub fn storage(&self) -> &ResultStorage {
        self.processor.storage()
    }
}
