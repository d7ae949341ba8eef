use std::collections::{HashMap, VecDeque};

use crate::models::api::RecentJob;
use crate::models::job::{Job, JobId, JobState};

/// In-memory job records.
///
/// `live` holds queued and processing jobs, `completed` holds terminal jobs
/// up to `retention` entries, and `queue` lists ids awaiting dispatch in
/// submission order. Not synchronized: [`JobQueue`](super::queue::JobQueue)
/// owns the only instance behind its lock.
#[derive(Debug)]
pub struct JobStore {
    live: HashMap<JobId, Job>,
    completed: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
    retention: usize,
}

impl JobStore {
    pub fn new(retention: usize) -> Self {
        Self {
            live: HashMap::new(),
            completed: HashMap::new(),
            queue: VecDeque::new(),
            retention,
        }
    }

    /// Add a queued job and append it to the dispatch queue.
    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job.id.clone());
        self.live.insert(job.id.clone(), job);
    }

    /// Live first, then completed.
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.live.get(id).or_else(|| self.completed.get(id))
    }

    pub fn get_live_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.live.get_mut(id)
    }

    pub fn get_completed(&self, id: &JobId) -> Option<&Job> {
        self.completed.get(id)
    }

    pub fn pop_queued(&mut self) -> Option<JobId> {
        self.queue.pop_front()
    }

    /// Move a job from live to completed, evicting the oldest finished
    /// entries beyond the retention cap. Returns the evicted records.
    pub fn move_to_completed(&mut self, id: &JobId) -> Vec<Job> {
        let Some(job) = self.live.remove(id) else {
            return Vec::new();
        };
        self.queue.retain(|queued| queued != id);
        self.completed.insert(job.id.clone(), job);

        let mut evicted = Vec::new();
        while self.completed.len() > self.retention {
            let oldest = self
                .completed
                .values()
                .min_by_key(|job| (job.completed_at(), job.seq))
                .map(|job| job.id.clone());
            match oldest.and_then(|oldest| self.completed.remove(&oldest)) {
                Some(job) => evicted.push(job),
                None => break,
            }
        }
        evicted
    }

    /// 1-based position in the dispatch queue, 0 when not queued.
    pub fn queue_position(&self, id: &JobId) -> usize {
        self.queue
            .iter()
            .position(|queued| queued == id)
            .map_or(0, |index| index + 1)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn processing_count(&self) -> usize {
        self.live
            .values()
            .filter(|job| job.state() == JobState::Processing)
            .count()
    }

    pub fn live_count_for_client(&self, client_key: &str) -> usize {
        self.live
            .values()
            .filter(|job| job.client_key == client_key)
            .count()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Newest jobs first, live and completed alike.
    pub fn recent_jobs(&self, limit: usize) -> Vec<RecentJob> {
        let mut jobs: Vec<&Job> = self.live.values().chain(self.completed.values()).collect();
        jobs.sort_by(|a, b| b.seq.cmp(&a.seq));
        jobs.into_iter()
            .take(limit)
            .map(|job| RecentJob {
                job_id: job.id.clone(),
                status: job.state(),
                progress: job.progress(),
                created_at: job.created_at,
            })
            .collect()
    }
}
