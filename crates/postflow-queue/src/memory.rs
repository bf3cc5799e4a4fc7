//! In-memory queue backend: used by tests and `--memory-backend` dev runs.
//! Also exposes worker-side operations (claim/complete/fail) so retry and
//! backoff behaviour can be exercised without a broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postflow_core::{PostflowError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::{ClusterInfo, PerformanceCounters, QueueBackend, QueueCounts};
use crate::job::{Job, JobOptions, JobState};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    paused: bool,
    workers: u32,
}

/// Process-local job store.
pub struct MemoryQueueBackend {
    queues: Mutex<HashMap<String, QueueState>>,
    max_backoff: Duration,
    default_workers: u32,
    offline: AtomicBool,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_backoff: Duration::from_secs(3600),
            default_workers: 1,
            offline: AtomicBool::new(false),
        }
    }

    /// Ceiling applied to retry delays.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Concurrency reported for queues that never had one set.
    pub fn with_default_workers(mut self, workers: u32) -> Self {
        self.default_workers = workers;
        self
    }

    /// Simulate a broker outage: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(PostflowError::Unavailable("memory backend is offline".into()))
        } else {
            Ok(())
        }
    }

    fn with_queues<T>(&self, f: impl FnOnce(&mut HashMap<String, QueueState>) -> T) -> Result<T> {
        self.check_online()?;
        let mut guard = self
            .queues
            .lock()
            .map_err(|_| PostflowError::Unavailable("memory backend lock poisoned".into()))?;
        Ok(f(&mut guard))
    }

    /// Take the next eligible job: lowest priority number, then oldest.
    pub fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.with_queues(|queues| {
            let state = queues.entry(queue.to_string()).or_default();
            if state.paused {
                return None;
            }
            let next_id = state
                .jobs
                .values()
                .filter(|j| is_ready(j, now))
                .min_by_key(|j| (j.opts.priority, j.ready_at, j.created_at))
                .map(|j| j.id.clone())?;
            let job = state.jobs.get_mut(&next_id)?;
            job.start(now);
            Some(job.clone())
        })
    }

    pub fn complete(&self, queue: &str, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_queues(|queues| {
            queues
                .get_mut(queue)
                .and_then(|q| q.jobs.get_mut(id))
                .map(|job| job.complete(now))
                .ok_or_else(|| PostflowError::Unknown(format!("job {id} in queue {queue}")))
        })?
    }

    /// Record a failed attempt and return the job's resulting state.
    pub fn fail(&self, queue: &str, id: &str, reason: &str, now: DateTime<Utc>) -> Result<JobState> {
        let max_backoff = self.max_backoff;
        self.with_queues(|queues| {
            queues
                .get_mut(queue)
                .and_then(|q| q.jobs.get_mut(id))
                .map(|job| job.record_failure(reason, now, max_backoff))
                .ok_or_else(|| PostflowError::Unknown(format!("job {id} in queue {queue}")))
        })?
    }

    /// Every job currently stored for a queue.
    pub fn jobs(&self, queue: &str) -> Vec<Job> {
        self.queues
            .lock()
            .map(|q| q.get(queue).map(|s| s.jobs.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ready(job: &Job, now: DateTime<Utc>) -> bool {
    matches!(job.state, JobState::Waiting | JobState::Delayed) && job.ready_at <= now
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            queue,
            job_type,
            payload,
            opts,
            Utc::now(),
        );
        let stored = job.clone();
        self.with_queues(move |queues| {
            queues.entry(queue.to_string()).or_default().jobs.insert(stored.id.clone(), stored);
        })?;
        Ok(job)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let now = Utc::now();
        let default_workers = self.default_workers;
        self.with_queues(|queues| {
            let mut counts = QueueCounts::default();
            let Some(state) = queues.get(queue) else {
                counts.workers = default_workers;
                return counts;
            };
            counts.workers = if state.workers == 0 { default_workers } else { state.workers };
            for job in state.jobs.values() {
                match job.state {
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                    JobState::Paused => counts.paused += 1,
                    JobState::Waiting | JobState::Delayed => {
                        if !is_ready(job, now) {
                            counts.delayed += 1;
                        } else if state.paused {
                            counts.paused += 1;
                        } else {
                            counts.waiting += 1;
                        }
                    }
                }
            }
            counts
        })
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        self.with_queues(|queues| queues.entry(queue.to_string()).or_default().paused = true)
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        self.with_queues(|queues| queues.entry(queue.to_string()).or_default().paused = false)
    }

    async fn clean(&self, queue: &str, state: JobState, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        self.with_queues(|queues| {
            let Some(q) = queues.get_mut(queue) else {
                return 0;
            };
            let before = q.jobs.len();
            q.jobs.retain(|_, job| {
                !(job.state == state && job.finished_at.is_some_and(|t| t <= cutoff))
            });
            (before - q.jobs.len()) as u64
        })
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        self.with_queues(|queues| queues.get(queue).and_then(|q| q.jobs.get(id).cloned()))
    }

    async fn set_concurrency(&self, queue: &str, workers: u32) -> Result<bool> {
        self.with_queues(|queues| {
            queues.entry(queue.to_string()).or_default().workers = workers;
            true
        })
    }

    async fn ping(&self) -> Result<Duration> {
        self.check_online()?;
        Ok(Duration::ZERO)
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.check_online()?;
        Ok(ClusterInfo::default())
    }

    async fn performance(&self) -> Result<PerformanceCounters> {
        self.with_queues(|queues| {
            let key_count: usize = queues.values().map(|q| q.jobs.len()).sum();
            PerformanceCounters {
                used_memory_bytes: (key_count * std::mem::size_of::<Job>()) as u64,
                peak_memory_bytes: (key_count * std::mem::size_of::<Job>()) as u64,
                key_count: key_count as u64,
                hit_rate: 1.0,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Backoff;

    #[tokio::test]
    async fn test_counts_by_state() {
        let backend = MemoryQueueBackend::new();
        backend.add_job("q", "a", serde_json::json!({}), JobOptions::default()).await.unwrap();
        backend.add_job("q", "b", serde_json::json!({}), JobOptions::default()).await.unwrap();
        backend
            .add_job("q", "c", serde_json::json!({}), JobOptions::default().with_delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let counts = backend.counts("q").await.unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.workers, 1);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let backend = MemoryQueueBackend::new();
        backend
            .add_job("q", "low", serde_json::json!({}), JobOptions::default().with_priority(10))
            .await
            .unwrap();
        backend
            .add_job("q", "high", serde_json::json!({}), JobOptions::default().with_priority(1))
            .await
            .unwrap();
        let job = backend.claim_next("q", Utc::now()).unwrap().unwrap();
        assert_eq!(job.job_type, "high");
        assert_eq!(backend.counts("q").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_pause_holds_jobs() {
        let backend = MemoryQueueBackend::new();
        backend.add_job("q", "a", serde_json::json!({}), JobOptions::default()).await.unwrap();
        backend.pause("q").await.unwrap();
        assert!(backend.claim_next("q", Utc::now()).unwrap().is_none());
        let counts = backend.counts("q").await.unwrap();
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.waiting, 0);

        backend.resume("q").await.unwrap();
        assert!(backend.claim_next("q", Utc::now()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let backend = MemoryQueueBackend::new();
        let opts = JobOptions::default()
            .with_attempts(2)
            .with_backoff(Backoff::fixed(Duration::from_secs(10)));
        let job = backend.add_job("q", "sync", serde_json::json!({}), opts).await.unwrap();

        let now = Utc::now();
        backend.claim_next("q", now).unwrap().unwrap();
        assert_eq!(backend.fail("q", &job.id, "timeout", now).unwrap(), JobState::Delayed);
        // Not eligible until the backoff elapses
        assert!(backend.claim_next("q", now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(11);
        backend.claim_next("q", later).unwrap().unwrap();
        assert_eq!(backend.fail("q", &job.id, "timeout", later).unwrap(), JobState::Failed);
        assert_eq!(backend.counts("q").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_clean_removes_old_terminal_jobs() {
        let backend = MemoryQueueBackend::new();
        let job = backend.add_job("q", "a", serde_json::json!({}), JobOptions::default()).await.unwrap();
        backend.add_job("q", "b", serde_json::json!({}), JobOptions::default()).await.unwrap();
        let past = Utc::now() - chrono::Duration::hours(2);
        backend.complete("q", &job.id, past).unwrap();

        let removed = backend.clean("q", JobState::Completed, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get_job("q", &job.id).await.unwrap().is_none());
        assert_eq!(backend.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_offline_is_unavailable() {
        let backend = MemoryQueueBackend::new();
        backend.set_offline(true);
        assert!(matches!(backend.ping().await, Err(PostflowError::Unavailable(_))));
        assert!(backend.counts("q").await.is_err());
    }
}
