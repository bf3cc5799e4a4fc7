//! Queue Manager: typed facade over the queue backend.
//!
//! Owns the registry of well-known queue names. Every other component goes
//! through here; nothing in this module makes scheduling decisions.

use postflow_core::{PostflowError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::backend::{ClusterInfo, PerformanceCounters, QueueBackend, QueueCounts};
use crate::job::{Job, JobHandle, JobOptions, JobState};

/// Content publishing to social platforms.
pub const SOCIAL_PUBLISHING: &str = "social-publishing";
/// Recurring metric synchronization (incremental + daily).
pub const METRICS_SYNC: &str = "metrics-sync";
/// First sync after an account is connected.
pub const INITIAL_SYNC: &str = "initial-sync";
/// Cleanup and housekeeping.
pub const MAINTENANCE: &str = "maintenance";
/// Outbound user notifications.
pub const NOTIFICATIONS: &str = "notifications";

/// Every queue the manager knows about, in display order.
pub const WELL_KNOWN_QUEUES: [&str; 5] = [
    SOCIAL_PUBLISHING,
    METRICS_SYNC,
    INITIAL_SYNC,
    MAINTENANCE,
    NOTIFICATIONS,
];

/// Facade over a [`QueueBackend`] that must be initialized before use.
pub struct QueueManager {
    backend: RwLock<Option<Arc<dyn QueueBackend>>>,
    queues: Vec<String>,
}

impl QueueManager {
    /// Manager over the well-known queues, not yet connected.
    pub fn new() -> Self {
        Self::with_queues(WELL_KNOWN_QUEUES.iter().map(|q| q.to_string()).collect())
    }

    /// Manager over a custom queue registry.
    pub fn with_queues(queues: Vec<String>) -> Self {
        Self {
            backend: RwLock::new(None),
            queues,
        }
    }

    /// Attach the backend. Calls before this fail with `Unavailable`.
    pub fn initialize(&self, backend: Arc<dyn QueueBackend>) {
        tracing::info!(
            "📦 Queue manager initialized with {} backend ({} queues)",
            backend.name(),
            self.queues.len()
        );
        if let Ok(mut guard) = self.backend.write() {
            *guard = Some(backend);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.read().map(|b| b.is_some()).unwrap_or(false)
    }

    /// Name of the attached backend, if any.
    pub fn backend_name(&self) -> Option<String> {
        self.backend
            .read()
            .ok()
            .and_then(|b| b.as_ref().map(|b| b.name().to_string()))
    }

    pub fn queue_names(&self) -> &[String] {
        &self.queues
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }

    fn backend(&self) -> Result<Arc<dyn QueueBackend>> {
        self.backend
            .read()
            .ok()
            .and_then(|b| b.clone())
            .ok_or_else(|| PostflowError::Unavailable("queue backend not initialized".into()))
    }

    fn check_queue(&self, queue: &str) -> Result<()> {
        if self.has_queue(queue) {
            Ok(())
        } else {
            Err(PostflowError::Unknown(format!("queue '{queue}'")))
        }
    }

    /// Submit a job.
    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<JobHandle> {
        self.check_queue(queue)?;
        if job_type.is_empty() {
            return Err(PostflowError::Validation("job type is required".into()));
        }
        let job = self.backend()?.add_job(queue, job_type, payload, opts).await?;
        tracing::debug!("➕ Job {} queued on {} ({})", job.id, queue, job_type);
        Ok(job.handle())
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> Result<QueueCounts> {
        self.check_queue(queue)?;
        self.backend()?.counts(queue).await
    }

    /// Counts for every registered queue.
    pub async fn get_all_queue_metrics(&self) -> Result<BTreeMap<String, QueueCounts>> {
        let backend = self.backend()?;
        let mut all = BTreeMap::new();
        for queue in &self.queues {
            all.insert(queue.clone(), backend.counts(queue).await?);
        }
        Ok(all)
    }

    /// Sum of per-queue counts.
    pub fn totals(metrics: &BTreeMap<String, QueueCounts>) -> QueueCounts {
        metrics.values().fold(QueueCounts::default(), |mut acc, c| {
            acc.add(c);
            acc
        })
    }

    pub async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.check_queue(queue)?;
        self.backend()?.pause(queue).await?;
        tracing::info!("⏸️ Queue {} paused", queue);
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.check_queue(queue)?;
        self.backend()?.resume(queue).await?;
        tracing::info!("▶️ Queue {} resumed", queue);
        Ok(())
    }

    /// Remove `completed` or `failed` jobs older than `max_age`.
    pub async fn clean_queue(&self, queue: &str, state: JobState, max_age: Duration) -> Result<u64> {
        self.check_queue(queue)?;
        if !state.is_terminal() {
            return Err(PostflowError::Validation(format!(
                "only completed or failed jobs can be cleaned, got '{state}'"
            )));
        }
        let removed = self.backend()?.clean(queue, state, max_age).await?;
        tracing::info!("🧹 Cleaned {} {} jobs from {}", removed, state, queue);
        Ok(removed)
    }

    pub async fn get_job_details(&self, queue: &str, job_id: &str) -> Result<Option<Job>> {
        self.check_queue(queue)?;
        self.backend()?.get_job(queue, job_id).await
    }

    /// Push a worker concurrency to the backend; `false` if not applied live.
    pub async fn set_concurrency(&self, queue: &str, workers: u32) -> Result<bool> {
        self.check_queue(queue)?;
        self.backend()?.set_concurrency(queue, workers).await
    }

    pub async fn ping(&self) -> Result<Duration> {
        self.backend()?.ping().await
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.backend()?.cluster_info().await
    }

    pub async fn performance_counters(&self) -> Result<PerformanceCounters> {
        self.backend()?.performance().await
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueueBackend;

    fn manager() -> QueueManager {
        let manager = QueueManager::new();
        manager.initialize(Arc::new(MemoryQueueBackend::new()));
        manager
    }

    #[tokio::test]
    async fn test_uninitialized_is_unavailable() {
        let manager = QueueManager::new();
        assert!(!manager.is_initialized());
        let err = manager
            .add_job(METRICS_SYNC, "daily_sync", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PostflowError::Unavailable(_)));
        assert!(matches!(manager.get_all_queue_metrics().await, Err(PostflowError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let manager = manager();
        let err = manager.get_queue_metrics("nope").await.unwrap_err();
        assert!(matches!(err, PostflowError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let manager = manager();
        let handle = manager
            .add_job(SOCIAL_PUBLISHING, "publish_post", serde_json::json!({"post": 7}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.queue, SOCIAL_PUBLISHING);
        let job = manager.get_job_details(SOCIAL_PUBLISHING, &handle.id).await.unwrap().unwrap();
        assert_eq!(job.payload["post"], 7);
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_all_metrics_and_totals() {
        let manager = manager();
        for _ in 0..3 {
            manager
                .add_job(METRICS_SYNC, "daily_sync", serde_json::json!({}), JobOptions::default())
                .await
                .unwrap();
        }
        manager
            .add_job(MAINTENANCE, "cleanup", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();

        let all = manager.get_all_queue_metrics().await.unwrap();
        assert_eq!(all.len(), WELL_KNOWN_QUEUES.len());
        assert_eq!(all[METRICS_SYNC].waiting, 3);
        let totals = QueueManager::totals(&all);
        assert_eq!(totals.waiting, 4);
    }

    #[tokio::test]
    async fn test_clean_rejects_live_states() {
        let manager = manager();
        let err = manager
            .clean_queue(METRICS_SYNC, JobState::Active, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PostflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_roundtrip() {
        let manager = manager();
        manager
            .add_job(NOTIFICATIONS, "email", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        manager.pause_queue(NOTIFICATIONS).await.unwrap();
        assert_eq!(manager.get_queue_metrics(NOTIFICATIONS).await.unwrap().paused, 1);
        manager.resume_queue(NOTIFICATIONS).await.unwrap();
        assert_eq!(manager.get_queue_metrics(NOTIFICATIONS).await.unwrap().waiting, 1);
    }
}
