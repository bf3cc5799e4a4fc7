//! Queue backend boundary: the durable, priority- and delay-aware job store.
//!
//! Everything above this trait (queue manager, scheduler, scaler, monitor) is
//! backend-agnostic. Production uses [`crate::redis_backend::RedisQueueBackend`];
//! tests and local development use [`crate::memory::MemoryQueueBackend`].

use async_trait::async_trait;
use postflow_core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::{Job, JobOptions, JobState};

/// Job counts for one queue, plus its configured worker concurrency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    pub workers: u32,
}

impl QueueCounts {
    /// Accumulate another queue's counts into this one.
    pub fn add(&mut self, other: &QueueCounts) {
        self.waiting += other.waiting;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
        self.delayed += other.delayed;
        self.paused += other.paused;
        self.workers += other.workers;
    }
}

/// One node of the backend cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
    pub role: String,
    pub healthy: bool,
}

/// Backend cluster topology. `enabled = false` means a standalone server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub enabled: bool,
    pub nodes: Vec<ClusterNode>,
}

impl ClusterInfo {
    pub fn unhealthy_nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|n| !n.healthy)
    }
}

/// Backend performance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub used_memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub key_count: u64,
    /// Keyspace hit ratio in [0, 1].
    pub hit_rate: f64,
}

/// Durable job store with per-queue worker concurrency.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &str;

    /// Store a new job; delayed when `opts.delay_ms > 0`.
    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    async fn pause(&self, queue: &str) -> Result<()>;

    async fn resume(&self, queue: &str) -> Result<()>;

    /// Remove jobs in a terminal `state` finished more than `max_age` ago.
    async fn clean(&self, queue: &str, state: JobState, max_age: Duration) -> Result<u64>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>>;

    /// Set the desired worker concurrency for a queue.
    /// Returns `false` when the backend records it but cannot apply it live.
    async fn set_concurrency(&self, queue: &str, workers: u32) -> Result<bool>;

    /// Round-trip latency of a connectivity check.
    async fn ping(&self) -> Result<Duration>;

    async fn cluster_info(&self) -> Result<ClusterInfo>;

    async fn performance(&self) -> Result<PerformanceCounters>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_add() {
        let mut total = QueueCounts::default();
        total.add(&QueueCounts { waiting: 3, failed: 1, workers: 2, ..Default::default() });
        total.add(&QueueCounts { waiting: 4, active: 2, workers: 1, ..Default::default() });
        assert_eq!(total.waiting, 7);
        assert_eq!(total.active, 2);
        assert_eq!(total.failed, 1);
        assert_eq!(total.workers, 3);
    }

    #[test]
    fn test_unhealthy_nodes() {
        let info = ClusterInfo {
            enabled: true,
            nodes: vec![
                ClusterNode { id: "a".into(), address: "10.0.0.1:6379".into(), role: "master".into(), healthy: true },
                ClusterNode { id: "b".into(), address: "10.0.0.2:6379".into(), role: "slave".into(), healthy: false },
            ],
        };
        assert_eq!(info.unhealthy_nodes().count(), 1);
    }
}
