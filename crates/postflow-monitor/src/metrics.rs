//! System metrics snapshot produced by one monitoring tick.

use chrono::{DateTime, Utc};
use postflow_queue::{ClusterInfo, PerformanceCounters, QueueCounts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Queue broker connectivity and internals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub connected: bool,
    pub latency_ms: Option<f64>,
    pub cluster: ClusterInfo,
    pub performance: Option<PerformanceCounters>,
    /// Probe failures, one per failed check.
    pub errors: Vec<String>,
}

/// Aggregated queue counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub available: bool,
    pub per_queue: BTreeMap<String, QueueCounts>,
    pub totals: QueueCounts,
    pub error: Option<String>,
}

/// Result of one platform operational probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub platform: String,
    pub operational: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

/// External publishing health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishingHealth {
    pub available: bool,
    pub total_accounts: u64,
    pub valid_accounts: u64,
    /// valid / total, 1.0 with no accounts.
    pub token_health_ratio: f64,
    pub platforms: Vec<PlatformStatus>,
    pub error: Option<String>,
}

impl PublishingHealth {
    pub fn failing_platforms(&self) -> impl Iterator<Item = &PlatformStatus> {
        self.platforms.iter().filter(|p| !p.operational)
    }
}

/// Host OS and process metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub hostname: String,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub load_average: [f64; 3],
    pub cpu_cores: usize,
    pub process_rss_bytes: u64,
    /// Configured process limit, or total memory when none is set.
    pub process_memory_limit_bytes: u64,
    pub uptime_secs: u64,
    pub error: Option<String>,
}

impl HostMetrics {
    /// Free / total memory; `None` when total is unknown.
    pub fn free_memory_ratio(&self) -> Option<f64> {
        (self.total_memory_bytes > 0)
            .then(|| self.free_memory_bytes as f64 / self.total_memory_bytes as f64)
    }

    /// Process RSS / limit; `None` when the limit is unknown.
    pub fn process_memory_ratio(&self) -> Option<f64> {
        (self.process_memory_limit_bytes > 0)
            .then(|| self.process_rss_bytes as f64 / self.process_memory_limit_bytes as f64)
    }

    /// One-minute load average.
    pub fn load_1m(&self) -> f64 {
        self.load_average[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Warning,
    Critical,
}

impl OverallHealth {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => OverallHealth::Healthy,
            60..=79 => OverallHealth::Warning,
            _ => OverallHealth::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Warning => "warning",
            OverallHealth::Critical => "critical",
        }
    }
}

/// Health score with the reasons behind every deduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub overall: OverallHealth,
    pub score: u8,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Default for HealthAssessment {
    fn default() -> Self {
        Self {
            overall: OverallHealth::Healthy,
            score: 100,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Full snapshot of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub backend: BackendHealth,
    pub queues: QueueHealth,
    pub publishing: PublishingHealth,
    pub host: HostMetrics,
    pub health: HealthAssessment,
}

impl SystemMetrics {
    /// Snapshot with everything reachable and idle; a starting point for tests.
    pub fn healthy(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            backend: BackendHealth {
                connected: true,
                latency_ms: Some(1.0),
                ..Default::default()
            },
            queues: QueueHealth {
                available: true,
                ..Default::default()
            },
            publishing: PublishingHealth {
                available: true,
                token_health_ratio: 1.0,
                ..Default::default()
            },
            host: HostMetrics {
                hostname: "localhost".into(),
                total_memory_bytes: 8 << 30,
                free_memory_bytes: 4 << 30,
                load_average: [0.5, 0.5, 0.5],
                cpu_cores: 4,
                process_rss_bytes: 100 << 20,
                process_memory_limit_bytes: 8 << 30,
                uptime_secs: 3600,
                error: None,
            },
            health: HealthAssessment::default(),
        }
    }
}
