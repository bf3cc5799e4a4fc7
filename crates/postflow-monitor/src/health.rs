//! Health scoring: start at 100 and deduct a fixed penalty per detected issue.

use postflow_core::config::MonitoringConfig;

use crate::metrics::{HealthAssessment, OverallHealth, SystemMetrics};

/// Limits that turn raw metrics into issues.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub backend_memory_warn_bytes: u64,
    pub max_failed_jobs: u64,
    pub min_token_health: f64,
    pub min_free_memory_ratio: f64,
    pub max_load_per_core: f64,
    pub max_process_memory_ratio: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            backend_memory_warn_bytes: 800 * 1024 * 1024,
            max_failed_jobs: 100,
            min_token_health: 0.5,
            min_free_memory_ratio: 0.1,
            max_load_per_core: 2.0,
            max_process_memory_ratio: 0.9,
        }
    }
}

impl From<&MonitoringConfig> for HealthThresholds {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            backend_memory_warn_bytes: config.backend_memory_warn_mb * 1024 * 1024,
            ..Default::default()
        }
    }
}

/// Deducted once per backend sub-probe (cluster, performance) that failed.
const SUB_PROBE_PENALTY: u8 = 5;
const HOST_PROBE_PENALTY: u8 = 10;

struct Scorer {
    score: u8,
    issues: Vec<String>,
    recommendations: Vec<String>,
}

impl Scorer {
    fn penalize(&mut self, penalty: u8, issue: String, recommendation: &str) {
        self.score = self.score.saturating_sub(penalty);
        self.issues.push(issue);
        self.recommendations.push(recommendation.to_string());
    }
}

/// Score a snapshot. The snapshot's own `health` field is ignored.
pub fn assess(m: &SystemMetrics, t: &HealthThresholds) -> HealthAssessment {
    let mut s = Scorer {
        score: 100,
        issues: Vec::new(),
        recommendations: Vec::new(),
    };

    // Queue broker
    if !m.backend.connected {
        s.penalize(
            30,
            format!("Queue backend unreachable: {}", m.backend.errors.join("; ")),
            "Check the Redis server and network connectivity",
        );
    } else {
        for err in &m.backend.errors {
            s.penalize(
                SUB_PROBE_PENALTY,
                format!("Backend probe failed: {err}"),
                "Check backend permissions for INFO and CLUSTER commands",
            );
        }
    }
    let unhealthy: Vec<&str> = m.backend.cluster.unhealthy_nodes().map(|n| n.address.as_str()).collect();
    if !unhealthy.is_empty() {
        s.penalize(
            20,
            format!("{} cluster node(s) unhealthy: {}", unhealthy.len(), unhealthy.join(", ")),
            "Inspect failing cluster nodes and trigger failover if needed",
        );
    }
    if let Some(perf) = &m.backend.performance {
        if perf.used_memory_bytes > t.backend_memory_warn_bytes {
            s.penalize(
                15,
                format!("Backend memory high: {} MB", perf.used_memory_bytes / 1024 / 1024),
                "Clean completed jobs or raise the Redis memory limit",
            );
        }
    }

    // Queues
    if !m.queues.available {
        s.penalize(
            25,
            format!(
                "Queue subsystem unavailable: {}",
                m.queues.error.as_deref().unwrap_or("no metrics")
            ),
            "Restart queue workers and verify the backend connection",
        );
    } else if m.queues.totals.failed > t.max_failed_jobs {
        s.penalize(
            10,
            format!("{} failed jobs across queues", m.queues.totals.failed),
            "Review failed job reasons and clean the failed sets",
        );
    }

    // Publishing
    if !m.publishing.available {
        s.penalize(
            20,
            format!(
                "Publishing subsystem unhealthy: {}",
                m.publishing.error.as_deref().unwrap_or("account source unavailable")
            ),
            "Check the account database",
        );
    } else if m.publishing.total_accounts > 0 && m.publishing.token_health_ratio < t.min_token_health {
        s.penalize(
            15,
            format!(
                "Only {:.0}% of account tokens are valid",
                m.publishing.token_health_ratio * 100.0
            ),
            "Ask affected teams to reconnect their social accounts",
        );
    }
    let failing: Vec<&str> = m.publishing.failing_platforms().map(|p| p.platform.as_str()).collect();
    if !failing.is_empty() {
        s.penalize(
            10,
            format!("Publisher issues: {}", failing.join(", ")),
            "Pause publishing to affected platforms until they recover",
        );
    }

    // Host
    if let Some(err) = &m.host.error {
        s.penalize(
            HOST_PROBE_PENALTY,
            format!("Host metrics unavailable: {err}"),
            "Verify /proc is mounted and readable by the service",
        );
    }
    if let Some(free) = m.host.free_memory_ratio() {
        if free < t.min_free_memory_ratio {
            s.penalize(
                20,
                format!("Low free memory: {:.1}%", free * 100.0),
                "Free memory on the host or reduce worker concurrency",
            );
        }
    }
    let cores = m.host.cpu_cores.max(1) as f64;
    if m.host.load_1m() > t.max_load_per_core * cores {
        s.penalize(
            15,
            format!("Load average {:.2} exceeds {} cores", m.host.load_1m(), m.host.cpu_cores),
            "Scale down non-critical queues or add capacity",
        );
    }
    if let Some(ratio) = m.host.process_memory_ratio() {
        if ratio > t.max_process_memory_ratio {
            s.penalize(
                15,
                format!("Process memory at {:.0}% of limit", ratio * 100.0),
                "Restart the service or raise its memory limit",
            );
        }
    }

    HealthAssessment {
        overall: OverallHealth::from_score(s.score),
        score: s.score,
        issues: s.issues,
        recommendations: s.recommendations,
    }
}
