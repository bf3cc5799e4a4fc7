//! Sync statistics aggregated from the task log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::{TaskLogEntry, TaskLogStatus};
use crate::sync::SyncKind;

/// Look-back window for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsRange {
    Hour,
    Day,
    Week,
}

impl StatsRange {
    pub fn window(&self) -> chrono::Duration {
        match self {
            StatsRange::Hour => chrono::Duration::hours(1),
            StatsRange::Day => chrono::Duration::days(1),
            StatsRange::Week => chrono::Duration::weeks(1),
        }
    }
}

impl std::str::FromStr for StatsRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(StatsRange::Hour),
            "day" => Ok(StatsRange::Day),
            "week" => Ok(StatsRange::Week),
            other => Err(format!("unknown range '{other}' (hour, day, week)")),
        }
    }
}

/// Per-status counts for one sync kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregates over a statistics window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub range: StatsRange,
    pub total: u64,
    pub by_kind: BTreeMap<String, KindCounts>,
    /// Mean of `executionTimeMs` over entries that report it.
    pub average_execution_ms: Option<f64>,
    /// failed / total, 0 when there are no entries.
    pub error_rate: f64,
}

impl SyncStatistics {
    pub fn from_entries(range: StatsRange, entries: &[TaskLogEntry]) -> Self {
        let mut by_kind: BTreeMap<String, KindCounts> = BTreeMap::new();
        let mut failed = 0u64;
        let mut timings = Vec::new();

        for entry in entries {
            let kind = SyncKind::from_log_name(&entry.name)
                .map(|k| k.job_type().to_string())
                .unwrap_or_else(|| "other".into());
            let counts = by_kind.entry(kind).or_default();
            counts.total += 1;
            match entry.status {
                TaskLogStatus::Pending => counts.pending += 1,
                TaskLogStatus::Processing => counts.processing += 1,
                TaskLogStatus::Completed => counts.completed += 1,
                TaskLogStatus::Failed => {
                    counts.failed += 1;
                    failed += 1;
                }
            }
            if let Some(ms) = execution_time_ms(&entry.message) {
                timings.push(ms);
            }
        }

        let total = entries.len() as u64;
        Self {
            range,
            total,
            by_kind,
            average_execution_ms: (!timings.is_empty())
                .then(|| timings.iter().sum::<f64>() / timings.len() as f64),
            error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
        }
    }
}

fn execution_time_ms(message: &str) -> Option<f64> {
    serde_json::from_str::<serde_json::Value>(message)
        .ok()?
        .get("executionTimeMs")?
        .as_f64()
}
