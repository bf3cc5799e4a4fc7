//! Alert rules and the engine that fires them.
//!
//! Every rule is a predicate over a [`SystemMetrics`] snapshot with its own
//! cooldown. Rules are evaluated independently: one rule firing never delays
//! or resets another.

use chrono::{DateTime, Utc};
use postflow_core::{BoundedRing, PostflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::health::HealthThresholds;
use crate::metrics::SystemMetrics;

/// Alerts kept in memory.
const ALERT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "🚨",
            AlertSeverity::High => "⚠️",
            AlertSeverity::Medium => "📢",
            AlertSeverity::Low => "ℹ️",
        }
    }
}

pub type AlertPredicate = Arc<dyn Fn(&SystemMetrics) -> bool + Send + Sync>;

/// A named condition over system metrics.
#[derive(Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub predicate: AlertPredicate,
    pub severity: AlertSeverity,
    pub cooldown_minutes: u64,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new<F>(id: &str, name: &str, severity: AlertSeverity, cooldown_minutes: u64, predicate: F) -> Self
    where
        F: Fn(&SystemMetrics) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            predicate: Arc::new(predicate),
            severity,
            cooldown_minutes,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn can_fire(&self, last_fired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match last_fired {
            Some(last) => now - last >= chrono::Duration::minutes(self.cooldown_minutes as i64),
            None => true,
        }
    }
}

impl std::fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRule")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .field("cooldown_minutes", &self.cooldown_minutes)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Serializable view of a rule for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub severity: AlertSeverity,
    pub cooldown_minutes: u64,
    pub enabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub health_score: u8,
    pub fired_at: DateTime<Utc>,
}

/// The built-in rule set.
pub fn default_rules(t: &HealthThresholds) -> Vec<AlertRule> {
    let memory_limit = t.backend_memory_warn_bytes;
    let memory_mb = memory_limit / 1024 / 1024;
    let min_tokens = t.min_token_health;
    let load_per_core = t.max_load_per_core;
    let min_free = t.min_free_memory_ratio;
    let max_failed = t.max_failed_jobs;

    vec![
        AlertRule::new("backend_down", "Queue backend down", AlertSeverity::Critical, 5, |m| {
            !m.backend.connected
        })
        .with_description("The queue broker does not answer pings"),
        AlertRule::new("health_critical", "System health critical", AlertSeverity::Critical, 10, |m| {
            m.health.score < 50
        })
        .with_description("Health score below 50"),
        AlertRule::new("high_failed_jobs", "High failed job count", AlertSeverity::High, 15, move |m| {
            m.queues.totals.failed > max_failed
        })
        .with_description("More than 100 failed jobs across all queues"),
        AlertRule::new("queue_backlog", "Queue backlog", AlertSeverity::Medium, 15, |m| {
            m.queues.totals.waiting > 1000
        })
        .with_description("More than 1000 waiting jobs across all queues"),
        AlertRule::new("high_backend_memory", "High backend memory", AlertSeverity::High, 30, move |m| {
            m.backend
                .performance
                .as_ref()
                .is_some_and(|p| p.used_memory_bytes > memory_limit)
        })
        .with_description(&format!("Backend memory above {memory_mb} MB")),
        AlertRule::new("low_token_health", "Low token health", AlertSeverity::Medium, 60, move |m| {
            m.publishing.total_accounts > 0 && m.publishing.token_health_ratio < min_tokens
        })
        .with_description("Less than half of the connected accounts have valid tokens"),
        AlertRule::new("high_system_load", "High system load", AlertSeverity::Medium, 15, move |m| {
            m.host.load_1m() > load_per_core * m.host.cpu_cores.max(1) as f64
        })
        .with_description("Load average above twice the core count"),
        AlertRule::new("low_free_memory", "Low free memory", AlertSeverity::High, 15, move |m| {
            m.host.free_memory_ratio().is_some_and(|r| r < min_free)
        })
        .with_description("Less than 10% of host memory is free"),
    ]
}

/// Evaluates rules and keeps per-rule cooldowns plus recent alerts.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    last_fired: HashMap<String, DateTime<Utc>>,
    history: BoundedRing<Alert>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            last_fired: HashMap::new(),
            history: BoundedRing::new(ALERT_HISTORY),
        }
    }

    /// Fire every enabled rule whose predicate holds and whose cooldown elapsed.
    pub fn evaluate_at(&mut self, metrics: &SystemMetrics, now: DateTime<Utc>) -> Vec<Alert> {
        let mut fired = Vec::new();
        for rule in &self.rules {
            if !rule.can_fire(self.last_fired.get(&rule.id).copied(), now) {
                continue;
            }
            if !(rule.predicate)(metrics) {
                continue;
            }
            let alert = Alert {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                severity: rule.severity,
                message: alert_message(rule, metrics),
                health_score: metrics.health.score,
                fired_at: now,
            };
            tracing::warn!(
                "{} Alert [{}] {}: {}",
                rule.severity.emoji(),
                rule.severity.as_str(),
                rule.name,
                alert.message
            );
            self.last_fired.insert(rule.id.clone(), now);
            fired.push(alert);
        }
        for alert in &fired {
            self.history.push(alert.clone());
        }
        fired
    }

    /// Add a rule. Ids must be unique.
    pub fn add_rule(&mut self, rule: AlertRule) -> Result<()> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(PostflowError::Validation(format!("alert rule '{}' already exists", rule.id)));
        }
        tracing::info!("➕ Alert rule added: {}", rule.id);
        self.rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) -> Result<()> {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        if self.rules.len() == before {
            return Err(PostflowError::Unknown(format!("alert rule '{id}'")));
        }
        self.last_fired.remove(id);
        tracing::info!("➖ Alert rule removed: {}", id);
        Ok(())
    }

    pub fn set_rule_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| PostflowError::Unknown(format!("alert rule '{id}'")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rules(&self) -> Vec<AlertRuleInfo> {
        self.rules
            .iter()
            .map(|r| AlertRuleInfo {
                id: r.id.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
                severity: r.severity,
                cooldown_minutes: r.cooldown_minutes,
                enabled: r.enabled,
                last_fired: self.last_fired.get(&r.id).copied(),
            })
            .collect()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history.recent(limit)
    }
}

fn alert_message(rule: &AlertRule, m: &SystemMetrics) -> String {
    let detail = match m.health.issues.first() {
        Some(issue) => format!(" First issue: {issue}"),
        None => String::new(),
    };
    let base = if rule.description.is_empty() {
        rule.name.clone()
    } else {
        rule.description.clone()
    };
    format!("{base} (health {}/100).{detail}", m.health.score)
}
