//! System Monitor: periodic collection, health scoring and alerting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postflow_core::config::MonitoringConfig;
use postflow_core::{RepeatingTask, Result};
use postflow_queue::QueueManager;
use postflow_scheduler::{AccountSource, SchedulerDb};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::alerts::{default_rules, Alert, AlertEngine, AlertRule, AlertRuleInfo};
use crate::dispatch::{dispatch_all, targets_from_config, NotifyTarget};
use crate::health::{assess, HealthThresholds};
use crate::metrics::{BackendHealth, HealthAssessment, PublishingHealth, QueueHealth, SystemMetrics};
use crate::probes::{probe_platform, HostProbe, HttpPlatformProbe, PlatformProbe, ProcHostProbe};

/// Durable sink for fired alerts.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn save(&self, alert: &Alert) -> Result<()>;
}

#[async_trait]
impl AlertStore for SchedulerDb {
    async fn save(&self, alert: &Alert) -> Result<()> {
        self.save_alert(
            &alert.rule_id,
            &alert.rule_name,
            alert.severity.as_str(),
            &alert.message,
            alert.health_score,
            alert.fired_at,
        )
        .map(|_| ())
    }
}

/// Snapshot returned by [`SystemMonitor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub active: bool,
    pub interval_secs: u64,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub last_health: Option<HealthAssessment>,
    pub rules: Vec<AlertRuleInfo>,
    pub recent_alerts: Vec<Alert>,
}

struct MonitorState {
    alerts: AlertEngine,
    last_metrics: Option<SystemMetrics>,
}

/// The monitoring service.
pub struct SystemMonitor {
    queues: Arc<QueueManager>,
    accounts: Arc<dyn AccountSource>,
    platform_probes: Vec<Arc<dyn PlatformProbe>>,
    host_probe: Arc<dyn HostProbe>,
    alert_store: Option<Arc<dyn AlertStore>>,
    targets: Vec<NotifyTarget>,
    thresholds: HealthThresholds,
    client: reqwest::Client,
    state: Mutex<MonitorState>,
    ticker: RepeatingTask,
}

impl SystemMonitor {
    /// Monitor with probes, thresholds and notify targets from `[monitoring]`.
    pub fn new(
        queues: Arc<QueueManager>,
        accounts: Arc<dyn AccountSource>,
        config: &MonitoringConfig,
    ) -> Self {
        let thresholds = HealthThresholds::from(config);
        let platform_probes = config
            .platform_probes
            .iter()
            .map(|p| Arc::new(HttpPlatformProbe::from_config(p)) as Arc<dyn PlatformProbe>)
            .collect();
        Self {
            queues,
            accounts,
            platform_probes,
            host_probe: Arc::new(ProcHostProbe::new(config.process_memory_limit_mb)),
            alert_store: None,
            targets: targets_from_config(&config.notify),
            state: Mutex::new(MonitorState {
                alerts: AlertEngine::new(default_rules(&thresholds)),
                last_metrics: None,
            }),
            thresholds,
            client: reqwest::Client::new(),
            ticker: RepeatingTask::new("system-monitor", Duration::from_secs(config.interval_secs)),
        }
    }

    pub fn with_alert_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.alert_store = Some(store);
        self
    }

    pub fn with_host_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.host_probe = probe;
        self
    }

    pub fn with_platform_probe(mut self, probe: Arc<dyn PlatformProbe>) -> Self {
        self.platform_probes.push(probe);
        self
    }

    pub fn with_targets(mut self, targets: Vec<NotifyTarget>) -> Self {
        self.targets = targets;
        self
    }

    /// Start the periodic loop. `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.ticker.start(move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.collect_now().await;
                }
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.ticker.stop()
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_active()
    }

    pub async fn shutdown(&self) {
        self.ticker.shutdown().await;
    }

    pub async fn collect_now(&self) -> SystemMetrics {
        self.collect_at(Utc::now()).await
    }

    /// Collect, score, alert. Probe failures become issues, never errors.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> SystemMetrics {
        let mut metrics = SystemMetrics {
            timestamp: now,
            backend: self.collect_backend().await,
            queues: self.collect_queues().await,
            publishing: self.collect_publishing(now).await,
            host: self.host_probe.collect(),
            health: HealthAssessment::default(),
        };
        metrics.health = assess(&metrics, &self.thresholds);
        tracing::info!(
            "🩺 Health {} ({}/100, {} issues)",
            metrics.health.overall.as_str(),
            metrics.health.score,
            metrics.health.issues.len()
        );

        let fired = {
            let mut state = self.state.lock().await;
            let fired = state.alerts.evaluate_at(&metrics, now);
            state.last_metrics = Some(metrics.clone());
            fired
        };

        for alert in &fired {
            if let Some(store) = &self.alert_store {
                if let Err(e) = store.save(alert).await {
                    tracing::warn!("⚠️ Failed to persist alert {}: {}", alert.rule_id, e);
                }
            }
            dispatch_all(&self.client, alert, &self.targets).await;
        }
        metrics
    }

    async fn collect_backend(&self) -> BackendHealth {
        let mut backend = BackendHealth::default();
        match self.queues.ping().await {
            Ok(latency) => {
                backend.connected = true;
                backend.latency_ms = Some(latency.as_secs_f64() * 1000.0);
            }
            Err(e) => {
                tracing::warn!("⚠️ Backend ping failed: {}", e);
                backend.errors.push(format!("ping: {e}"));
                return backend;
            }
        }
        match self.queues.cluster_info().await {
            Ok(cluster) => backend.cluster = cluster,
            Err(e) => backend.errors.push(format!("cluster: {e}")),
        }
        match self.queues.performance_counters().await {
            Ok(perf) => backend.performance = Some(perf),
            Err(e) => backend.errors.push(format!("performance: {e}")),
        }
        backend
    }

    async fn collect_queues(&self) -> QueueHealth {
        match self.queues.get_all_queue_metrics().await {
            Ok(per_queue) => QueueHealth {
                available: true,
                totals: QueueManager::totals(&per_queue),
                per_queue,
                error: None,
            },
            Err(e) => {
                tracing::warn!("⚠️ Queue metrics unavailable: {}", e);
                QueueHealth {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    async fn collect_publishing(&self, now: DateTime<Utc>) -> PublishingHealth {
        let mut publishing = match self.accounts.token_summary(now).await {
            Ok(summary) => PublishingHealth {
                available: true,
                total_accounts: summary.total,
                valid_accounts: summary.valid,
                token_health_ratio: summary.ratio(),
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!("⚠️ Token summary unavailable: {}", e);
                PublishingHealth {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        for probe in &self.platform_probes {
            publishing.platforms.push(probe_platform(probe.as_ref()).await);
        }
        publishing
    }

    /// Last successful snapshot.
    pub async fn last_metrics(&self) -> Option<SystemMetrics> {
        self.state.lock().await.last_metrics.clone()
    }

    pub async fn status(&self) -> MonitorStatus {
        let state = self.state.lock().await;
        MonitorStatus {
            active: self.is_active(),
            interval_secs: self.ticker.period().as_secs(),
            last_collected_at: state.last_metrics.as_ref().map(|m| m.timestamp),
            last_health: state.last_metrics.as_ref().map(|m| m.health.clone()),
            rules: state.alerts.rules(),
            recent_alerts: state.alerts.recent(20),
        }
    }

    pub async fn add_rule(&self, rule: AlertRule) -> Result<()> {
        self.state.lock().await.alerts.add_rule(rule)
    }

    pub async fn remove_rule(&self, id: &str) -> Result<()> {
        self.state.lock().await.alerts.remove_rule(id)
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.state.lock().await.alerts.set_rule_enabled(id, enabled)
    }

    pub async fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.state.lock().await.alerts.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{HostMetrics, OverallHealth};
    use postflow_core::PostflowError;
    use postflow_queue::MemoryQueueBackend;
    use postflow_scheduler::SocialAccount;

    struct FixedHost;

    impl HostProbe for FixedHost {
        fn collect(&self) -> HostMetrics {
            SystemMetrics::healthy(Utc::now()).host
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl PlatformProbe for FailingProbe {
        fn platform(&self) -> &str {
            "linkedin"
        }

        async fn check(&self) -> Result<Duration> {
            Err(PostflowError::ProbeFailure("linkedin: timeout".into()))
        }
    }

    fn setup() -> (Arc<MemoryQueueBackend>, Arc<SchedulerDb>, SystemMonitor) {
        let backend = Arc::new(MemoryQueueBackend::new());
        let manager = QueueManager::new();
        manager.initialize(backend.clone());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let monitor = SystemMonitor::new(Arc::new(manager), db.clone(), &MonitoringConfig::default())
            .with_host_probe(Arc::new(FixedHost))
            .with_alert_store(db.clone());
        (backend, db, monitor)
    }

    #[tokio::test]
    async fn test_healthy_collection() {
        let (_backend, _db, monitor) = setup();
        let metrics = monitor.collect_now().await;
        assert!(metrics.backend.connected);
        assert!(metrics.queues.available);
        assert_eq!(metrics.queues.per_queue.len(), 5);
        assert_eq!(metrics.health.score, 100);
        assert_eq!(monitor.last_metrics().await.unwrap().timestamp, metrics.timestamp);
    }

    #[tokio::test]
    async fn test_backend_outage_fires_and_persists() {
        let (backend, db, monitor) = setup();
        backend.set_offline(true);
        let metrics = monitor.collect_now().await;

        assert!(!metrics.backend.connected);
        assert!(!metrics.queues.available);
        assert_eq!(metrics.health.score, 45);
        assert_eq!(metrics.health.overall, OverallHealth::Critical);

        let ids: Vec<String> = monitor.recent_alerts(10).await.into_iter().map(|a| a.rule_id).collect();
        assert!(ids.contains(&"backend_down".to_string()));
        assert!(ids.contains(&"health_critical".to_string()));
        assert_eq!(db.recent_alerts(10).unwrap().len(), 2);

        // Second tick within the cooldowns fires nothing new
        monitor.collect_now().await;
        assert_eq!(monitor.recent_alerts(10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_becomes_issue() {
        let (_backend, db, monitor) = setup();
        let monitor = monitor.with_platform_probe(Arc::new(FailingProbe));
        db.upsert_account(&SocialAccount {
            id: "a1".into(),
            team_id: "t".into(),
            platform: "linkedin".into(),
            token_expires_at: Some(Utc::now() - chrono::Duration::days(1)),
        })
        .unwrap();

        let metrics = monitor.collect_now().await;
        assert_eq!(metrics.publishing.total_accounts, 1);
        assert_eq!(metrics.publishing.valid_accounts, 0);
        assert!(!metrics.publishing.platforms[0].operational);
        // token health -15, publisher issue -10
        assert_eq!(metrics.health.score, 75);
        assert_eq!(metrics.health.issues.len(), 2);
    }

    #[tokio::test]
    async fn test_rule_management_and_status() {
        let (_backend, _db, monitor) = setup();
        monitor
            .add_rule(AlertRule::new("any_waiting", "Any waiting", crate::alerts::AlertSeverity::Low, 60, |m| {
                m.queues.totals.waiting > 0
            }))
            .await
            .unwrap();
        monitor.set_rule_enabled("queue_backlog", false).await.unwrap();
        assert!(monitor.remove_rule("missing").await.is_err());

        let status = monitor.status().await;
        assert!(!status.active);
        assert_eq!(status.interval_secs, 300);
        assert_eq!(status.rules.len(), 9);
        assert!(status.last_health.is_none());
        assert!(!status.rules.iter().find(|r| r.id == "queue_backlog").unwrap().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_collects_immediately() {
        let (_backend, _db, monitor) = setup();
        let monitor = Arc::new(monitor);
        assert!(monitor.start());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.last_metrics().await.is_some());
        monitor.shutdown().await;
        assert!(!monitor.is_active());
    }
}
