//! Worker Auto-Scaler: load-based control loop over per-queue concurrency.
//!
//! Each tick reads queue counts through the [`QueueManager`], derives
//! [`LoadMetrics`], runs the pure [`decide`] function and pushes any change to
//! the backend. Per-queue cooldowns apply to automatic and manual actions.

use chrono::{DateTime, Utc};
use postflow_core::config::{AutoscalingConfig, QueueScalingOverride};
use postflow_core::{BoundedRing, PostflowError, RepeatingTask, Result};
use postflow_queue::QueueManager;
use postflow_queue::manager::{
    INITIAL_SYNC, MAINTENANCE, METRICS_SYNC, NOTIFICATIONS, SOCIAL_PUBLISHING,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Scaling actions kept in memory.
const HISTORY_CAPACITY: usize = 100;
/// Load factor above which a backlog adds one worker.
const HIGH_LOAD: f64 = 0.8;
/// Load factor below which an idle queue drops one worker.
const LOW_LOAD: f64 = 0.2;

/// Scaling bounds and thresholds for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    pub target_waiting_jobs: u64,
    /// waiting / target ratio that triggers a proportional scale-up.
    pub scale_up_threshold: f64,
    /// Fraction of target below which a proportional scale-down happens.
    pub scale_down_threshold: f64,
    pub cooldown_minutes: u64,
    pub enabled: bool,
}

impl ScalingConfig {
    pub fn new(min_workers: u32, max_workers: u32, target_waiting_jobs: u64) -> Self {
        Self {
            min_workers,
            max_workers,
            target_waiting_jobs,
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.3,
            cooldown_minutes: 5,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers < 1 {
            return Err(PostflowError::Validation("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(PostflowError::Validation(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.target_waiting_jobs < 1 {
            return Err(PostflowError::Validation("target_waiting_jobs must be at least 1".into()));
        }
        if !(self.scale_up_threshold > 0.0) {
            return Err(PostflowError::Validation("scale_up_threshold must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.scale_down_threshold) {
            return Err(PostflowError::Validation(
                "scale_down_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn contains(&self, workers: u32) -> bool {
        (self.min_workers..=self.max_workers).contains(&workers)
    }

    pub fn clamp(&self, workers: u32) -> u32 {
        workers.clamp(self.min_workers, self.max_workers)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }
}

/// Built-in scaling configs for the well-known queues.
pub fn default_scaling_configs() -> BTreeMap<String, ScalingConfig> {
    let mut configs = BTreeMap::new();
    configs.insert(SOCIAL_PUBLISHING.to_string(), ScalingConfig::new(2, 10, 20));
    configs.insert(
        METRICS_SYNC.to_string(),
        ScalingConfig {
            scale_down_threshold: 0.2,
            ..ScalingConfig::new(1, 5, 50)
        },
    );
    configs.insert(
        INITIAL_SYNC.to_string(),
        ScalingConfig {
            scale_up_threshold: 1.5,
            cooldown_minutes: 10,
            ..ScalingConfig::new(1, 3, 10)
        },
    );
    configs.insert(
        MAINTENANCE.to_string(),
        ScalingConfig {
            scale_up_threshold: 3.0,
            scale_down_threshold: 0.1,
            cooldown_minutes: 15,
            ..ScalingConfig::new(1, 2, 100)
        },
    );
    configs.insert(NOTIFICATIONS.to_string(), ScalingConfig::new(1, 5, 30));
    configs
}

/// Defaults merged with the `[autoscaling.queues.*]` overrides.
/// Overrides for queues without a default start from `ScalingConfig::new(1, 1, 1)`.
pub fn scaling_configs_from(config: &AutoscalingConfig) -> Result<BTreeMap<String, ScalingConfig>> {
    let mut configs = default_scaling_configs();
    for (queue, over) in &config.queues {
        let base = configs
            .get(queue)
            .cloned()
            .unwrap_or_else(|| ScalingConfig::new(1, 1, 1));
        let merged = ScalingConfigPatch::from(over)
            .apply(&base)
            .map_err(|e| PostflowError::Config(format!("autoscaling.queues.{queue}: {e}")))?;
        configs.insert(queue.clone(), merged);
    }
    Ok(configs)
}

/// Partial update for a [`ScalingConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfigPatch {
    pub min_workers: Option<u32>,
    pub max_workers: Option<u32>,
    pub target_waiting_jobs: Option<u64>,
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    pub cooldown_minutes: Option<u64>,
    pub enabled: Option<bool>,
}

impl ScalingConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// New config with the patch applied; the base is left untouched.
    pub fn apply(&self, base: &ScalingConfig) -> Result<ScalingConfig> {
        let next = ScalingConfig {
            min_workers: self.min_workers.unwrap_or(base.min_workers),
            max_workers: self.max_workers.unwrap_or(base.max_workers),
            target_waiting_jobs: self.target_waiting_jobs.unwrap_or(base.target_waiting_jobs),
            scale_up_threshold: self.scale_up_threshold.unwrap_or(base.scale_up_threshold),
            scale_down_threshold: self.scale_down_threshold.unwrap_or(base.scale_down_threshold),
            cooldown_minutes: self.cooldown_minutes.unwrap_or(base.cooldown_minutes),
            enabled: self.enabled.unwrap_or(base.enabled),
        };
        next.validate()?;
        Ok(next)
    }
}

impl From<&QueueScalingOverride> for ScalingConfigPatch {
    fn from(o: &QueueScalingOverride) -> Self {
        Self {
            min_workers: o.min_workers,
            max_workers: o.max_workers,
            target_waiting_jobs: o.target_waiting_jobs,
            scale_up_threshold: o.scale_up_threshold,
            scale_down_threshold: o.scale_down_threshold,
            cooldown_minutes: o.cooldown_minutes,
            enabled: o.enabled,
        }
    }
}

/// Load snapshot for one queue at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub queue: String,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub current_workers: u32,
    /// Completed jobs per minute since the previous assessment.
    pub throughput: f64,
    pub load_factor: f64,
    pub timestamp: DateTime<Utc>,
}

/// Backlog pressure per worker, in [0, 1]. Zero workers count as one.
pub fn load_factor(waiting: u64, active: u64, workers: u32) -> f64 {
    let workers = workers.max(1) as f64;
    ((waiting + active) as f64 / workers / 10.0).min(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingActionKind {
    ScaleUp,
    ScaleDown,
    NoChange,
}

impl ScalingActionKind {
    fn between(previous: u32, new: u32) -> Self {
        match new.cmp(&previous) {
            std::cmp::Ordering::Greater => ScalingActionKind::ScaleUp,
            std::cmp::Ordering::Less => ScalingActionKind::ScaleDown,
            std::cmp::Ordering::Equal => ScalingActionKind::NoChange,
        }
    }
}

/// Result of [`decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingDecision {
    pub action: ScalingActionKind,
    pub new_workers: u32,
    pub reason: String,
}

/// Pick the worker count for one queue. `new_workers` is always within bounds.
pub fn decide(config: &ScalingConfig, m: &LoadMetrics) -> ScalingDecision {
    let current = m.current_workers;
    let target = config.target_waiting_jobs.max(1);
    let waiting_ratio = m.waiting as f64 / target as f64;

    let (candidate, reason) = if current < config.max_workers
        && m.waiting > target
        && waiting_ratio > config.scale_up_threshold
    {
        (
            current.saturating_add(current.div_ceil(2)),
            format!(
                "{} waiting is {:.1}x the target of {}",
                m.waiting, waiting_ratio, target
            ),
        )
    } else if current < config.max_workers && m.load_factor > HIGH_LOAD && m.waiting > 0 {
        (
            current.saturating_add(1),
            format!("load factor {:.2} with {} waiting", m.load_factor, m.waiting),
        )
    } else if current > config.min_workers && m.waiting == 0 && m.load_factor < LOW_LOAD {
        (
            current - 1,
            format!("idle queue (load factor {:.2})", m.load_factor),
        )
    } else if current > config.min_workers
        && (m.waiting as f64) < target as f64 * config.scale_down_threshold
    {
        (
            current.saturating_sub(current.div_ceil(4)),
            format!(
                "{} waiting is below {:.0}% of the target of {}",
                m.waiting,
                config.scale_down_threshold * 100.0,
                target
            ),
        )
    } else {
        (current, "load within thresholds".to_string())
    };

    let new_workers = config.clamp(candidate);
    let reason = if !config.contains(current) && candidate == current {
        format!(
            "{} workers outside bounds [{}, {}]",
            current, config.min_workers, config.max_workers
        )
    } else {
        reason
    };
    ScalingDecision {
        action: ScalingActionKind::between(current, new_workers),
        new_workers,
        reason,
    }
}

/// One recorded change of a queue's worker count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub queue: String,
    pub action: ScalingActionKind,
    pub previous_workers: u32,
    pub new_workers: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the backend accepted the new concurrency live.
    pub applied: bool,
}

/// Snapshot returned by [`AutoScaler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ScalerStatus {
    pub active: bool,
    pub interval_secs: u64,
    pub configs: BTreeMap<String, ScalingConfig>,
    pub last_metrics: BTreeMap<String, LoadMetrics>,
    pub recent_actions: Vec<ScalingAction>,
    pub current_workers: BTreeMap<String, u32>,
}

struct ScalerState {
    configs: BTreeMap<String, ScalingConfig>,
    last_action: HashMap<String, DateTime<Utc>>,
    last_metrics: BTreeMap<String, LoadMetrics>,
    current_workers: BTreeMap<String, u32>,
    history: BoundedRing<ScalingAction>,
}

impl ScalerState {
    fn in_cooldown(&self, queue: &str, config: &ScalingConfig, now: DateTime<Utc>) -> bool {
        self.last_action
            .get(queue)
            .is_some_and(|last| now - *last < config.cooldown())
    }

    fn throughput(&self, queue: &str, completed: u64, now: DateTime<Utc>) -> f64 {
        let Some(prev) = self.last_metrics.get(queue) else {
            return 0.0;
        };
        let minutes = (now - prev.timestamp).num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        completed.saturating_sub(prev.completed) as f64 / minutes
    }

    fn record(&mut self, action: ScalingAction) {
        self.last_action.insert(action.queue.clone(), action.timestamp);
        self.current_workers.insert(action.queue.clone(), action.new_workers);
        self.history.push(action);
    }
}

/// The auto-scaling service.
pub struct AutoScaler {
    queues: Arc<QueueManager>,
    /// Serializes ticks and manual scaling across their backend calls.
    scaling: Mutex<()>,
    state: Mutex<ScalerState>,
    ticker: RepeatingTask,
}

impl AutoScaler {
    pub fn new(
        queues: Arc<QueueManager>,
        configs: BTreeMap<String, ScalingConfig>,
        interval: Duration,
    ) -> Self {
        Self {
            queues,
            scaling: Mutex::new(()),
            state: Mutex::new(ScalerState {
                configs,
                last_action: HashMap::new(),
                last_metrics: BTreeMap::new(),
                current_workers: BTreeMap::new(),
                history: BoundedRing::new(HISTORY_CAPACITY),
            }),
            ticker: RepeatingTask::new("auto-scaler", interval),
        }
    }

    /// Build from the `[autoscaling]` config section.
    pub fn from_config(queues: Arc<QueueManager>, config: &AutoscalingConfig) -> Result<Self> {
        Ok(Self::new(
            queues,
            scaling_configs_from(config)?,
            Duration::from_secs(config.interval_secs),
        ))
    }

    /// Start the periodic loop. `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.ticker.start(move || {
            let weak = weak.clone();
            async move {
                if let Some(scaler) = weak.upgrade() {
                    scaler.assess_now().await;
                }
            }
        })
    }

    /// Stop the loop; an in-flight tick completes.
    pub fn stop(&self) -> bool {
        self.ticker.stop()
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_active()
    }

    pub async fn shutdown(&self) {
        self.ticker.shutdown().await;
    }

    pub async fn assess_now(&self) -> Vec<ScalingAction> {
        self.assess_at(Utc::now()).await
    }

    /// One tick: assess every enabled queue outside its cooldown.
    ///
    /// `state` is only locked between backend calls, so status reads never
    /// wait on a slow backend.
    pub async fn assess_at(&self, now: DateTime<Utc>) -> Vec<ScalingAction> {
        let _scaling = self.scaling.lock().await;
        let configs: Vec<(String, ScalingConfig)> = {
            let state = self.state.lock().await;
            state
                .configs
                .iter()
                .filter(|(_, c)| c.enabled)
                .filter(|(q, c)| {
                    let cooling = state.in_cooldown(q, c, now);
                    if cooling {
                        tracing::debug!("🧊 {} in cooldown, skipping", q);
                    }
                    !cooling
                })
                .map(|(q, c)| (q.clone(), c.clone()))
                .collect()
        };

        let mut actions = Vec::new();
        for (queue, config) in configs {
            let counts = match self.queues.get_queue_metrics(&queue).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("⚠️ Scaling assessment failed for {}: {}", queue, e);
                    continue;
                }
            };

            let metrics = {
                let mut state = self.state.lock().await;
                let metrics = LoadMetrics {
                    queue: queue.clone(),
                    waiting: counts.waiting,
                    active: counts.active,
                    completed: counts.completed,
                    failed: counts.failed,
                    delayed: counts.delayed,
                    current_workers: counts.workers,
                    throughput: state.throughput(&queue, counts.completed, now),
                    load_factor: load_factor(counts.waiting, counts.active, counts.workers),
                    timestamp: now,
                };
                state.last_metrics.insert(queue.clone(), metrics.clone());
                state.current_workers.entry(queue.clone()).or_insert(counts.workers);
                metrics
            };
            let decision = decide(&config, &metrics);
            if decision.action == ScalingActionKind::NoChange {
                continue;
            }

            let applied = self.push_concurrency(&queue, decision.new_workers).await;
            let action = ScalingAction {
                queue: queue.clone(),
                action: decision.action,
                previous_workers: metrics.current_workers,
                new_workers: decision.new_workers,
                reason: decision.reason,
                timestamp: now,
                applied,
            };
            tracing::info!(
                "⚖️ {} {:?}: {} → {} workers ({})",
                queue,
                action.action,
                action.previous_workers,
                action.new_workers,
                action.reason
            );
            self.state.lock().await.record(action.clone());
            actions.push(action);
        }
        actions
    }

    async fn push_concurrency(&self, queue: &str, workers: u32) -> bool {
        match self.queues.set_concurrency(queue, workers).await {
            Ok(applied) => {
                if !applied {
                    tracing::warn!("⚠️ Backend did not apply concurrency {} for {}", workers, queue);
                }
                applied
            }
            Err(e) => {
                tracing::warn!("⚠️ Concurrency update failed for {}: {}", queue, e);
                false
            }
        }
    }

    pub async fn manual_scale(&self, queue: &str, target: u32, reason: &str) -> Result<ScalingAction> {
        self.manual_scale_at(queue, target, reason, Utc::now()).await
    }

    /// Operator-requested worker count. Bounds and cooldown still apply.
    pub async fn manual_scale_at(
        &self,
        queue: &str,
        target: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ScalingAction> {
        let _scaling = self.scaling.lock().await;
        let (config, known_workers) = {
            let state = self.state.lock().await;
            let config = state
                .configs
                .get(queue)
                .cloned()
                .ok_or_else(|| PostflowError::Unknown(format!("no scaling config for queue '{queue}'")))?;

            if !config.contains(target) {
                return Err(PostflowError::Validation(format!(
                    "target {} outside bounds [{}, {}] for {}",
                    target, config.min_workers, config.max_workers, queue
                )));
            }
            if state.in_cooldown(queue, &config, now) {
                return Err(PostflowError::Validation(format!(
                    "{} is in its {}-minute cooldown",
                    queue, config.cooldown_minutes
                )));
            }
            let known = state.current_workers.get(queue).copied();
            (config, known)
        };

        let previous = match self.queues.get_queue_metrics(queue).await {
            Ok(c) => c.workers,
            Err(_) => known_workers.unwrap_or(config.min_workers),
        };
        let applied = self.push_concurrency(queue, target).await;
        let action = ScalingAction {
            queue: queue.to_string(),
            action: ScalingActionKind::between(previous, target),
            previous_workers: previous,
            new_workers: target,
            reason: if reason.is_empty() {
                "Manual".to_string()
            } else {
                format!("Manual: {reason}")
            },
            timestamp: now,
            applied,
        };
        tracing::info!("🖐️ Manual scale {}: {} → {} workers", queue, previous, target);
        self.state.lock().await.record(action.clone());
        Ok(action)
    }

    /// Merge a partial update into a queue's config.
    pub async fn update_scaling_config(
        &self,
        queue: &str,
        patch: &ScalingConfigPatch,
    ) -> Result<ScalingConfig> {
        let mut state = self.state.lock().await;
        let current = state
            .configs
            .get(queue)
            .ok_or_else(|| PostflowError::Unknown(format!("no scaling config for queue '{queue}'")))?;
        let updated = patch.apply(current)?;
        state.configs.insert(queue.to_string(), updated.clone());
        tracing::info!("🛠️ Scaling config updated for {}", queue);
        Ok(updated)
    }

    pub async fn config(&self, queue: &str) -> Option<ScalingConfig> {
        self.state.lock().await.configs.get(queue).cloned()
    }

    pub async fn status(&self) -> ScalerStatus {
        let state = self.state.lock().await;
        ScalerStatus {
            active: self.is_active(),
            interval_secs: self.ticker.period().as_secs(),
            configs: state.configs.clone(),
            last_metrics: state.last_metrics.clone(),
            recent_actions: state.history.recent(10),
            current_workers: state.current_workers.clone(),
        }
    }

    /// Last computed load per queue.
    pub async fn metrics(&self) -> BTreeMap<String, LoadMetrics> {
        self.state.lock().await.last_metrics.clone()
    }

    /// Newest actions first.
    pub async fn history(&self, limit: usize) -> Vec<ScalingAction> {
        self.state.lock().await.history.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postflow_queue::{JobOptions, MemoryQueueBackend};

    fn metrics(waiting: u64, active: u64, workers: u32) -> LoadMetrics {
        LoadMetrics {
            queue: "q".into(),
            waiting,
            active,
            completed: 0,
            failed: 0,
            delayed: 0,
            current_workers: workers,
            throughput: 0.0,
            load_factor: load_factor(waiting, active, workers),
            timestamp: Utc::now(),
        }
    }

    fn config_a() -> ScalingConfig {
        ScalingConfig {
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.3,
            ..ScalingConfig::new(1, 5, 5)
        }
    }

    #[test]
    fn test_scale_up_on_backlog() {
        let m = metrics(12, 2, 2);
        assert!((m.load_factor - 0.7).abs() < 1e-9);
        let d = decide(&config_a(), &m);
        assert_eq!(d.action, ScalingActionKind::ScaleUp);
        assert_eq!(d.new_workers, 3);
    }

    #[test]
    fn test_scale_down_when_idle() {
        let config = ScalingConfig { max_workers: 5, ..config_a() };
        let d = decide(&config, &metrics(0, 0, 3));
        assert_eq!(d.action, ScalingActionKind::ScaleDown);
        assert_eq!(d.new_workers, 2);
    }

    #[test]
    fn test_high_load_adds_one() {
        // waiting below target, but 9 jobs per worker
        let config = ScalingConfig::new(1, 10, 100);
        let d = decide(&config, &metrics(8, 10, 2));
        assert_eq!(d.action, ScalingActionKind::ScaleUp);
        assert_eq!(d.new_workers, 3);
    }

    #[test]
    fn test_proportional_scale_down() {
        let config = ScalingConfig { scale_down_threshold: 0.5, ..ScalingConfig::new(1, 10, 20) };
        // 5 waiting < 10, load factor 0.3 so not idle
        let d = decide(&config, &metrics(5, 19, 8));
        assert_eq!(d.action, ScalingActionKind::ScaleDown);
        assert_eq!(d.new_workers, 6);
    }

    #[test]
    fn test_no_change_at_bounds() {
        let config = config_a();
        assert_eq!(decide(&config, &metrics(500, 50, 5)).action, ScalingActionKind::NoChange);
        assert_eq!(decide(&config, &metrics(0, 0, 1)).action, ScalingActionKind::NoChange);
    }

    #[test]
    fn test_out_of_bounds_workers_are_clamped() {
        let config = ScalingConfig::new(2, 4, 10);
        let d = decide(&config, &metrics(10, 0, 0));
        assert_eq!(d.new_workers, 2);
        assert_eq!(d.action, ScalingActionKind::ScaleUp);
        let d = decide(&config, &metrics(10, 0, 9));
        assert_eq!(d.new_workers, 4);
        assert_eq!(d.action, ScalingActionKind::ScaleDown);
    }

    #[test]
    fn test_decision_always_within_bounds() {
        let configs = [
            ScalingConfig::new(1, 1, 1),
            ScalingConfig::new(1, 5, 5),
            ScalingConfig { scale_up_threshold: 0.1, scale_down_threshold: 1.0, ..ScalingConfig::new(3, 40, 7) },
        ];
        for config in &configs {
            for workers in [0, 1, 2, 3, 7, 40, 100] {
                for waiting in [0, 1, 5, 50, 5_000] {
                    for active in [0, 3, 300] {
                        let m = metrics(waiting, active, workers);
                        assert!((0.0..=1.0).contains(&m.load_factor));
                        let d = decide(config, &m);
                        assert!(config.contains(d.new_workers), "{config:?} {m:?} -> {d:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_workers_count_as_one() {
        assert_eq!(load_factor(5, 0, 0), load_factor(5, 0, 1));
        assert_eq!(load_factor(1_000, 1_000, 1), 1.0);
    }

    #[test]
    fn test_patch_validation() {
        let base = config_a();
        let patched = ScalingConfigPatch { max_workers: Some(8), ..Default::default() }
            .apply(&base)
            .unwrap();
        assert_eq!(patched.max_workers, 8);
        assert_eq!(base.max_workers, 5);

        let bad = ScalingConfigPatch { min_workers: Some(6), ..Default::default() }.apply(&base);
        assert!(matches!(bad, Err(PostflowError::Validation(_))));
        let bad = ScalingConfigPatch { scale_down_threshold: Some(1.5), ..Default::default() }.apply(&base);
        assert!(bad.is_err());
        let bad = ScalingConfigPatch { scale_up_threshold: Some(0.0), ..Default::default() }.apply(&base);
        assert!(bad.is_err());

        let wire: ScalingConfigPatch =
            serde_json::from_str(r#"{"maxWorkers": 7, "cooldownMinutes": 1}"#).unwrap();
        assert_eq!(wire.max_workers, Some(7));
        assert_eq!(wire.cooldown_minutes, Some(1));
    }

    #[test]
    fn test_config_overrides() {
        let mut cfg = AutoscalingConfig::default();
        cfg.queues.insert(
            METRICS_SYNC.into(),
            QueueScalingOverride { max_workers: Some(12), ..Default::default() },
        );
        let configs = scaling_configs_from(&cfg).unwrap();
        assert_eq!(configs[METRICS_SYNC].max_workers, 12);
        assert_eq!(configs.len(), 5);

        cfg.queues.insert(
            NOTIFICATIONS.into(),
            QueueScalingOverride { min_workers: Some(9), ..Default::default() },
        );
        assert!(matches!(scaling_configs_from(&cfg), Err(PostflowError::Config(_))));
    }

    async fn scaler_with(queue: &str, config: ScalingConfig) -> (Arc<MemoryQueueBackend>, AutoScaler) {
        let backend = Arc::new(MemoryQueueBackend::new().with_default_workers(2));
        let manager = QueueManager::with_queues(vec![queue.to_string()]);
        manager.initialize(backend.clone());
        let mut configs = BTreeMap::new();
        configs.insert(queue.to_string(), config);
        (backend, AutoScaler::new(Arc::new(manager), configs, Duration::from_secs(120)))
    }

    async fn fill(backend: &MemoryQueueBackend, queue: &str, n: usize) {
        use postflow_queue::QueueBackend;
        for _ in 0..n {
            backend.add_job(queue, "job", serde_json::json!({}), JobOptions::default()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_tick_scales_and_respects_cooldown() {
        let (backend, scaler) = scaler_with("qa", config_a()).await;
        fill(&backend, "qa", 12).await;
        let now = Utc::now();

        let actions = scaler.assess_at(now).await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].new_workers, 3);
        assert!(actions[0].applied);

        // Still a backlog, but within the 5-minute cooldown
        assert!(scaler.assess_at(now + chrono::Duration::minutes(2)).await.is_empty());
        let later = scaler.assess_at(now + chrono::Duration::minutes(6)).await;
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].previous_workers, 3);

        let history = scaler.history(10).await;
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp - history[1].timestamp >= chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_manual_scale_rejected_out_of_bounds() {
        let config = ScalingConfig::new(1, 10, 5);
        let (_backend, scaler) = scaler_with("queueA", config).await;

        let err = scaler.manual_scale("queueA", 50, "burst").await.unwrap_err();
        assert!(matches!(err, PostflowError::Validation(_)));
        assert!(scaler.history(10).await.is_empty());

        let err = scaler.manual_scale("unknown", 2, "").await.unwrap_err();
        assert!(matches!(err, PostflowError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_manual_scale_applies_and_starts_cooldown() {
        let (backend, scaler) = scaler_with("qa", config_a()).await;
        let now = Utc::now();

        let action = scaler.manual_scale_at("qa", 4, "campaign", now).await.unwrap();
        assert_eq!(action.reason, "Manual: campaign");
        assert_eq!(action.previous_workers, 2);
        use postflow_queue::QueueBackend;
        assert_eq!(backend.counts("qa").await.unwrap().workers, 4);

        let err = scaler
            .manual_scale_at("qa", 3, "again", now + chrono::Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PostflowError::Validation(_)));
        assert!(scaler.assess_at(now + chrono::Duration::minutes(1)).await.is_empty());
        assert_eq!(scaler.history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_assessment_is_skipped() {
        let (backend, scaler) = scaler_with("qa", config_a()).await;
        backend.set_offline(true);
        assert!(scaler.assess_now().await.is_empty());
        assert!(scaler.metrics().await.is_empty());
    }

    #[tokio::test]
    async fn test_throughput_between_ticks() {
        let (backend, scaler) = scaler_with("qa", ScalingConfig::new(2, 2, 10)).await;
        fill(&backend, "qa", 3).await;
        let now = Utc::now();
        scaler.assess_at(now).await;
        for job in backend.jobs("qa") {
            backend.complete("qa", &job.id, now).unwrap();
        }
        scaler.assess_at(now + chrono::Duration::minutes(2)).await;
        let m = &scaler.metrics().await["qa"];
        assert!((m.throughput - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_config_and_status() {
        let (_backend, scaler) = scaler_with("qa", config_a()).await;
        let updated = scaler
            .update_scaling_config("qa", &ScalingConfigPatch { max_workers: Some(9), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(updated.max_workers, 9);
        assert!(scaler
            .update_scaling_config("nope", &ScalingConfigPatch::default())
            .await
            .is_err());

        let status = scaler.status().await;
        assert!(!status.active);
        assert_eq!(status.interval_secs, 120);
        assert_eq!(status.configs["qa"].max_workers, 9);
    }

    /// Backend whose `counts` never returns.
    struct StalledBackend {
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl postflow_queue::QueueBackend for StalledBackend {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn add_job(
            &self,
            _queue: &str,
            _job_type: &str,
            _payload: serde_json::Value,
            _opts: JobOptions,
        ) -> Result<postflow_queue::Job> {
            Err(PostflowError::Unavailable("stalled".into()))
        }
        async fn counts(&self, _queue: &str) -> Result<postflow_queue::QueueCounts> {
            self.entered.notify_one();
            std::future::pending().await
        }
        async fn pause(&self, _queue: &str) -> Result<()> {
            Ok(())
        }
        async fn resume(&self, _queue: &str) -> Result<()> {
            Ok(())
        }
        async fn clean(&self, _queue: &str, _state: postflow_queue::JobState, _max_age: Duration) -> Result<u64> {
            Ok(0)
        }
        async fn get_job(&self, _queue: &str, _id: &str) -> Result<Option<postflow_queue::Job>> {
            Ok(None)
        }
        async fn set_concurrency(&self, _queue: &str, _workers: u32) -> Result<bool> {
            Ok(true)
        }
        async fn ping(&self) -> Result<Duration> {
            Ok(Duration::ZERO)
        }
        async fn cluster_info(&self) -> Result<postflow_queue::ClusterInfo> {
            Ok(Default::default())
        }
        async fn performance(&self) -> Result<postflow_queue::PerformanceCounters> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn test_status_reads_do_not_wait_for_stalled_tick() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let manager = QueueManager::with_queues(vec!["qa".to_string()]);
        manager.initialize(Arc::new(StalledBackend { entered: entered.clone() }));
        let mut configs = BTreeMap::new();
        configs.insert("qa".to_string(), config_a());
        let scaler = Arc::new(AutoScaler::new(Arc::new(manager), configs, Duration::from_secs(120)));

        let tick = tokio::spawn({
            let scaler = scaler.clone();
            async move { scaler.assess_now().await }
        });
        entered.notified().await;

        let status = tokio::time::timeout(Duration::from_secs(2), scaler.status())
            .await
            .expect("status blocked behind the tick");
        assert_eq!(status.configs.len(), 1);
        assert!(tokio::time::timeout(Duration::from_secs(2), scaler.history(5)).await.is_ok());
        assert!(tokio::time::timeout(Duration::from_secs(2), scaler.metrics()).await.is_ok());
        tick.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_loop() {
        let (backend, scaler) = scaler_with("qa", config_a()).await;
        fill(&backend, "qa", 12).await;
        let scaler = Arc::new(scaler);
        assert!(scaler.start());
        assert!(!scaler.start());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scaler.history(10).await.len(), 1);
        assert!(scaler.stop());
        scaler.shutdown().await;
        assert!(!scaler.is_active());
    }
}
