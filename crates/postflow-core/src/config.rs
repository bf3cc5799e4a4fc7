//! Postflow configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{PostflowError, Result};

/// Environment variable that overrides `gateway.admin_key`.
pub const ADMIN_KEY_ENV: &str = "POSTFLOW_ADMIN_KEY";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostflowConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub autoscaling: AutoscalingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl PostflowConfig {
    /// Load config from the default path (~/.postflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PostflowError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content).map(Self::with_env_overrides)
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PostflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PostflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Postflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".postflow")
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(ADMIN_KEY_ENV) {
            if !key.is_empty() {
                self.gateway.admin_key = Some(key);
            }
        }
        self
    }

    /// Reject values the control loops cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduling.max_concurrent_syncs == 0 {
            return Err(PostflowError::Config(
                "scheduling.max_concurrent_syncs must be at least 1".into(),
            ));
        }
        if self.autoscaling.interval_secs == 0 || self.monitoring.interval_secs == 0 {
            return Err(PostflowError::Config("loop intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// Queue broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379".into() }
fn default_key_prefix() -> String { "postflow".into() }

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Scheduler database (task log, accounts, alert history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.postflow/postflow.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Sync fan-out and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    #[serde(default = "default_delay_between_accounts_ms")]
    pub delay_between_accounts_ms: u64,
    #[serde(default = "bool_true")]
    pub respect_rate_limits: bool,
    #[serde(default = "bool_true")]
    pub enable_duplicate_prevention: bool,
    #[serde(default = "default_duplicate_window_minutes")]
    pub duplicate_window_minutes: u64,
    /// Ceiling for any computed retry delay.
    #[serde(default = "default_backoff_max_delay_secs")]
    pub backoff_max_delay_secs: u64,
}

fn bool_true() -> bool { true }
fn default_max_concurrent_syncs() -> usize { 5 }
fn default_delay_between_accounts_ms() -> u64 { 2_000 }
fn default_duplicate_window_minutes() -> u64 { 30 }
fn default_backoff_max_delay_secs() -> u64 { 3_600 }

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: default_max_concurrent_syncs(),
            delay_between_accounts_ms: default_delay_between_accounts_ms(),
            respect_rate_limits: true,
            enable_duplicate_prevention: true,
            duplicate_window_minutes: default_duplicate_window_minutes(),
            backoff_max_delay_secs: default_backoff_max_delay_secs(),
        }
    }
}

/// Auto-scaler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_autoscaling_interval")]
    pub interval_secs: u64,
    /// Per-queue overrides applied on top of the built-in defaults.
    #[serde(default)]
    pub queues: HashMap<String, QueueScalingOverride>,
}

fn default_autoscaling_interval() -> u64 { 120 }

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_autoscaling_interval(),
            queues: HashMap::new(),
        }
    }
}

/// Optional per-queue scaling overrides. Unset fields keep the default.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct QueueScalingOverride {
    pub min_workers: Option<u32>,
    pub max_workers: Option<u32>,
    pub target_waiting_jobs: Option<u64>,
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    pub cooldown_minutes: Option<u64>,
    pub enabled: Option<bool>,
}

/// System monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_monitoring_interval")]
    pub interval_secs: u64,
    /// Backend memory above this is a health issue.
    #[serde(default = "default_backend_memory_warn_mb")]
    pub backend_memory_warn_mb: u64,
    /// Process memory budget; unset means total host memory.
    #[serde(default)]
    pub process_memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub platform_probes: Vec<PlatformProbeConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_monitoring_interval() -> u64 { 300 }
fn default_backend_memory_warn_mb() -> u64 { 800 }

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitoring_interval(),
            backend_memory_warn_mb: default_backend_memory_warn_mb(),
            process_memory_limit_mb: None,
            platform_probes: Vec::new(),
            notify: NotifyConfig::default(),
        }
    }
}

/// One publisher status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformProbeConfig {
    pub platform: String,
    pub url: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_timeout() -> u64 { 10 }

/// Where fired alerts are delivered, in addition to the log and database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

/// Admin HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Shared secret for the admin API. Requests are refused while unset.
    #[serde(default)]
    pub admin_key: Option<String>,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            admin_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = PostflowConfig::from_toml("").unwrap();
        assert_eq!(config.scheduling.max_concurrent_syncs, 5);
        assert_eq!(config.scheduling.duplicate_window_minutes, 30);
        assert_eq!(config.autoscaling.interval_secs, 120);
        assert_eq!(config.monitoring.interval_secs, 300);
        assert_eq!(config.gateway.port, 3000);
        assert!(config.gateway.admin_key.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = PostflowConfig::from_toml(
            r#"
            [scheduling]
            max_concurrent_syncs = 2
            respect_rate_limits = false

            [autoscaling.queues.metrics-sync]
            max_workers = 12
            cooldown_minutes = 3

            [[monitoring.platform_probes]]
            platform = "facebook"
            url = "https://status.example.com/facebook"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduling.max_concurrent_syncs, 2);
        assert!(!config.scheduling.respect_rate_limits);
        assert_eq!(config.scheduling.delay_between_accounts_ms, 2_000);
        let o = &config.autoscaling.queues["metrics-sync"];
        assert_eq!(o.max_workers, Some(12));
        assert_eq!(o.min_workers, None);
        assert_eq!(config.monitoring.platform_probes[0].timeout_secs, 10);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = PostflowConfig::from_toml("[scheduling]\nmax_concurrent_syncs = 0").unwrap_err();
        assert!(matches!(err, PostflowError::Config(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("postflow-config-test");
        let path = dir.join("config.toml");
        let mut config = PostflowConfig::default();
        config.gateway.port = 4100;
        config.save_to(&path).unwrap();
        let loaded = PostflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 4100);
        std::fs::remove_dir_all(&dir).ok();
    }
}
