//! # Postflow Monitor
//!
//! Periodic health collection for the job subsystem.
//!
//! ```text
//! SystemMonitor (RepeatingTask, every 5 min)
//!   ├── QueueManager   → ping, cluster nodes, perf counters, queue totals
//!   ├── AccountSource  → token-validity summary
//!   ├── PlatformProbe  → per-platform HTTP status checks
//!   ├── HostProbe      → /proc memory, load, RSS, uptime
//!   ├── assess()       → score 0-100, issues, recommendations
//!   └── AlertEngine    → per-rule cooldowns → AlertStore + dispatch
//!                                                ├── Telegram
//!                                                ├── Discord
//!                                                └── Webhook
//! ```

pub mod alerts;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod probes;

pub use alerts::{Alert, AlertEngine, AlertRule, AlertRuleInfo, AlertSeverity};
pub use dispatch::NotifyTarget;
pub use health::{assess, HealthThresholds};
pub use metrics::{HealthAssessment, OverallHealth, SystemMetrics};
pub use monitor::{AlertStore, MonitorStatus, SystemMonitor};
pub use probes::{HostProbe, HttpPlatformProbe, PlatformProbe, ProcHostProbe};
