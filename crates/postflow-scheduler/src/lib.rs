//! # Postflow Scheduler
//!
//! Decides what goes onto the queues and how many workers drain them.
//!
//! ## Architecture
//! ```text
//! SyncScheduler
//!   ├── AccountSource → accounts with valid tokens
//!   ├── LanePool (k lanes, shared cursor, per-lane pacing)
//!   │     └── TaskLog duplicate check → QueueManager::add_job → TaskLog entry
//!   └── get_sync_statistics → TaskLog window aggregates
//!
//! AutoScaler (RepeatingTask, every 2 min)
//!   ├── QueueManager counts → LoadMetrics
//!   ├── decide() → scale_up / scale_down / no_change within [min, max]
//!   └── set_concurrency + ScalingAction ring (last 100)
//!
//! SchedulerDb (SQLite)
//!   └── task_log, social_accounts, alerts
//! ```

pub mod autoscaler;
pub mod lanes;
pub mod stats;
pub mod store;
pub mod sync;

pub use autoscaler::{
    AutoScaler, LoadMetrics, ScalerStatus, ScalingAction, ScalingActionKind, ScalingConfig,
    ScalingConfigPatch,
};
pub use lanes::LanePool;
pub use stats::{StatsRange, SyncStatistics};
pub use store::{
    AccountSource, SchedulerDb, SocialAccount, TaskLog, TaskLogEntry, TaskLogStatus, TokenSummary,
};
pub use sync::{InitialSyncOptions, SyncKind, SyncRequest, SyncRunSummary, SyncScheduler, SyncSchedulerOptions};
