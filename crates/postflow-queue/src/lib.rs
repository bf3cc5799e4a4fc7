//! # Postflow Queue
//!
//! Typed boundary over the job broker.
//!
//! ```text
//! SyncScheduler ─┐
//! AutoScaler ────┼──► QueueManager ──► dyn QueueBackend
//! SystemMonitor ─┘     (registry)        ├── RedisQueueBackend  (production)
//!                                        └── MemoryQueueBackend (tests / dev)
//! ```

pub mod backend;
pub mod job;
pub mod manager;
pub mod memory;
pub mod redis_backend;

pub use backend::{ClusterInfo, ClusterNode, PerformanceCounters, QueueBackend, QueueCounts};
pub use job::{Backoff, BackoffKind, Job, JobHandle, JobOptions, JobState};
pub use manager::QueueManager;
pub use memory::MemoryQueueBackend;
pub use redis_backend::{RedisQueueBackend, redacted_address};
