//! # Postflow Core
//!
//! Shared kernel for the Postflow workspace: configuration, the error
//! taxonomy every crate returns, and two small runtime primitives used by the
//! control loops.
//!
//! ```text
//! PostflowConfig (TOML)
//!   ├── redis / database     → queue backend + scheduler DB
//!   ├── scheduling           → sync fan-out, duplicate window, backoff cap
//!   ├── autoscaling          → scaler interval + per-queue bounds
//!   ├── monitoring           → monitor interval, probes, alert targets
//!   └── gateway              → admin HTTP surface
//! ```

pub mod config;
pub mod error;
pub mod ring;
pub mod ticker;

pub use config::PostflowConfig;
pub use error::{PostflowError, Result};
pub use ring::BoundedRing;
pub use ticker::RepeatingTask;
