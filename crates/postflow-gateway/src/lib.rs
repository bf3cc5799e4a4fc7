//! # Postflow Gateway
//!
//! Admin HTTP surface over the queue, scaler, monitor and sync scheduler.
//!
//! ```text
//! GET  /health                     public liveness
//! GET  /api/v1/admin[?action=...]  overview or a read action
//! POST /api/v1/admin {"action"}    control action
//! ```
//!
//! Admin routes require `X-Admin-Key` (or `?key=`).

pub mod routes;
pub mod server;

pub use routes::{READ_ACTIONS, WRITE_ACTIONS};
pub use server::{AppState, build_router, serve};
