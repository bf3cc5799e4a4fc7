//! Error taxonomy shared by every Postflow crate.

use thiserror::Error;

/// Errors raised by the scheduling and self-regulation subsystem.
#[derive(Debug, Error)]
pub enum PostflowError {
    /// Backend or queue manager not initialized, or unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Input outside the accepted range, or a required field is missing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reference to an unconfigured queue, alert rule or job.
    #[error("Unknown: {0}")]
    Unknown(String),

    /// A job attempt failed; retried per its backoff until attempts run out.
    #[error("Job failed: {0}")]
    TransientJobFailure(String),

    /// A single health probe failed during collection.
    #[error("Probe failed: {0}")]
    ProbeFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PostflowError {
    /// Short machine-readable kind, used in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Validation(_) => "validation",
            Self::Unknown(_) => "unknown",
            Self::TransientJobFailure(_) => "job_failure",
            Self::ProbeFailure(_) => "probe_failure",
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, PostflowError>;
