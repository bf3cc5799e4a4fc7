//! Job definitions: the unit of work handed to the queue backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job inside the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
        }
    }

    /// Terminal states are the only ones `clean` may remove.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" | "wait" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "paused" => Ok(JobState::Paused),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: base.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: base.as_millis() as u64,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, max_delay: Duration) -> Duration {
        let cap = max_delay.as_millis() as u64;
        let ms = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(63);
                self.base_delay_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms.min(cap))
    }
}

/// Submission options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Milliseconds before the job becomes eligible.
    pub delay_ms: u64,
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Lower runs earlier; 1 is the highest priority.
    pub priority: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(30)),
            priority: 5,
        }
    }
}

impl JobOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// A job as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// When a delayed job (or a retry) becomes eligible.
    pub ready_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn new(
        id: String,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let state = if opts.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let ready_at = now + chrono::Duration::milliseconds(opts.delay_ms as i64);
        Self {
            id,
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            opts,
            state,
            attempts_made: 0,
            created_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            queue: self.queue.clone(),
            job_type: self.job_type.clone(),
        }
    }

    /// Mark the job as taken by a worker.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.processed_at = Some(now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.finished_at = Some(now);
    }

    /// Record a failed attempt. The job goes back to `Delayed` with the backoff
    /// delay while attempts remain, and to terminal `Failed` afterwards.
    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>, max_delay: Duration) -> JobState {
        self.attempts_made += 1;
        self.failed_reason = Some(reason.to_string());
        if self.attempts_made >= self.opts.attempts {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
        } else {
            let delay = self.opts.backoff.delay_for(self.attempts_made, max_delay);
            self.ready_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.state = JobState::Delayed;
        }
        self.state
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub job_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_exponential_doubles() {
        let b = Backoff::exponential(Duration::from_secs(30));
        assert_eq!(b.delay_for(1, HOUR), Duration::from_secs(30));
        assert_eq!(b.delay_for(2, HOUR), Duration::from_secs(60));
        assert_eq!(b.delay_for(3, HOUR), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_is_capped() {
        let b = Backoff::exponential(Duration::from_secs(30));
        assert_eq!(b.delay_for(20, HOUR), HOUR);
        assert_eq!(b.delay_for(200, HOUR), HOUR);
        let f = Backoff::fixed(Duration::from_secs(7200));
        assert_eq!(f.delay_for(1, HOUR), HOUR);
    }

    #[test]
    fn test_retry_until_exhausted() {
        let now = Utc::now();
        let opts = JobOptions::default().with_attempts(3);
        let mut job = Job::new("1".into(), "q", "t", serde_json::json!({}), opts, now);
        assert_eq!(job.state, JobState::Waiting);

        job.start(now);
        assert_eq!(job.record_failure("boom", now, HOUR), JobState::Delayed);
        assert_eq!(job.ready_at, now + chrono::Duration::seconds(30));
        job.start(now);
        assert_eq!(job.record_failure("boom", now, HOUR), JobState::Delayed);
        assert_eq!(job.ready_at, now + chrono::Duration::seconds(60));
        job.start(now);
        assert_eq!(job.record_failure("boom", now, HOUR), JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_delayed_on_submit() {
        let now = Utc::now();
        let opts = JobOptions::default().with_delay(Duration::from_secs(5));
        let job = Job::new("2".into(), "q", "t", serde_json::Value::Null, opts, now);
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.ready_at, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("completed".parse::<JobState>().unwrap(), JobState::Completed);
        assert!("bogus".parse::<JobState>().is_err());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }
}
