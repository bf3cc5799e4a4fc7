//! Sync Scheduler: fans metric-sync jobs out across every connected account.
//!
//! Dispatch is bounded by [`LanePool`], paced per lane when rate limits are
//! respected, and de-duplicated against the task log.

use chrono::{DateTime, Utc};
use postflow_core::config::SchedulingConfig;
use postflow_core::{PostflowError, Result};
use postflow_queue::manager::{INITIAL_SYNC, METRICS_SYNC};
use postflow_queue::{Backoff, JobHandle, JobOptions, QueueManager};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lanes::LanePool;
use crate::stats::{StatsRange, SyncStatistics};
use crate::store::{AccountSource, SocialAccount, TaskLog, TaskLogStatus};

/// Kind of synchronization job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// First sync after an account is connected.
    Initial,
    /// Recent posts only, several times a day.
    Incremental,
    /// Once a day over the last `lookback_days`.
    Daily,
}

impl SyncKind {
    pub const ALL: [SyncKind; 3] = [SyncKind::Initial, SyncKind::Incremental, SyncKind::Daily];

    pub fn job_type(&self) -> &'static str {
        match self {
            SyncKind::Initial => "initial_sync",
            SyncKind::Incremental => "incremental_sync",
            SyncKind::Daily => "daily_sync",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            SyncKind::Initial => INITIAL_SYNC,
            SyncKind::Incremental | SyncKind::Daily => METRICS_SYNC,
        }
    }

    pub fn default_priority(&self) -> u32 {
        match self {
            SyncKind::Initial => 1,
            SyncKind::Incremental => 5,
            SyncKind::Daily => 10,
        }
    }

    /// Retry policy for this kind of job.
    pub fn job_options(&self, priority: u32) -> JobOptions {
        let opts = JobOptions::default().with_attempts(3).with_priority(priority);
        match self {
            SyncKind::Initial => opts
                .with_delay(Duration::from_secs(5))
                .with_backoff(Backoff::exponential(Duration::from_secs(10))),
            SyncKind::Incremental | SyncKind::Daily => {
                opts.with_backoff(Backoff::exponential(Duration::from_secs(30)))
            }
        }
    }

    /// Parse the job type back out of a `sync:<jobType>:<accountId>` log name.
    pub fn from_log_name(name: &str) -> Option<SyncKind> {
        let job_type = name.strip_prefix("sync:")?.split(':').next()?;
        SyncKind::ALL.into_iter().find(|k| k.job_type() == job_type)
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.job_type())
    }
}

/// One sync job to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub account_id: String,
    pub team_id: String,
    pub platform: String,
    pub kind: SyncKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    pub priority: u32,
}

impl SyncRequest {
    pub fn initial(account: &SocialAccount, opts: &InitialSyncOptions) -> Self {
        Self::base(account, SyncKind::Initial, opts.priority).with_lookback(opts.lookback_days)
    }

    pub fn incremental(account: &SocialAccount) -> Self {
        let mut req = Self::base(account, SyncKind::Incremental, SyncKind::Incremental.default_priority());
        req.limit = Some(50);
        req
    }

    pub fn daily(account: &SocialAccount) -> Self {
        Self::base(account, SyncKind::Daily, SyncKind::Daily.default_priority()).with_lookback(1)
    }

    fn base(account: &SocialAccount, kind: SyncKind, priority: u32) -> Self {
        Self {
            account_id: account.id.clone(),
            team_id: account.team_id.clone(),
            platform: account.platform.clone(),
            kind,
            lookback_days: None,
            limit: None,
            priority,
        }
    }

    fn with_lookback(mut self, days: u32) -> Self {
        self.lookback_days = Some(days);
        self
    }

    /// Task log name shared by every attempt for this `(account, kind)` pair.
    pub fn log_name(&self) -> String {
        format!("sync:{}:{}", self.kind.job_type(), self.account_id)
    }
}

/// Options for a one-off initial sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialSyncOptions {
    pub lookback_days: u32,
    pub priority: u32,
}

impl Default for InitialSyncOptions {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            priority: SyncKind::Initial.default_priority(),
        }
    }
}

/// Fan-out behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedulerOptions {
    pub max_concurrent_syncs: usize,
    pub delay_between_accounts: Duration,
    pub respect_rate_limits: bool,
    pub enable_duplicate_prevention: bool,
    pub duplicate_window: Duration,
}

impl Default for SyncSchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulingConfig::default())
    }
}

impl From<&SchedulingConfig> for SyncSchedulerOptions {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            max_concurrent_syncs: config.max_concurrent_syncs.max(1),
            delay_between_accounts: Duration::from_millis(config.delay_between_accounts_ms),
            respect_rate_limits: config.respect_rate_limits,
            enable_duplicate_prevention: config.enable_duplicate_prevention,
            duplicate_window: Duration::from_secs(config.duplicate_window_minutes * 60),
        }
    }
}

/// Aggregate result of one fan-out run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub scheduled: u64,
    pub skipped: u64,
    pub errors: u64,
    pub error_messages: Vec<String>,
}

impl SyncRunSummary {
    pub fn total(&self) -> u64 {
        self.scheduled + self.skipped + self.errors
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Scheduled(JobHandle),
    Skipped,
    Failed(String),
}

/// Batch sync scheduler.
pub struct SyncScheduler {
    queues: Arc<QueueManager>,
    task_log: Arc<dyn TaskLog>,
    accounts: Arc<dyn AccountSource>,
    options: SyncSchedulerOptions,
    /// Log names between their duplicate check and task log append.
    in_flight: Mutex<HashSet<String>>,
}

/// Holds a log name in `in_flight` until dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.name);
    }
}

impl SyncScheduler {
    pub fn new(
        queues: Arc<QueueManager>,
        task_log: Arc<dyn TaskLog>,
        accounts: Arc<dyn AccountSource>,
        options: SyncSchedulerOptions,
    ) -> Self {
        Self {
            queues,
            task_log,
            accounts,
            options,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &SyncSchedulerOptions {
        &self.options
    }

    /// Submit one initial sync. `None` when a recent attempt already exists.
    pub async fn schedule_initial_sync(
        &self,
        account: &SocialAccount,
        opts: InitialSyncOptions,
    ) -> Result<Option<JobHandle>> {
        let request = SyncRequest::initial(account, &opts);
        match self.dispatch(&request).await {
            DispatchOutcome::Scheduled(handle) => {
                tracing::info!("🔄 Initial sync queued for account {} ({})", account.id, handle.id);
                Ok(Some(handle))
            }
            DispatchOutcome::Skipped => Ok(None),
            DispatchOutcome::Failed(e) => Err(PostflowError::Unavailable(e)),
        }
    }

    pub async fn schedule_incremental_sync_for_all_accounts(&self) -> Result<SyncRunSummary> {
        self.schedule_for_all(SyncKind::Incremental).await
    }

    pub async fn schedule_daily_sync_for_all_accounts(&self) -> Result<SyncRunSummary> {
        self.schedule_for_all(SyncKind::Daily).await
    }

    async fn schedule_for_all(&self, kind: SyncKind) -> Result<SyncRunSummary> {
        let accounts = self.accounts.active_accounts(Utc::now()).await?;
        tracing::info!("🔄 Scheduling {} for {} accounts", kind, accounts.len());

        let requests: Vec<SyncRequest> = accounts
            .iter()
            .map(|a| match kind {
                SyncKind::Initial => SyncRequest::initial(a, &InitialSyncOptions::default()),
                SyncKind::Incremental => SyncRequest::incremental(a),
                SyncKind::Daily => SyncRequest::daily(a),
            })
            .collect();

        let mut pool = LanePool::new(self.options.max_concurrent_syncs);
        if self.options.respect_rate_limits {
            pool = pool.with_pause(self.options.delay_between_accounts);
        }

        let outcomes = pool
            .run(&requests, move |request| async move { self.dispatch(&request).await })
            .await;

        let mut summary = SyncRunSummary::default();
        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Scheduled(_) => summary.scheduled += 1,
                DispatchOutcome::Skipped => summary.skipped += 1,
                DispatchOutcome::Failed(e) => {
                    summary.errors += 1;
                    summary.error_messages.push(e);
                }
            }
        }
        tracing::info!(
            "✅ {} run: {} scheduled, {} skipped, {} errors",
            kind,
            summary.scheduled,
            summary.skipped,
            summary.errors
        );
        Ok(summary)
    }

    /// Duplicate check, submit, and task log record for one request.
    async fn dispatch(&self, request: &SyncRequest) -> DispatchOutcome {
        let now = Utc::now();
        let name = request.log_name();

        let _claim = if self.options.enable_duplicate_prevention {
            let Some(claim) = self.claim(&name) else {
                tracing::debug!("⏭️ Skipping {}: dispatch already in flight", name);
                return DispatchOutcome::Skipped;
            };
            match self.has_recent_attempt(&name, now).await {
                Ok(true) => {
                    tracing::debug!("⏭️ Skipping {}: recent attempt in task log", name);
                    return DispatchOutcome::Skipped;
                }
                Ok(false) => {}
                Err(e) => return DispatchOutcome::Failed(format!("{}: {e}", request.account_id)),
            }
            Some(claim)
        } else {
            None
        };

        let payload = match serde_json::to_value(request) {
            Ok(p) => p,
            Err(e) => return DispatchOutcome::Failed(format!("{}: {e}", request.account_id)),
        };
        let opts = request.kind.job_options(request.priority);

        match self
            .queues
            .add_job(request.kind.queue(), request.kind.job_type(), payload, opts)
            .await
        {
            Ok(handle) => {
                let message = serde_json::json!({
                    "job_id": handle.id,
                    "queue": handle.queue,
                    "team_id": request.team_id,
                    "platform": request.platform,
                });
                if let Err(e) = self
                    .task_log
                    .append(&name, TaskLogStatus::Pending, now, &message.to_string())
                    .await
                {
                    tracing::warn!("⚠️ Task log append failed for {}: {}", name, e);
                }
                DispatchOutcome::Scheduled(handle)
            }
            Err(e) => {
                let message = serde_json::json!({ "error": e.to_string() });
                if let Err(log_err) = self
                    .task_log
                    .append(&name, TaskLogStatus::Failed, now, &message.to_string())
                    .await
                {
                    tracing::warn!("⚠️ Task log append failed for {}: {}", name, log_err);
                }
                tracing::warn!("❌ Sync dispatch failed for {}: {}", name, e);
                DispatchOutcome::Failed(format!("{}: {e}", request.account_id))
            }
        }
    }

    /// `None` when another dispatch for `name` has not logged yet.
    fn claim(&self, name: &str) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(name.to_string()).then(|| Claim {
            set: &self.in_flight,
            name: name.to_string(),
        })
    }

    async fn has_recent_attempt(&self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        let window = chrono::Duration::from_std(self.options.duplicate_window)
            .map_err(|e| PostflowError::Validation(format!("duplicate window: {e}")))?;
        let entries = self.task_log.query(name, now - window).await?;
        Ok(entries
            .iter()
            .any(|e| e.name == name && e.status.blocks_duplicates()))
    }

    /// Task log aggregates over the given window.
    pub async fn get_sync_statistics(&self, range: StatsRange) -> Result<SyncStatistics> {
        let now = Utc::now();
        let entries = self.task_log.query("sync:", now - range.window()).await?;
        Ok(SyncStatistics::from_entries(range, &entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SchedulerDb, TaskLogEntry, TokenSummary};
    use async_trait::async_trait;
    use postflow_queue::MemoryQueueBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn account(id: &str) -> SocialAccount {
        SocialAccount {
            id: id.into(),
            team_id: "team-1".into(),
            platform: "tiktok".into(),
            token_expires_at: None,
        }
    }

    struct StaticAccounts(Vec<SocialAccount>);

    #[async_trait]
    impl AccountSource for StaticAccounts {
        async fn active_accounts(&self, _now: DateTime<Utc>) -> Result<Vec<SocialAccount>> {
            Ok(self.0.clone())
        }

        async fn token_summary(&self, _now: DateTime<Utc>) -> Result<TokenSummary> {
            Ok(TokenSummary { total: self.0.len() as u64, valid: self.0.len() as u64 })
        }
    }

    /// Task log that tracks how many duplicate checks run at once.
    struct CountingLog {
        inner: SchedulerDb,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskLog for CountingLog {
        async fn append(
            &self,
            name: &str,
            status: TaskLogStatus,
            executed_at: DateTime<Utc>,
            message: &str,
        ) -> Result<i64> {
            self.inner.append(name, status, executed_at, message).await
        }

        async fn query(&self, prefix: &str, since: DateTime<Utc>) -> Result<Vec<TaskLogEntry>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.query(prefix, since).await
        }
    }

    fn fast_options(k: usize) -> SyncSchedulerOptions {
        SyncSchedulerOptions {
            max_concurrent_syncs: k,
            respect_rate_limits: false,
            ..Default::default()
        }
    }

    fn queues() -> Arc<QueueManager> {
        let manager = QueueManager::new();
        manager.initialize(Arc::new(MemoryQueueBackend::new()));
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_duplicate_is_skipped() {
        let queues = queues();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let accounts = Arc::new(StaticAccounts(vec![account("a1")]));
        let scheduler = SyncScheduler::new(queues.clone(), db.clone(), accounts, fast_options(2));

        let first = scheduler.schedule_daily_sync_for_all_accounts().await.unwrap();
        assert_eq!((first.scheduled, first.skipped), (1, 0));
        let second = scheduler.schedule_daily_sync_for_all_accounts().await.unwrap();
        assert_eq!((second.scheduled, second.skipped), (0, 1));

        assert_eq!(queues.get_queue_metrics(METRICS_SYNC).await.unwrap().waiting, 1);
        let log = db.query("sync:daily_sync:a1", Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, TaskLogStatus::Pending);
        let message: serde_json::Value = serde_json::from_str(&log[0].message).unwrap();
        assert_eq!(message["queue"], METRICS_SYNC);
        assert_eq!(message["platform"], "tiktok");
    }

    #[tokio::test]
    async fn test_overlapping_dispatches_queue_once() {
        let queues = queues();
        let log = Arc::new(CountingLog {
            inner: SchedulerDb::open_in_memory().unwrap(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let acct = account("a1");
        let accounts = Arc::new(StaticAccounts(vec![acct.clone()]));
        let scheduler = SyncScheduler::new(queues.clone(), log.clone(), accounts, fast_options(2));

        let request = SyncRequest::daily(&acct);
        let (a, b) = tokio::join!(scheduler.dispatch(&request), scheduler.dispatch(&request));
        let scheduled = [&a, &b].iter().filter(|o| matches!(o, DispatchOutcome::Scheduled(_))).count();
        assert_eq!(scheduled, 1);
        assert!([&a, &b].contains(&&DispatchOutcome::Skipped));
        assert_eq!(queues.get_queue_metrics(METRICS_SYNC).await.unwrap().waiting, 1);

        // Claim released; the task log now blocks the next attempt
        assert!(scheduler.in_flight.lock().unwrap().is_empty());
        assert_eq!(scheduler.dispatch(&request).await, DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_duplicate_check_is_per_kind() {
        let queues = queues();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let accounts = Arc::new(StaticAccounts(vec![account("a1")]));
        let scheduler = SyncScheduler::new(queues, db, accounts, fast_options(1));

        assert_eq!(scheduler.schedule_daily_sync_for_all_accounts().await.unwrap().scheduled, 1);
        assert_eq!(scheduler.schedule_incremental_sync_for_all_accounts().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_block() {
        let queues = queues();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        db.append("sync:daily_sync:a1", TaskLogStatus::Failed, Utc::now(), "{}").await.unwrap();
        let accounts = Arc::new(StaticAccounts(vec![account("a1")]));
        let scheduler = SyncScheduler::new(queues, db, accounts, fast_options(1));
        assert_eq!(scheduler.schedule_daily_sync_for_all_accounts().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_fan_out_bounded_and_accounted() {
        let queues = queues();
        let log = Arc::new(CountingLog {
            inner: SchedulerDb::open_in_memory().unwrap(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let list: Vec<SocialAccount> = (0..18).map(|i| account(&format!("acct-{i}"))).collect();
        let accounts = Arc::new(StaticAccounts(list));
        let scheduler = SyncScheduler::new(queues.clone(), log.clone(), accounts, fast_options(4));

        let summary = scheduler.schedule_incremental_sync_for_all_accounts().await.unwrap();
        assert_eq!(summary.total(), 18);
        assert_eq!(summary.scheduled, 18);
        assert!(log.peak.load(Ordering::SeqCst) <= 4);
        assert!(log.peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(queues.get_queue_metrics(METRICS_SYNC).await.unwrap().waiting, 18);
    }

    #[tokio::test]
    async fn test_backend_down_counts_errors() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let manager = QueueManager::new();
        manager.initialize(backend.clone());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let accounts = Arc::new(StaticAccounts(vec![account("a1"), account("a2")]));
        let scheduler = SyncScheduler::new(Arc::new(manager), db.clone(), accounts, fast_options(2));

        backend.set_offline(true);
        let summary = scheduler.schedule_daily_sync_for_all_accounts().await.unwrap();
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.error_messages.len(), 2);

        let failed = db.query("sync:daily_sync:", Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
        assert!(failed.iter().all(|e| e.status == TaskLogStatus::Failed));
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_initial_sync_options() {
        let queues = queues();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let scheduler = SyncScheduler::new(
            queues.clone(),
            db,
            Arc::new(StaticAccounts(Vec::new())),
            fast_options(1),
        );

        let handle = scheduler
            .schedule_initial_sync(&account("new"), InitialSyncOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.queue, INITIAL_SYNC);
        let job = queues.get_job_details(INITIAL_SYNC, &handle.id).await.unwrap().unwrap();
        assert_eq!(job.opts.priority, 1);
        assert_eq!(job.opts.delay_ms, 5_000);
        assert_eq!(job.opts.backoff, Backoff::exponential(Duration::from_secs(10)));
        assert_eq!(job.payload["lookback_days"], 30);

        let again = scheduler
            .schedule_initial_sync(&account("new"), InitialSyncOptions::default())
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_lanes() {
        let queues = queues();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let accounts = Arc::new(StaticAccounts((0..4).map(|i| account(&format!("a{i}"))).collect()));
        let options = SyncSchedulerOptions {
            max_concurrent_syncs: 2,
            delay_between_accounts: Duration::from_secs(2),
            ..Default::default()
        };
        let scheduler = SyncScheduler::new(queues, db, accounts, options);

        let start = tokio::time::Instant::now();
        let summary = scheduler.schedule_daily_sync_for_all_accounts().await.unwrap();
        assert_eq!(summary.scheduled, 4);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_kind_from_log_name() {
        assert_eq!(SyncKind::from_log_name("sync:daily_sync:a1"), Some(SyncKind::Daily));
        assert_eq!(SyncKind::from_log_name("sync:initial_sync:x"), Some(SyncKind::Initial));
        assert_eq!(SyncKind::from_log_name("cleanup:daily_sync:x"), None);
    }
}
