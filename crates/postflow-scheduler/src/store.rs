//! SQLite-backed scheduler database: task log, social accounts, alert history.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use postflow_core::{PostflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Status of a task log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLogStatus::Pending => "pending",
            TaskLogStatus::Processing => "processing",
            TaskLogStatus::Completed => "completed",
            TaskLogStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => TaskLogStatus::Processing,
            "completed" => TaskLogStatus::Completed,
            "failed" => TaskLogStatus::Failed,
            _ => TaskLogStatus::Pending,
        }
    }

    /// Statuses that count as a prior attempt for duplicate suppression.
    pub fn blocks_duplicates(&self) -> bool {
        !matches!(self, TaskLogStatus::Failed)
    }
}

/// One task log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub name: String,
    pub status: TaskLogStatus,
    pub executed_at: DateTime<Utc>,
    pub message: String,
}

/// A social account whose metrics get synchronized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub team_id: String,
    pub platform: String,
    /// `None` means the credential does not expire.
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl SocialAccount {
    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_none_or(|t| t > now)
    }
}

/// Share of accounts whose credentials are currently valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub total: u64,
    pub valid: u64,
}

impl TokenSummary {
    /// Valid / total, 1.0 when there are no accounts.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.valid as f64 / self.total as f64
        }
    }
}

/// Append-only log of dispatched and executed tasks.
#[async_trait]
pub trait TaskLog: Send + Sync {
    async fn append(
        &self,
        name: &str,
        status: TaskLogStatus,
        executed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<i64>;

    /// Entries whose name starts with `name_prefix`, executed at or after `since`.
    async fn query(&self, name_prefix: &str, since: DateTime<Utc>) -> Result<Vec<TaskLogEntry>>;
}

/// Source of accounts to synchronize.
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Accounts whose credentials are not expired at `now`.
    async fn active_accounts(&self, now: DateTime<Utc>) -> Result<Vec<SocialAccount>>;

    async fn token_summary(&self, now: DateTime<Utc>) -> Result<TokenSummary>;
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> PostflowError + '_ {
    move |e| PostflowError::Database(format!("{context}: {e}"))
}

/// SQLite persistence for everything the scheduler and monitor record.
pub struct SchedulerDb {
    conn: Mutex<rusqlite::Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and `--memory-backend` runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| PostflowError::Database("connection lock poisoned".into()))?;
        f(&*conn)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            -- Dispatched / executed background tasks
            CREATE TABLE IF NOT EXISTS task_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,              -- e.g. sync:daily_sync:<account>
                status TEXT NOT NULL,            -- pending, processing, completed, failed
                executed_at TEXT NOT NULL,       -- RFC 3339 UTC, millisecond precision
                message TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_task_log_name_time ON task_log(name, executed_at);

            -- Connected social accounts
            CREATE TABLE IF NOT EXISTS social_accounts (
                id TEXT PRIMARY KEY,
                team_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                token_expires_at TEXT            -- NULL = never expires
            );

            -- Fired alerts
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                health_score INTEGER NOT NULL,
                fired_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))
        })
    }

    // ─── Task log ──────────────────────────────────────

    fn append_entry(
        &self,
        name: &str,
        status: TaskLogStatus,
        executed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_log (name, status, executed_at, message) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![name, status.as_str(), ts(executed_at), message],
            )
            .map_err(db_err("Append task"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn query_entries(&self, name_prefix: &str, since: DateTime<Utc>) -> Result<Vec<TaskLogEntry>> {
        // LIKE treats % and _ as wildcards, so match the prefix with substr instead
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, status, executed_at, message FROM task_log
                     WHERE substr(name, 1, length(?1)) = ?1 AND executed_at >= ?2
                     ORDER BY executed_at",
                )
                .map_err(db_err("Query tasks"))?;
            let rows = stmt
                .query_map(rusqlite::params![name_prefix, ts(since)], |row| {
                    let status: String = row.get(2)?;
                    let executed_at: String = row.get(3)?;
                    Ok(TaskLogEntry {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: TaskLogStatus::parse(&status),
                        executed_at: parse_ts(&executed_at),
                        message: row.get(4)?,
                    })
                })
                .map_err(db_err("Query tasks"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("Read task row"))
        })
    }

    // ─── Accounts ──────────────────────────────────────

    pub fn upsert_account(&self, account: &SocialAccount) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO social_accounts (id, team_id, platform, token_expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    account.id,
                    account.team_id,
                    account.platform,
                    account.token_expires_at.map(ts),
                ],
            )
            .map_err(db_err("Save account"))?;
            Ok(())
        })
    }

    pub fn remove_account(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn
                .execute("DELETE FROM social_accounts WHERE id = ?1", [id])
                .map_err(db_err("Delete account"))?;
            Ok(n > 0)
        })
    }

    pub fn list_accounts(&self) -> Result<Vec<SocialAccount>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, team_id, platform, token_expires_at FROM social_accounts ORDER BY id")
                .map_err(db_err("List accounts"))?;
            let rows = stmt
                .query_map([], |row| {
                    let expires: Option<String> = row.get(3)?;
                    Ok(SocialAccount {
                        id: row.get(0)?,
                        team_id: row.get(1)?,
                        platform: row.get(2)?,
                        token_expires_at: expires.as_deref().map(parse_ts),
                    })
                })
                .map_err(db_err("List accounts"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("Read account row"))
        })
    }

    // ─── Alerts ──────────────────────────────────────

    pub fn save_alert(
        &self,
        rule_id: &str,
        rule_name: &str,
        severity: &str,
        message: &str,
        health_score: u8,
        fired_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alerts (rule_id, rule_name, severity, message, health_score, fired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![rule_id, rule_name, severity, message, health_score, ts(fired_at)],
            )
            .map_err(db_err("Save alert"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, rule_id, rule_name, severity, message, health_score, fired_at
                     FROM alerts ORDER BY id DESC LIMIT ?1",
                )
                .map_err(db_err("Recent alerts"))?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok(serde_json::json!({
                        "id": row.get::<_, i64>(0)?,
                        "rule_id": row.get::<_, String>(1)?,
                        "rule_name": row.get::<_, String>(2)?,
                        "severity": row.get::<_, String>(3)?,
                        "message": row.get::<_, String>(4)?,
                        "health_score": row.get::<_, i64>(5)?,
                        "fired_at": row.get::<_, String>(6)?,
                    }))
                })
                .map_err(db_err("Recent alerts"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("Read alert row"))
        })
    }
}

#[async_trait]
impl TaskLog for SchedulerDb {
    async fn append(
        &self,
        name: &str,
        status: TaskLogStatus,
        executed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<i64> {
        self.append_entry(name, status, executed_at, message)
    }

    async fn query(&self, name_prefix: &str, since: DateTime<Utc>) -> Result<Vec<TaskLogEntry>> {
        self.query_entries(name_prefix, since)
    }
}

#[async_trait]
impl AccountSource for SchedulerDb {
    async fn active_accounts(&self, now: DateTime<Utc>) -> Result<Vec<SocialAccount>> {
        Ok(self
            .list_accounts()?
            .into_iter()
            .filter(|a| a.has_valid_token(now))
            .collect())
    }

    async fn token_summary(&self, now: DateTime<Utc>) -> Result<TokenSummary> {
        let accounts = self.list_accounts()?;
        Ok(TokenSummary {
            total: accounts.len() as u64,
            valid: accounts.iter().filter(|a| a.has_valid_token(now)).count() as u64,
        })
    }
}
