//! Redis queue backend.
//!
//! Key layout per queue (`{prefix}:{queue}:...`):
//!
//! ```text
//! id          STRING  job id counter (INCR)
//! job:{id}    STRING  job JSON
//! wait        ZSET    score = priority * 1e13 + created_ms (lowest first)
//! delayed     ZSET    score = ready_at_ms
//! active      ZSET    score = processed_ms
//! completed   ZSET    score = finished_ms
//! failed      ZSET    score = finished_ms
//! meta        HASH    paused = 0|1, concurrency = N
//! ```
//!
//! Worker processes own the move from `wait`/`delayed` to `active` and on to a
//! terminal set; they poll `meta.concurrency` to resize their pools.

use async_trait::async_trait;
use chrono::Utc;
use postflow_core::{PostflowError, Result};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backend::{ClusterInfo, ClusterNode, PerformanceCounters, QueueBackend, QueueCounts};
use crate::job::{Job, JobOptions, JobState};

const PRIORITY_SPAN: f64 = 1e13;
const MAX_SCORED_PRIORITY: u32 = 500;

fn redis_err(e: redis::RedisError) -> PostflowError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() || e.is_timeout() {
        PostflowError::Unavailable(format!("redis: {e}"))
    } else {
        PostflowError::Database(format!("redis: {e}"))
    }
}

/// `host:port[/db]` of a redis URL, without scheme, credentials or query.
pub fn redacted_address(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.trim_end_matches('/').to_string()
}

/// Job store backed by a Redis server or cluster entry point.
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    prefix: String,
    address: String,
}

impl RedisQueueBackend {
    /// Connect and verify the connection with a PING.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let address = redacted_address(url);
        let client = redis::Client::open(url)
            .map_err(|e| PostflowError::Config(format!("invalid redis url for {address}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| PostflowError::Unavailable(format!("redis connect to {address} failed: {e}")))?;
        let backend = Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
            address,
        };
        backend.ping().await?;
        tracing::info!("🔌 Redis queue backend connected ({})", backend.address);
        Ok(backend)
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_key(&self, queue: &str, id: &str) -> String {
        self.key(queue, &format!("job:{id}"))
    }

    fn state_key(&self, queue: &str, state: JobState) -> String {
        let suffix = match state {
            JobState::Waiting | JobState::Paused => "wait",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        self.key(queue, suffix)
    }
}

/// Score that orders the wait set by priority, then age.
pub fn wait_score(priority: u32, created_ms: i64) -> f64 {
    let p = priority.clamp(1, MAX_SCORED_PRIORITY) as f64;
    p * PRIORITY_SPAN + created_ms.max(0) as f64
}

/// Parse `INFO` output into a key/value map. Section headers are skipped.
pub fn parse_info(info: &str) -> HashMap<String, String> {
    info.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Build performance counters from `INFO` fields and `DBSIZE`.
pub fn counters_from_info(info: &HashMap<String, String>, key_count: u64) -> PerformanceCounters {
    let num = |k: &str| info.get(k).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let hits = num("keyspace_hits");
    let misses = num("keyspace_misses");
    let hit_rate = if hits + misses == 0 {
        1.0
    } else {
        hits as f64 / (hits + misses) as f64
    };
    PerformanceCounters {
        used_memory_bytes: num("used_memory"),
        peak_memory_bytes: num("used_memory_peak"),
        key_count,
        hit_rate,
    }
}

/// Parse `CLUSTER NODES` output.
///
/// Line format: `<id> <ip:port@cport> <flags> <master> <ping> <pong> <epoch> <link-state> <slots...>`
pub fn parse_cluster_nodes(raw: &str) -> Vec<ClusterNode> {
    raw.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return None;
            }
            let flags: Vec<&str> = parts[2].split(',').collect();
            let role = if flags.contains(&"master") {
                "master"
            } else if flags.contains(&"slave") || flags.contains(&"replica") {
                "replica"
            } else {
                "unknown"
            };
            let failing = flags.iter().any(|f| *f == "fail" || *f == "fail?" || *f == "noaddr");
            Some(ClusterNode {
                id: parts[0].to_string(),
                address: parts[1].split('@').next().unwrap_or(parts[1]).to_string(),
                role: role.to_string(),
                healthy: !failing && parts[7] == "connected",
            })
        })
        .collect()
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let mut conn = self.conn.clone();
        let id: u64 = redis::cmd("INCR")
            .arg(self.key(queue, "id"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let job = Job::new(id.to_string(), queue, job_type, payload, opts, Utc::now());
        let json = serde_json::to_string(&job)?;

        let (set_key, score) = if job.state == JobState::Delayed {
            (self.key(queue, "delayed"), job.ready_at.timestamp_millis() as f64)
        } else {
            (
                self.key(queue, "wait"),
                wait_score(job.opts.priority, job.created_at.timestamp_millis()),
            )
        };

        redis::pipe()
            .atomic()
            .cmd("SET").arg(self.job_key(queue, &job.id)).arg(json).ignore()
            .cmd("ZADD").arg(set_key).arg(score).arg(&job.id).ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)?;

        tracing::debug!("📥 Redis[{}] enqueue {} ({})", queue, job.id, job.job_type);
        Ok(job)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed, meta): (
            u64,
            u64,
            u64,
            u64,
            u64,
            HashMap<String, String>,
        ) = redis::pipe()
            .cmd("ZCARD").arg(self.key(queue, "wait"))
            .cmd("ZCARD").arg(self.key(queue, "active"))
            .cmd("ZCARD").arg(self.key(queue, "completed"))
            .cmd("ZCARD").arg(self.key(queue, "failed"))
            .cmd("ZCARD").arg(self.key(queue, "delayed"))
            .cmd("HGETALL").arg(self.key(queue, "meta"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let paused = meta.get("paused").is_some_and(|v| v == "1");
        let workers = meta
            .get("concurrency")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        Ok(QueueCounts {
            waiting: if paused { 0 } else { waiting },
            active,
            completed,
            failed,
            delayed,
            paused: if paused { waiting } else { 0 },
            workers,
        })
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.key(queue, "meta"))
            .arg("paused")
            .arg("1")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.key(queue, "meta"))
            .arg("paused")
            .arg("0")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn clean(&self, queue: &str, state: JobState, max_age: Duration) -> Result<u64> {
        if !state.is_terminal() {
            return Err(PostflowError::Validation(format!(
                "only completed or failed jobs can be cleaned, got '{state}'"
            )));
        }
        let mut conn = self.conn.clone();
        let set_key = self.state_key(queue, state);
        let cutoff = (Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64))
            .timestamp_millis();

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&set_key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.cmd("DEL").arg(self.job_key(queue, id)).ignore();
        }
        pipe.cmd("ZREM").arg(&set_key).arg(&ids).ignore();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(redis_err)?;

        Ok(ids.len() as u64)
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(queue, id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_concurrency(&self, queue: &str, workers: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.key(queue, "meta"))
            .arg("concurrency")
            .arg(workers)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(true)
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if pong != "PONG" {
            return Err(PostflowError::Unavailable(format!("unexpected PING reply: {pong}")));
        }
        Ok(started.elapsed())
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        let mut conn = self.conn.clone();
        let nodes: redis::RedisResult<String> =
            redis::cmd("CLUSTER").arg("NODES").query_async(&mut conn).await;
        match nodes {
            Ok(raw) => Ok(ClusterInfo {
                enabled: true,
                nodes: parse_cluster_nodes(&raw),
            }),
            // Standalone servers reject CLUSTER commands
            Err(e) if e.to_string().to_lowercase().contains("cluster support disabled") => {
                let info: String = redis::cmd("INFO")
                    .arg("replication")
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                let fields = parse_info(&info);
                Ok(ClusterInfo {
                    enabled: false,
                    nodes: vec![ClusterNode {
                        id: "standalone".into(),
                        address: self.address.clone(),
                        role: fields.get("role").cloned().unwrap_or_else(|| "master".into()),
                        healthy: true,
                    }],
                })
            }
            Err(e) => Err(redis_err(e)),
        }
    }

    async fn performance(&self) -> Result<PerformanceCounters> {
        let mut conn = self.conn.clone();
        let (info, key_count): (String, u64) = redis::pipe()
            .cmd("INFO")
            .cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(counters_from_info(&parse_info(&info), key_count))
    }
}
