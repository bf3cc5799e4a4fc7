//! Health probes: publishing platforms over HTTP and the local host via /proc.

use async_trait::async_trait;
use postflow_core::config::PlatformProbeConfig;
use postflow_core::{PostflowError, Result};
use std::time::{Duration, Instant};

use crate::metrics::{HostMetrics, PlatformStatus};

/// Operational check for one publishing platform.
#[async_trait]
pub trait PlatformProbe: Send + Sync {
    fn platform(&self) -> &str;

    /// Round-trip latency when the platform is operational.
    async fn check(&self) -> Result<Duration>;
}

/// Run a probe and turn its outcome into a status row.
pub async fn probe_platform(probe: &dyn PlatformProbe) -> PlatformStatus {
    match probe.check().await {
        Ok(latency) => PlatformStatus {
            platform: probe.platform().to_string(),
            operational: true,
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
            error: None,
        },
        Err(e) => {
            tracing::warn!("⚠️ Platform probe {} failed: {}", probe.platform(), e);
            PlatformStatus {
                platform: probe.platform().to_string(),
                operational: false,
                latency_ms: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// GET a status URL; any 2xx within the timeout counts as operational.
pub struct HttpPlatformProbe {
    platform: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPlatformProbe {
    pub fn new(platform: &str, url: &str, timeout: Duration) -> Self {
        Self {
            platform: platform.to_string(),
            url: url.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &PlatformProbeConfig) -> Self {
        Self::new(&config.platform, &config.url, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl PlatformProbe for HttpPlatformProbe {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn check(&self) -> Result<Duration> {
        let start = Instant::now();
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PostflowError::ProbeFailure(format!("{}: {e}", self.platform)))?;
        if resp.status().is_success() {
            Ok(start.elapsed())
        } else {
            Err(PostflowError::ProbeFailure(format!(
                "{}: status endpoint returned {}",
                self.platform,
                resp.status()
            )))
        }
    }
}

/// Source of host and process metrics.
pub trait HostProbe: Send + Sync {
    fn collect(&self) -> HostMetrics;
}

/// Reads `/proc` on Linux. Missing files leave the matching fields at zero
/// and record an error string.
pub struct ProcHostProbe {
    process_memory_limit_bytes: Option<u64>,
}

impl ProcHostProbe {
    pub fn new(process_memory_limit_mb: Option<u64>) -> Self {
        Self {
            process_memory_limit_bytes: process_memory_limit_mb.map(|mb| mb * 1024 * 1024),
        }
    }
}

impl HostProbe for ProcHostProbe {
    fn collect(&self) -> HostMetrics {
        let mut errors = Vec::new();
        let mut read = |path: &str| match std::fs::read_to_string(path) {
            Ok(s) => Some(s),
            Err(e) => {
                errors.push(format!("{path}: {e}"));
                None
            }
        };

        let (total, available) = read("/proc/meminfo")
            .map(|s| parse_meminfo(&s))
            .unwrap_or_default();
        let load_average = read("/proc/loadavg")
            .and_then(|s| parse_loadavg(&s))
            .unwrap_or_default();
        let rss = read("/proc/self/status")
            .and_then(|s| parse_vm_rss(&s))
            .unwrap_or_default();
        let uptime = read("/proc/uptime")
            .and_then(|s| parse_uptime(&s))
            .unwrap_or_default();

        HostMetrics {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".into()),
            total_memory_bytes: total,
            free_memory_bytes: available,
            load_average,
            cpu_cores: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            process_rss_bytes: rss,
            process_memory_limit_bytes: self.process_memory_limit_bytes.unwrap_or(total),
            uptime_secs: uptime,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}

fn kb_field(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok().map(|kb| kb * 1024)
}

/// `(MemTotal, MemAvailable)` in bytes. Falls back to MemFree on old kernels.
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = None;
    let mut free = 0;
    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = kb_field(line).unwrap_or(0);
        } else if line.starts_with("MemAvailable:") {
            available = kb_field(line);
        } else if line.starts_with("MemFree:") {
            free = kb_field(line).unwrap_or(0);
        }
    }
    (total, available.unwrap_or(free))
}

pub fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut parts = content.split_whitespace().map(|p| p.parse::<f64>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}

pub fn parse_vm_rss(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(kb_field)
}

pub fn parse_uptime(content: &str) -> Option<u64> {
    content
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|s| s as u64)
}
