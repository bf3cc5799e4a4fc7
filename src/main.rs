//! # Postflow: job scheduling and self-regulation daemon
//!
//! Usage:
//!   postflow                          # Config from ~/.postflow/config.toml
//!   postflow --config ./postflow.toml # Explicit config
//!   postflow --memory-backend         # In-process queues, no Redis (development)

use anyhow::{Context, Result};
use clap::Parser;
use postflow_core::PostflowConfig;
use postflow_gateway::AppState;
use postflow_monitor::SystemMonitor;
use postflow_queue::{MemoryQueueBackend, QueueBackend, QueueManager, RedisQueueBackend, redacted_address};
use postflow_scheduler::{AutoScaler, SchedulerDb, SyncScheduler, SyncSchedulerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "postflow",
    version,
    about = "📬 Postflow: background job scheduling, worker auto-scaling and health monitoring"
)]
struct Cli {
    /// Config file (default: ~/.postflow/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Admin API port (overrides gateway.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use the in-process queue backend and an in-memory database
    #[arg(long)]
    memory_backend: bool,

    /// Do not start the auto-scaler loop
    #[arg(long)]
    no_autoscaling: bool,

    /// Do not start the system monitor loop
    #[arg(long)]
    no_monitoring: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "postflow=debug,tower_http=debug"
    } else {
        "postflow=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<PostflowConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).to_string());
            PostflowConfig::load_from(&path)
                .with_context(|| format!("loading config from {}", path.display()))?
        }
        None => PostflowConfig::load().context("loading default config")?,
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    Ok(config)
}

async fn connect_backend(cli: &Cli, config: &PostflowConfig) -> Result<Arc<dyn QueueBackend>> {
    if cli.memory_backend {
        tracing::info!("🧪 Using in-memory queue backend");
        let max_backoff = Duration::from_secs(config.scheduling.backoff_max_delay_secs);
        return Ok(Arc::new(MemoryQueueBackend::new().with_max_backoff(max_backoff)));
    }
    let address = redacted_address(&config.redis.url);
    let backend = RedisQueueBackend::connect(&config.redis.url, &config.redis.key_prefix)
        .await
        .with_context(|| format!("connecting to redis at {address}"))?;
    tracing::info!("🔌 Connected to Redis at {}", address);
    Ok(Arc::new(backend))
}

fn open_database(cli: &Cli, config: &PostflowConfig) -> Result<SchedulerDb> {
    if cli.memory_backend {
        return Ok(SchedulerDb::open_in_memory()?);
    }
    let path = config.database.expanded_path();
    let db = SchedulerDb::open(&path).with_context(|| format!("opening database {}", path.display()))?;
    tracing::info!("🗄️ Database: {}", path.display());
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    let config = load_config(&cli)?;

    tracing::info!("📬 Postflow v{}", env!("CARGO_PKG_VERSION"));

    let queues = Arc::new(QueueManager::new());
    queues.initialize(connect_backend(&cli, &config).await?);
    let db = Arc::new(open_database(&cli, &config)?);

    let scaler = Arc::new(AutoScaler::from_config(queues.clone(), &config.autoscaling)?);
    let monitor = Arc::new(
        SystemMonitor::new(queues.clone(), db.clone(), &config.monitoring).with_alert_store(db.clone()),
    );
    let sync = Arc::new(SyncScheduler::new(
        queues.clone(),
        db.clone(),
        db.clone(),
        SyncSchedulerOptions::from(&config.scheduling),
    ));

    if config.autoscaling.enabled && !cli.no_autoscaling {
        scaler.start();
    } else {
        tracing::info!("⏸️ Auto-scaling disabled");
    }
    if config.monitoring.enabled && !cli.no_monitoring {
        monitor.start();
    } else {
        tracing::info!("⏸️ Monitoring disabled");
    }

    let state = AppState::new(
        queues,
        scaler.clone(),
        monitor.clone(),
        sync,
        config.gateway.admin_key.as_deref(),
    );
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to listen for Ctrl-C: {e}");
        }
        tracing::info!("🛑 Shutting down");
    };
    let served = postflow_gateway::serve(state, &config.gateway, shutdown).await;

    scaler.shutdown().await;
    monitor.shutdown().await;
    served
}
