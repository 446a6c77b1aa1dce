use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use memtier_core::telemetry::init_tracing;
use memtier_core::{MemoryManager, MemtierConfig};
use memtier_store::{MemoryStore, SurrealMemoryStore};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};

/// Runs memtier retention policies on a fixed schedule.
#[derive(Parser)]
#[command(name = "memtierd", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "MEMTIER_CONFIG")]
    config: Option<PathBuf>,

    /// SurrealDB URL; defaults to the environment
    #[arg(long, env = "MEMTIER_DB_URL")]
    db: Option<String>,

    /// Run once and exit
    #[arg(long)]
    once: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json, Level::INFO);

    let config = MemtierConfig::load(args.config.as_deref(), None)
        .context("Failed to load memtier configuration")?;
    let period = Duration::from_secs(config.policies.schedule_minutes.saturating_mul(60));

    let store: Arc<dyn MemoryStore> = Arc::new(match args.db.as_deref() {
        Some(url) => SurrealMemoryStore::connect(url).await,
        None => SurrealMemoryStore::from_env().await,
    }
    .context("Failed to connect to memtier database")?);
    let manager = MemoryManager::new(store, config).context("Failed to build memory manager")?;

    if args.once {
        run_once(&manager).await;
        return Ok(());
    }

    info!(period_secs = period.as_secs(), "memtierd started");
    let runs = run_scheduler(&manager, period, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await;
    info!(runs, "memtierd stopped");
    Ok(())
}

async fn run_once(manager: &MemoryManager) {
    let summary = manager.run_policies(None).await;
    manager.metrics().flush();
    if !summary.failed_steps.is_empty() {
        warn!(run_id = %summary.run_id, failed = ?summary.failed_steps, "policy run had failures");
    }
}

/// Run policies immediately and then every `period` until `shutdown`
/// resolves. An in-flight run finishes before shutdown is observed.
/// Returns the number of completed runs.
async fn run_scheduler<F>(manager: &MemoryManager, period: Duration, shutdown: F) -> u64
where
    F: Future<Output = ()>,
{
    let mut shutdown = std::pin::pin!(shutdown);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut runs = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                run_once(manager).await;
                runs += 1;
            }
        }
    }
    runs
}
