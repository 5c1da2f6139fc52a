//! idsync daemon entry point.
//!
//! Loads configuration, builds the reconciler, runs it on the configured
//! interval, and shuts down cleanly on SIGINT/SIGTERM.

mod scheduler;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use idsync_core::config::{AppConfig, LoggingConfig};
use idsync_core::reconcile::{Reconciler, RunOptions};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// idsync reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "idsync-daemon",
    version,
    about = "Scheduled identity provider to LDAP reconciliation daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Compute and log changes without applying them.
    #[arg(long)]
    dry_run: bool,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install stdout logging plus a daily-rolling file when `logging.file` is
/// set. The returned guard must live as long as the process.
fn init_logging(logging: &LoggingConfig, level: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match logging.file.as_deref().and_then(split_log_path) {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    guard
}

fn split_log_path(path: &Path) -> Option<(PathBuf, String)> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, name))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = init_logging(&config.logging, &log_level);

    // Startup banner
    info!("========================================");
    info!("  idsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Tenant URL    : {}", config.source.tenant_url);
    info!("Directory URL : {}", config.directory.url);
    info!("Interval      : {}s", config.sync.interval_secs);
    info!("Database      : {}", config.database.path.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    if let Err(e) = config.ensure_enabled() {
        warn!("Synchronization is disabled in configuration");
        return Err(e.into());
    }
    if let Err(e) = config.require_secrets() {
        warn!(error = %e, "secret missing; runs will fail until it is set");
    }

    let interval = Duration::from_secs(config.sync.interval_secs);
    let options = RunOptions {
        dry_run: args.dry_run || config.sync.dry_run,
        ..RunOptions::from_config(&config.sync)
    };

    let reconciler =
        Arc::new(Reconciler::from_config(config).context("failed to set up reconciler")?);
    info!("Reconciler initialized");

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();

    let mut sched = scheduler::Scheduler::new(reconciler, interval, options);
    let stats = sched.stats();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // notify_one stores a permit, so the scheduler sees it even if it is
    // not parked on the notification at this instant.
    shutdown.notify_one();

    match tokio::time::timeout(Duration::from_secs(60), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 60s, forcing shutdown"),
    }

    info!(
        runs = stats.total_runs.load(std::sync::atomic::Ordering::SeqCst),
        failed = stats.failed_runs.load(std::sync::atomic::Ordering::SeqCst),
        "idsync daemon stopped"
    );
    Ok(())
}
