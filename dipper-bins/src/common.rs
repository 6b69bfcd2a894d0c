//! CLI arguments, logging bootstrap, and engine wiring shared by the
//! binaries.

use anyhow::{Context, Result};
use clap::Parser;
use dipper_core::engine::EngineStats;
use dipper_core::runtime::{ShutdownCoordinator, ShutdownRequest};
use dipper_core::Config;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Process exit codes: 0 normal, 1 startup error, 2 runtime fatal.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;

#[derive(Parser, Debug)]
#[command(about = "dipper - drop-trigger spot trading bot")]
pub struct CommonArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DIPPER_LOG_LEVEL")]
    pub log_level: String,

    /// Session directory for state files and logs
    #[arg(long, default_value = "./session", env = "DIPPER_SESSION_DIR")]
    pub session_dir: PathBuf,

    /// Optional JSON configuration overlay
    #[arg(long, env = "DIPPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated watchlist override
    #[arg(long)]
    pub watchlist: Option<String>,
}

pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;
    Ok(())
}

/// Load config (overlay + env), apply the CLI watchlist override.
pub fn load_config(args: &CommonArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(list) = &args.watchlist {
        config.engine.watchlist = list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.engine.watchlist.is_empty() {
        anyhow::bail!("watchlist is empty: set --watchlist or TOPCOINS");
    }
    Ok(config)
}

/// Install signals, spawn the heartbeat monitor, and block until shutdown
/// completes. Returns the exit code.
pub fn supervise(
    coordinator: ShutdownCoordinator,
    engine_thread: std::thread::JoinHandle<Result<EngineStats>>,
) -> i32 {
    coordinator.install_signal_handlers();
    let monitor = coordinator.spawn_heartbeat_monitor(
        Duration::from_secs(30),
        Duration::from_secs(300),
        false,
    );
    coordinator.register_thread("heartbeat-monitor", monitor);

    coordinator.wait_for_shutdown(None);
    coordinator.execute_graceful_shutdown();

    match engine_thread.join() {
        Ok(Ok(stats)) => {
            tracing::info!(
                cycles = stats.cycles,
                buys = stats.buy_orders,
                exits = stats.exit_fills,
                "engine finished"
            );
            EXIT_OK
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "engine failed");
            EXIT_RUNTIME
        }
        Err(_) => {
            tracing::error!("engine thread panicked");
            EXIT_RUNTIME
        }
    }
}

/// File a shutdown request when the engine thread returns on its own.
pub fn engine_finished(coordinator: &ShutdownCoordinator, reason: &str) {
    coordinator.request_shutdown(ShutdownRequest::graceful(reason, "engine-thread"));
}
