//! Live trading entry point
//!
//! Validates configuration and credentials, then hands the injected venue
//! adapter to the engine. The REST adapter itself ships separately; this
//! binary refuses to start without one rather than guessing at a venue.

use clap::Parser;
use dipper_bins::common::{init_logging, load_config, CommonArgs, EXIT_STARTUP};

fn main() {
    let args = CommonArgs::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("startup error: {e}");
        std::process::exit(EXIT_STARTUP);
    }

    tracing::info!("=== dipper: live trading ===");
    tracing::warn!("LIVE TRADING MODE - REAL FUNDS AT RISK");

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup error: {e:#}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    let api_key = std::env::var("DIPPER_API_KEY").ok();
    let api_secret = std::env::var("DIPPER_API_SECRET").ok();
    if api_key.as_deref().unwrap_or("").is_empty()
        || api_secret.as_deref().unwrap_or("").is_empty()
    {
        eprintln!("startup error: DIPPER_API_KEY / DIPPER_API_SECRET not set");
        std::process::exit(EXIT_STARTUP);
    }

    tracing::info!(
        watchlist = config.engine.watchlist.len(),
        max_positions = config.engine.max_positions,
        "configuration validated"
    );

    // The venue REST adapter is injected by the deployment build; wire it
    // here the same way dipper-paper wires the mock venue.
    tracing::error!("no venue adapter linked into this build");
    tracing::info!("use dipper-paper for a full engine run against the mock venue");
    std::process::exit(EXIT_STARTUP);
}
