//! Paper trading against the scriptable in-memory exchange
//!
//! Seeds the mock venue with markets and starting tickers for the
//! watchlist, then runs the full engine loop against it. No real funds, no
//! network; useful for exercising the signal pipeline, guards, and exit
//! ladder end to end.

use anyhow::Result;
use clap::Parser;
use dipper_bins::common::{
    engine_finished, init_logging, load_config, supervise, CommonArgs, EXIT_STARTUP,
};
use dipper_core::core::types::{MarketInfo, Symbol};
use dipper_core::engine::market_data_config;
use dipper_core::exchange::{FillMode, MockExchange, RetryConfig, RetryingClient, TracedClient};
use dipper_core::market::MarketDataProvider;
use dipper_core::persist::SessionDirs;
use dipper_core::runtime::{watch_flag, EventBus, ShutdownCoordinator};
use dipper_core::Engine;
use dipper_signals::guards::GuardStack;
use dipper_signals::pipeline::{DropPipeline, DropPipelineConfig};
use rust_decimal_macros::dec;
use std::sync::Arc;

fn main() {
    let args = CommonArgs::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("startup error: {e}");
        std::process::exit(EXIT_STARTUP);
    }

    tracing::info!("=== dipper: paper trading (mock venue) ===");
    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Startup failures print one line and exit non-zero
            eprintln!("startup error: {e:#}");
            std::process::exit(EXIT_STARTUP);
        }
    }
}

fn run(args: CommonArgs) -> Result<i32> {
    let config = load_config(&args)?;
    let session = SessionDirs::new(&args.session_dir);
    let coordinator = ShutdownCoordinator::default();
    let bus = Arc::new(EventBus::new());

    // Seed the venue with permissive markets and flat starting tickers
    let mock = MockExchange::new();
    mock.set_fill_mode(FillMode::Instant);
    mock.set_free_balance(&config.engine.quote_asset, dec!(10000));
    let mut universe: Vec<String> = config.engine.watchlist.clone();
    if !universe.contains(&config.engine.btc_symbol) {
        universe.push(config.engine.btc_symbol.clone());
    }
    for name in &universe {
        let symbol = Symbol::new(name.clone());
        mock.set_market(
            &symbol,
            MarketInfo {
                price_tick: dec!(0.01),
                quantity_step: dec!(0.0001),
                min_quantity: dec!(0.0001),
                min_notional: dec!(10),
            },
        );
        mock.set_ticker_prices(&symbol, dec!(100), dec!(99.95), dec!(100.05));
    }

    let client = Arc::new(
        RetryingClient::new(TracedClient::new(mock), RetryConfig::default())
            .with_shutdown_flag(watch_flag(&coordinator)),
    );
    let provider = Arc::new(MarketDataProvider::new(
        client.clone(),
        bus.clone(),
        market_data_config(&config),
    ));

    let signal = DropPipeline::new(DropPipelineConfig::from_config(&config, &session)?);
    let guards = GuardStack::new(config.guards.clone(), provider.clone());

    let mut engine = Engine::new(
        config,
        session,
        client,
        provider,
        signal,
        guards,
        coordinator.clone(),
        bus,
    )?;

    let engine_coordinator = coordinator.clone();
    let engine_thread = std::thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || {
            let result = engine.run().map(|_| engine.stats());
            engine_finished(&engine_coordinator, "engine loop returned");
            result
        })?;

    Ok(supervise(coordinator, engine_thread))
}
