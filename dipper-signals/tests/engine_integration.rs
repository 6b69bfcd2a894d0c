//! Full-stack round trip: drop trigger -> guarded buy -> protection exit.
//!
//! Runs the real engine loop on its own thread against the mock venue with
//! the production signal pipeline and guard stack, then inspects persisted
//! state and the structured event log.

use dipper_core::config::Config;
use dipper_core::core::types::{MarketInfo, Symbol};
use dipper_core::engine::market_data_config;
use dipper_core::exchange::{FillMode, MockExchange};
use dipper_core::market::MarketDataProvider;
use dipper_core::persist::SessionDirs;
use dipper_core::runtime::{EventBus, ShutdownCoordinator, ShutdownRequest};
use dipper_core::Engine;
use dipper_signals::guards::GuardStack;
use dipper_signals::pipeline::{DropPipeline, DropPipelineConfig};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.engine.watchlist = vec!["ETH/USDT".to_string()];
    config.engine.cycle_quantum_ms = 50;
    config.engine.md_update_interval_s = 1;
    config.engine.exit_processing_interval_s = 1;
    config.engine.position_check_interval_s = 1;
    config.sizing.position_size_usdt = dec!(100);
    config.market_data.ticker_ttl_s = 1;
    config.market_data.backfill_minutes = 5;
    config
}

fn seeded_mock() -> Arc<MockExchange> {
    let mock = Arc::new(MockExchange::new());
    for name in ["ETH/USDT", "BTC/USDT"] {
        let symbol = Symbol::from(name);
        mock.set_market(
            &symbol,
            MarketInfo {
                price_tick: dec!(0.01),
                quantity_step: dec!(0.001),
                min_quantity: dec!(0.001),
                min_notional: dec!(10),
            },
        );
    }
    mock.set_ticker_prices(&Symbol::from("ETH/USDT"), dec!(100), dec!(99.95), dec!(100.05));
    mock.set_ticker_prices(
        &Symbol::from("BTC/USDT"),
        dec!(50000),
        dec!(49990),
        dec!(50010),
    );
    mock.set_free_balance("USDT", dec!(10000));
    mock.set_fill_mode(FillMode::Instant);
    mock
}

#[test]
fn drop_buy_and_protection_exit_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let session = SessionDirs::new(dir.path().join("session"));
    let config = fast_config();
    let mock = seeded_mock();
    let coordinator = ShutdownCoordinator::default();
    let bus = Arc::new(EventBus::new());

    let provider = Arc::new(MarketDataProvider::new(
        mock.clone(),
        bus.clone(),
        market_data_config(&config),
    ));
    let signal = DropPipeline::new(DropPipelineConfig::from_config(&config, &session).unwrap());
    let guards = GuardStack::new(config.guards.clone(), provider.clone());

    let mut engine = Engine::new(
        config,
        session.clone(),
        mock.clone(),
        provider,
        signal,
        guards,
        coordinator.clone(),
        bus,
    )
    .unwrap();
    let pnl = engine.pnl();

    let engine_thread = std::thread::spawn(move || {
        engine.run().unwrap();
        engine.stats()
    });

    // Let the engine anchor on the flat market
    std::thread::sleep(Duration::from_millis(2500));

    // 3% drop: clears threshold (200bp) + hysteresis (20bp)
    mock.set_ticker_prices(&Symbol::from("ETH/USDT"), dec!(97), dec!(96.95), dec!(97.05));

    // Buy fills instantly; the protection take-profit order placed on the
    // next position check also fills instantly on the mock venue
    std::thread::sleep(Duration::from_millis(4500));

    coordinator.request_shutdown(ShutdownRequest::graceful("test complete", "test"));
    let stats = engine_thread.join().unwrap();

    assert!(stats.buy_orders >= 1, "expected at least one buy");
    assert!(stats.exit_fills >= 1, "expected the protection exit to fill");
    assert!(
        pnl.realized_net() > Decimal::ZERO,
        "take-profit exit should realize a gain, got {}",
        pnl.realized_net()
    );

    // The round trip is visible in persisted state
    let ledger = std::fs::read_to_string(session.pnl_ledger_file()).unwrap();
    assert!(ledger.lines().count() >= 2);

    let events = std::fs::read_to_string(session.events_file()).unwrap();
    let mut saw_decision = false;
    let mut saw_exit = false;
    for line in events.lines() {
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        match record["event_type"].as_str() {
            Some("DECISION_START") => saw_decision = true,
            Some("EXIT_FILLED") => saw_exit = true,
            _ => {}
        }
    }
    assert!(saw_decision, "decision events missing");
    assert!(saw_exit, "exit fill event missing");

    // Position book persisted empty after the exit closed it
    let positions = std::fs::read_to_string(session.positions_file()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&positions).unwrap();
    assert_eq!(value["positions"].as_object().map(|m| m.len()), Some(0));
}
