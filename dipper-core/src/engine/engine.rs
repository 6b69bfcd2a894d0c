//! Trading engine orchestrator
//!
//! One dedicated thread drives the control loop: market-data refresh, exit
//! processing, position management, buy evaluation, and periodic
//! maintenance, each on its own cadence inside a fixed sleep quantum.
//! Errors inside a cycle are contained per symbol; only a shutdown request
//! terminates the loop.

use crate::config::{BudgetPolicy, Config};
use crate::core::clock::now_s;
use crate::core::cooldown::CooldownManager;
use crate::core::order_fsm::{FsmRegistry, OrderFsm};
use crate::core::types::{size_buy_from_quote, OrderType, Side, Symbol, Ticker, TimeInForce};
use crate::engine::exits::{ExitConfig, ExitFill, ExitManager, ExitRules};
use crate::engine::orders::{FillDelta, OrderGateway, PlaceError};
use crate::engine::pnl::{FillEvent, PnlService};
use crate::engine::positions::{Position, PositionBook};
use crate::engine::traits::{BuySignal, EntryGuards};
use crate::exchange::client::ExchangeClient;
use crate::market::anchor::AnchorMode;
use crate::market::{
    MarketDataConfig, MarketDataProvider, MarketSnapshot, SnapshotLiquidity, SnapshotPrice,
    SnapshotWindows,
};
use crate::persist::{atomic_write_json, load_json, Event, EventLog, SessionDirs};
use crate::runtime::event_bus::{BusEvent, EventBus, TOPIC_FILLS};
use crate::runtime::shutdown::ShutdownCoordinator;
use crate::telemetry::{IntentTracker, Metrics};
use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Counters reported by the periodic performance summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub cycles: u64,
    pub decisions: u64,
    pub buy_orders: u64,
    pub exit_fills: u64,
    pub cycle_errors: u64,
}

pub struct Engine<X, S, G> {
    config: Config,
    session: SessionDirs,

    client: Arc<X>,
    provider: Arc<MarketDataProvider<X>>,
    gateway: Arc<OrderGateway<X>>,
    registry: Arc<FsmRegistry>,

    signal: S,
    guards: G,
    exits: ExitManager,
    pnl: Arc<PnlService>,
    cooldowns: CooldownManager,

    coordinator: ShutdownCoordinator,
    bus: Arc<EventBus>,
    event_log: Arc<EventLog>,
    metrics: Arc<Metrics>,
    intents: IntentTracker,

    positions: PositionBook,
    topcoins: Vec<Symbol>,
    btc_symbol: Symbol,
    open_buy_orders: HashMap<Symbol, String>,

    quote_free: Decimal,
    equity_peak: Decimal,
    observe_only: bool,

    stats: EngineStats,
    decision_seq: u64,

    last_md_update: Option<Instant>,
    last_exit_processing: Option<Instant>,
    last_position_check: Option<Instant>,
    last_extended_heartbeat: Option<Instant>,
    last_performance_summary: Option<Instant>,
}

impl<X, S, G> Engine<X, S, G>
where
    X: ExchangeClient,
    S: BuySignal,
    G: EntryGuards,
{
    /// `provider` is shared with the guard stack; build it with
    /// [`market_data_config`] over the same bus.
    pub fn new(
        config: Config,
        session: SessionDirs,
        client: Arc<X>,
        provider: Arc<MarketDataProvider<X>>,
        signal: S,
        guards: G,
        coordinator: ShutdownCoordinator,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        session.ensure().context("creating session directory")?;
        let event_log = Arc::new(
            EventLog::open(&session.events_file()).context("opening structured event log")?,
        );
        let metrics = Arc::new(Metrics::new().context("metrics registry")?);
        let registry = Arc::new(FsmRegistry::new());
        let gateway = Arc::new(OrderGateway::new(client.clone(), registry.clone()));
        let pnl = Arc::new(
            PnlService::new()
                .with_ledger(&session.pnl_ledger_file())
                .context("opening pnl ledger")?,
        );
        let exits = ExitManager::new(exit_config(&config));
        let topcoins: Vec<Symbol> = config
            .engine
            .watchlist
            .iter()
            .map(|s| Symbol::new(s.clone()))
            .collect();
        let btc_symbol = Symbol::new(config.engine.btc_symbol.clone());

        Ok(Self {
            session,
            client,
            provider,
            gateway,
            registry,
            signal,
            guards,
            exits,
            pnl,
            cooldowns: CooldownManager::new(),
            coordinator,
            bus,
            event_log,
            metrics,
            intents: IntentTracker::new(),
            positions: PositionBook::new(),
            topcoins,
            btc_symbol,
            open_buy_orders: HashMap::new(),
            quote_free: Decimal::ZERO,
            equity_peak: Decimal::ZERO,
            observe_only: false,
            stats: EngineStats::default(),
            decision_seq: 0,
            last_md_update: None,
            last_exit_processing: None,
            last_position_check: None,
            last_extended_heartbeat: None,
            last_performance_summary: None,
            config,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn provider(&self) -> Arc<MarketDataProvider<X>> {
        self.provider.clone()
    }

    pub fn pnl(&self) -> Arc<PnlService> {
        self.pnl.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn positions_snapshot(&self) -> HashMap<Symbol, Position> {
        self.positions.snapshot()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Startup: markets, state recovery, budget gate, history backfill.
    pub fn startup(&mut self) -> Result<()> {
        let markets = self
            .gateway
            .load_markets(false)
            .context("markets unavailable at startup")?;
        info!(markets, "market filters loaded");

        self.recover_state();
        self.refresh_balance();
        self.budget_gate()?;

        let mut universe = self.topcoins.clone();
        if !universe.contains(&self.btc_symbol) {
            universe.push(self.btc_symbol.clone());
        }
        let backfilled = self.provider.backfill_history(
            &universe,
            &self.config.market_data.timeframe,
            self.config.market_data.backfill_minutes,
        );
        let bars: usize = backfilled.values().sum();
        info!(symbols = universe.len(), bars, "history backfilled");

        self.event_log.emit(Event::ConfigSnapshot {
            config: serde_json::to_value(&self.config).unwrap_or_default(),
            engine_version: ENGINE_VERSION.to_string(),
            snapshot_reason: "startup".to_string(),
        });
        info!(
            version = ENGINE_VERSION,
            watchlist = self.topcoins.len(),
            max_positions = self.config.engine.max_positions,
            mode = self.config.trigger.drop_trigger_mode,
            observe_only = self.observe_only,
            "engine ready"
        );
        Ok(())
    }

    fn recover_state(&mut self) {
        match load_json::<PositionBook>(&self.session.positions_file()) {
            Ok(Some(book)) => {
                info!(positions = book.len(), "positions recovered");
                self.positions = book;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "positions state unreadable, starting empty"),
        }
        match load_json::<Vec<OrderFsm>>(&self.session.open_buy_orders_file()) {
            Ok(Some(orders)) => {
                for fsm in orders {
                    if fsm.is_terminal() || fsm.side != Side::Buy {
                        continue;
                    }
                    info!(order_id = %fsm.order_id, symbol = %fsm.symbol, "open buy order recovered");
                    self.open_buy_orders
                        .insert(fsm.symbol.clone(), fsm.order_id.clone());
                    self.registry.insert(fsm);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "open-order state unreadable"),
        }
    }

    fn refresh_balance(&mut self) {
        match self.client.fetch_balance() {
            Ok(balance) => {
                self.quote_free = balance.free(&self.config.engine.quote_asset);
            }
            Err(e) => debug!(kind = e.kind(), "balance refresh failed"),
        }
    }

    /// Enforce `on_insufficient_budget` before trading starts.
    fn budget_gate(&mut self) -> Result<()> {
        if self.quote_free >= self.config.sizing.min_slot_usdt {
            return Ok(());
        }
        match self.config.engine.on_insufficient_budget {
            BudgetPolicy::Observe => {
                warn!(
                    free = %self.quote_free,
                    min_slot = %self.config.sizing.min_slot_usdt,
                    "insufficient budget, running observe-only"
                );
                self.observe_only = true;
                Ok(())
            }
            BudgetPolicy::Wait => {
                info!(
                    free = %self.quote_free,
                    min_slot = %self.config.sizing.min_slot_usdt,
                    "insufficient budget, waiting"
                );
                let deadline = Instant::now() + Duration::from_secs(600);
                while self.quote_free < self.config.sizing.min_slot_usdt {
                    if self.coordinator.wait_for_shutdown(Some(Duration::from_secs(5))) {
                        anyhow::bail!("shutdown requested while waiting for budget");
                    }
                    if Instant::now() >= deadline {
                        anyhow::bail!(
                            "budget below MIN_SLOT_USDT ({}) after wait timeout",
                            self.config.sizing.min_slot_usdt
                        );
                    }
                    self.refresh_balance();
                }
                Ok(())
            }
        }
    }

    /// Main loop. Returns when shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        self.startup()?;
        let quantum = Duration::from_millis(self.config.engine.cycle_quantum_ms);

        while !self.coordinator.is_shutdown_requested() {
            self.coordinator.beat("engine_cycle");
            let started = Instant::now();
            if let Err(e) = self.cycle() {
                // Contained: log, mark, breathe, continue
                self.stats.cycle_errors += 1;
                error!(error = %e, "engine cycle failed");
                self.event_log.emit(Event::Heartbeat {
                    cycle: Some(self.stats.cycles),
                    positions: Some(self.positions.len()),
                    symbols: Some(self.topcoins.len()),
                    label: Some("engine_exception".to_string()),
                });
                self.coordinator.wait_for_shutdown(Some(Duration::from_secs(1)));
            }
            self.metrics
                .cycle_latency
                .observe(started.elapsed().as_secs_f64());
            self.stats.cycles += 1;
            self.coordinator.wait_for_shutdown(Some(quantum));
        }

        info!("engine loop stopped, persisting state");
        self.persist_state();
        self.event_log.flush();
        Ok(())
    }

    fn cycle(&mut self) -> Result<()> {
        let md_interval = Duration::from_secs(self.config.engine.md_update_interval_s);
        let exit_interval = Duration::from_secs(self.config.engine.exit_processing_interval_s);
        let position_interval = Duration::from_secs(self.config.engine.position_check_interval_s);

        if due(&mut self.last_md_update, md_interval) {
            self.refresh_market_data();
        }
        if due(&mut self.last_exit_processing, exit_interval) {
            self.process_exits();
        }
        if due(&mut self.last_position_check, position_interval) {
            self.check_positions();
        }

        self.evaluate_buys();

        if due(&mut self.last_extended_heartbeat, Duration::from_secs(30)) {
            self.extended_heartbeat();
            self.maintenance();
        }
        if due(&mut self.last_performance_summary, Duration::from_secs(60)) {
            self.performance_summary();
        }
        Ok(())
    }

    // ========================================================================
    // Cycle stages
    // ========================================================================

    fn refresh_universe(&self) -> Vec<Symbol> {
        let mut symbols = self.positions.symbols();
        for s in &self.topcoins {
            if !symbols.contains(s) {
                symbols.push(s.clone());
            }
        }
        if !symbols.contains(&self.btc_symbol) {
            symbols.push(self.btc_symbol.clone());
        }
        symbols
    }

    fn refresh_market_data(&mut self) {
        let symbols = self.refresh_universe();
        let started = Instant::now();
        let results = self.provider.update_market_data(&symbols);
        self.metrics
            .md_refresh_latency
            .observe(started.elapsed().as_secs_f64());
        let failures = results.values().filter(|ok| !**ok).count();
        if failures > 0 {
            debug!(failures, total = symbols.len(), "market refresh partial");
        }

        let now = now_s();
        for symbol in &symbols {
            let Some(ticker) = self.provider.get_ticker(symbol, true) else {
                continue;
            };
            let Some(price) = positive_price(&ticker) else { continue };

            self.signal.observe(symbol, price, now);
            let volume = self
                .provider
                .latest_bar(symbol)
                .map(|b| b.volume)
                .unwrap_or(ticker.volume);
            self.guards.feed_price(symbol, price, volume, now);
            self.guards.feed_book(symbol, ticker.bid, ticker.ask);
            self.publish_snapshot(symbol, &ticker);
        }

        let btc_change = self.provider.change_factor(&self.btc_symbol, 60);
        let falling = self.falling_ratio();
        self.guards.set_market_aggregates(btc_change, falling);

        self.refresh_balance();
    }

    /// Fraction of the watchlist with a negative 60-minute return.
    fn falling_ratio(&self) -> Option<Decimal> {
        let mut total = 0u32;
        let mut falling = 0u32;
        for symbol in &self.topcoins {
            if let Some(factor) = self.provider.change_factor(symbol, 60) {
                total += 1;
                if factor < Decimal::ONE {
                    falling += 1;
                }
            }
        }
        (total > 0).then(|| Decimal::from(falling) / Decimal::from(total))
    }

    fn publish_snapshot(&self, symbol: &Symbol, ticker: &Ticker) {
        let view = self.signal.snapshot(symbol);
        self.provider.publish_snapshot(MarketSnapshot {
            version: MarketSnapshot::VERSION,
            symbol: symbol.clone(),
            price: SnapshotPrice {
                last: ticker.last,
                bid: ticker.bid,
                ask: ticker.ask,
            },
            windows: SnapshotWindows {
                anchor: view.anchor,
                peak: view.peak,
                drop_pct: view.drop_pct,
            },
            liquidity: SnapshotLiquidity {
                spread_pct: ticker.spread_bps().map(|bps| bps / Decimal::from(100)),
            },
            timestamp_ms: ticker.timestamp_ms,
        });
    }

    fn process_exits(&mut self) {
        let fills = self.exits.process(
            &self.gateway,
            &mut self.positions,
            &self.pnl,
            &self.event_log,
            now_s(),
        );
        for fill in fills {
            self.note_exit_fill(&fill);
        }
    }

    fn note_exit_fill(&mut self, fill: &ExitFill) {
        self.stats.exit_fills += 1;
        self.metrics.fills_total.with_label_values(&["SELL"]).inc();
        self.metrics.realized_pnl.set(
            self.pnl.realized_net().to_f64().unwrap_or(0.0),
        );
        self.bus.publish(
            TOPIC_FILLS,
            &BusEvent::Fill(FillEvent {
                symbol: fill.symbol.clone(),
                side: Side::Sell,
                qty: fill.qty,
                avg_price: fill.price,
                fee_quote: fill.fee,
                ts: now_s(),
                entry_price: None,
            }),
        );
        if fill.position_closed {
            self.cooldowns.set(
                &fill.symbol,
                self.config.engine.symbol_cooldown_after_failed_order_s,
            );
        }
    }

    fn check_positions(&mut self) {
        self.poll_open_buy_orders();

        let now = now_s();
        let mut total_unrealized = Decimal::ZERO;
        for symbol in self.positions.symbols() {
            let Some(price) = self.provider.get_price(&symbol, true) else {
                continue;
            };
            if let Some(position) = self.positions.get_mut(&symbol) {
                position.update_peak(price);
            }

            if let Some(fill) = self.exits.ensure_protection(
                &self.gateway,
                &mut self.positions,
                &symbol,
                &self.pnl,
                &self.event_log,
                now,
            ) {
                self.note_exit_fill(&fill);
                if fill.position_closed {
                    continue;
                }
            }

            if let Some(position) = self.positions.get(&symbol) {
                if let Some(decision) = self.exits.evaluate_and_enqueue(position, price, now) {
                    self.metrics
                        .exit_signals_total
                        .with_label_values(&[decision.reason.as_str()])
                        .inc();
                }
            }
            if let Some(u) = self.pnl.unrealized(&symbol, price) {
                total_unrealized += u;
            }
        }
        self.metrics
            .unrealized_pnl
            .set(total_unrealized.to_f64().unwrap_or(0.0));
        self.metrics.open_positions.set(self.positions.len() as i64);
    }

    fn poll_open_buy_orders(&mut self) {
        let now = now_s();
        let entries: Vec<(Symbol, String)> = self
            .open_buy_orders
            .iter()
            .map(|(s, id)| (s.clone(), id.clone()))
            .collect();

        for (symbol, order_id) in entries {
            let (fsm, delta) = match self.gateway.sync_order(&order_id, &symbol) {
                Ok(r) => r,
                Err(e) => {
                    debug!(%symbol, kind = e.kind(), "buy order sync failed");
                    continue;
                }
            };
            if let Some(d) = delta {
                self.handle_buy_fill(&symbol, d);
            }
            self.event_log.emit(Event::OrderUpdate {
                client_order_id: fsm.client_order_id.clone(),
                order_id: fsm.order_id.clone(),
                status: fsm.state.to_string(),
                filled: fsm.filled_qty,
                remaining: fsm.remaining_qty(),
                average_price: (fsm.filled_qty > Decimal::ZERO).then_some(fsm.avg_fill_price),
            });

            if fsm.is_terminal() {
                self.open_buy_orders.remove(&symbol);
                if fsm.filled_qty <= Decimal::ZERO {
                    // Failed attempt: bench the symbol
                    self.cooldowns.set(
                        &symbol,
                        self.config.engine.symbol_cooldown_after_failed_order_s,
                    );
                    self.intents.abandon(&symbol);
                }
            } else if now - fsm.created_ts >= self.config.engine.order_poll_timeout_s {
                // Unfilled past the poll window (IOC that never resolved or a
                // resting GTC gone stale): cancel, settle any late fills
                info!(%symbol, order_id = %fsm.order_id, "buy order timed out, canceling");
                match self.gateway.cancel_order(&order_id, &symbol) {
                    Ok((_, Some(d))) => self.handle_buy_fill(&symbol, d),
                    Ok((_, None)) => {}
                    Err(e) => warn!(%symbol, kind = e.kind(), "buy cancel failed"),
                }
                self.open_buy_orders.remove(&symbol);
                self.cooldowns.set(
                    &symbol,
                    self.config.engine.symbol_cooldown_after_failed_order_s,
                );
                self.intents.abandon(&symbol);
            }
        }
    }

    fn handle_buy_fill(&mut self, symbol: &Symbol, delta: FillDelta) {
        let now = now_s();
        self.pnl.apply_fill(&FillEvent {
            symbol: symbol.clone(),
            side: Side::Buy,
            qty: delta.qty,
            avg_price: delta.price,
            fee_quote: delta.fee,
            ts: now,
            entry_price: None,
        });

        // The PnL projection is authoritative for entry bookkeeping
        if let Some(projection) = self.pnl.position(symbol) {
            match self.positions.get_mut(symbol) {
                Some(position) => {
                    position.quantity = projection.qty;
                    position.entry_price = projection.entry_price;
                    position.entry_fee_per_unit = projection.entry_fee_per_unit;
                }
                None => {
                    self.positions.insert(Position::open(
                        symbol.clone(),
                        projection.qty,
                        projection.entry_price,
                        now,
                        projection.entry_fee_per_unit,
                        self.config.exits.use_trailing_stop,
                        "drop_trigger",
                    ));
                }
            }
        }

        self.signal.on_position_opened(symbol, delta.price, now);
        self.cooldowns.set(
            symbol,
            self.config.engine.symbol_cooldown_after_failed_order_s,
        );

        self.event_log.emit(Event::OrderFilled {
            symbol: symbol.clone(),
            side: Side::Buy,
            price: delta.price,
            qty: delta.qty,
            fee_quote: delta.fee,
        });
        self.event_log.emit(Event::TradeFill {
            symbol: symbol.clone(),
            side: Side::Buy,
            price: delta.price,
            qty: delta.qty,
            fee_quote: delta.fee,
            slippage_bp: None,
            ts: now,
        });
        self.metrics.fills_total.with_label_values(&["BUY"]).inc();
        if let Some(elapsed) = self.intents.resolve(symbol) {
            self.metrics.decision_latency.observe(elapsed.as_secs_f64());
        }
        self.bus.publish(
            TOPIC_FILLS,
            &BusEvent::Fill(FillEvent {
                symbol: symbol.clone(),
                side: Side::Buy,
                qty: delta.qty,
                avg_price: delta.price,
                fee_quote: delta.fee,
                ts: now,
                entry_price: None,
            }),
        );
    }

    // ========================================================================
    // Buy evaluation
    // ========================================================================

    fn evaluate_buys(&mut self) {
        if self.observe_only {
            return;
        }
        for symbol in self.topcoins.clone() {
            if self.positions.len() >= self.config.engine.max_positions {
                break;
            }
            if self.positions.contains(&symbol)
                || self.open_buy_orders.contains_key(&symbol)
                || self.cooldowns.is_active(&symbol)
            {
                continue;
            }
            let Some(ticker) = self.provider.get_ticker(&symbol, true) else {
                continue;
            };
            let Some(price) = positive_price(&ticker) else { continue };

            self.decision_seq += 1;
            self.stats.decisions += 1;
            let decision_id = format!("d-{}", self.decision_seq);
            self.event_log.emit(Event::DecisionStart {
                decision: decision_id.clone(),
                symbol: symbol.clone(),
            });

            let (reason, failed_guards) = self.evaluate_buy_candidate(&symbol, &ticker, price);
            self.metrics
                .decisions_total
                .with_label_values(&[reason])
                .inc();
            self.event_log.emit(Event::DecisionEnd {
                decision: decision_id,
                reason: reason.to_string(),
                failed_guards,
            });
        }
    }

    fn evaluate_buy_candidate(
        &mut self,
        symbol: &Symbol,
        ticker: &Ticker,
        price: Decimal,
    ) -> (&'static str, Option<Vec<String>>) {
        let now = now_s();

        // 1. Feed the signal pipeline (anchor + rolling window)
        self.signal.observe(symbol, price, now);
        self.guards.feed_book(symbol, ticker.bid, ticker.ask);

        // 2. Composite guards
        let verdict = self.guards.check(symbol, price);
        if !verdict.pass {
            for guard in verdict.failed.iter().copied() {
                self.metrics.guard_blocks_total.with_label_values(&[guard]).inc();
            }
            let failed: Vec<String> = verdict.failed.iter().map(|g| g.to_string()).collect();
            self.event_log.emit(Event::GuardBlockSummary {
                symbol: symbol.clone(),
                failed_guards: failed.clone(),
            });
            return ("blocked_by_guards", Some(failed));
        }

        // 3. Budget gate
        let budget = self.config.sizing.position_size_usdt.min(self.quote_free);
        if budget < self.config.sizing.min_slot_usdt {
            return ("insufficient_budget", None);
        }

        // 4. Spread cap
        match ticker.spread_bps() {
            Some(spread) if spread > Decimal::from(self.config.sizing.max_spread_bps_entry) => {
                return ("spread_too_wide", None);
            }
            Some(_) => {}
            None => return ("no_orderbook", None),
        }

        // 5. Slippage cap on the effective limit price
        let effective_price = match ticker.mid() {
            Some(mid) => price.min(
                mid * (Decimal::ONE
                    + Decimal::from(self.config.sizing.max_slippage_bps_entry)
                        / Decimal::from(10_000)),
            ),
            None => price,
        };

        // 6. Sizing against venue filters
        let market = self.gateway.market(symbol);
        let qty = match size_buy_from_quote(budget, effective_price, &market) {
            Ok(q) => q,
            Err(e) => return (e.reason(), None),
        };

        // 7. Drop trigger
        let eval = self.signal.evaluate(symbol, price, now);
        if !eval.triggered {
            return (eval.reason.as_str(), None);
        }

        // 8. Confirmation stabilizer
        if !self.signal.confirm(symbol, true) {
            return ("await_confirmation", None);
        }

        // 9. Submit: IOC for rolling-high mode, resting post-only otherwise
        let mode = self
            .config
            .trigger
            .mode()
            .unwrap_or(AnchorMode::Persistent);
        let (tif, post_only) = if mode == AnchorMode::RollingHigh {
            (TimeInForce::Ioc, false)
        } else {
            (TimeInForce::Gtc, true)
        };

        // Round exactly the way the gateway will, so the audit record and
        // the deterministic client order id match the submission
        let rounded_price =
            crate::core::types::round_price_to_tick(effective_price, market.price_tick);
        let coid = crate::core::coid::client_order_id(
            symbol,
            Side::Buy,
            qty,
            Some(rounded_price),
            OrderType::Limit,
        );
        self.intents.open(symbol, "drop_trigger", budget);
        self.event_log.emit(Event::OrderSent {
            symbol: symbol.clone(),
            side: Side::Buy,
            price: Some(rounded_price),
            qty,
            notional: qty * rounded_price,
            tif,
            post_only,
            client_order_id: coid,
            filters: market,
            audit: format!("drop_bp={:?}", eval.drop_bp),
        });

        match self.gateway.place_order(
            symbol,
            Side::Buy,
            OrderType::Limit,
            qty,
            Some(rounded_price),
            tif,
            post_only,
        ) {
            Ok(fsm) => {
                self.stats.buy_orders += 1;
                self.metrics
                    .orders_total
                    .with_label_values(&["BUY", "LIMIT"])
                    .inc();
                // Conservative local debit until the next balance refresh
                self.quote_free -= qty * rounded_price;

                if fsm.filled_qty > Decimal::ZERO {
                    self.handle_buy_fill(
                        symbol,
                        FillDelta {
                            qty: fsm.filled_qty,
                            price: fsm.avg_fill_price,
                            fee: fsm.total_fees,
                        },
                    );
                }
                if !fsm.is_terminal() {
                    self.open_buy_orders
                        .insert(symbol.clone(), fsm.order_id.clone());
                } else if fsm.filled_qty <= Decimal::ZERO {
                    self.cooldowns.set(
                        symbol,
                        self.config.engine.symbol_cooldown_after_failed_order_s,
                    );
                    self.intents.abandon(symbol);
                    return ("order_failed", None);
                }
                ("order_placed", None)
            }
            Err(PlaceError::Sizing(e)) => {
                self.intents.abandon(symbol);
                (e.reason(), None)
            }
            Err(e) => {
                warn!(%symbol, error = %e, "buy order failed");
                if let PlaceError::Exchange(ex) = &e {
                    self.metrics
                        .order_failures_total
                        .with_label_values(&[ex.kind()])
                        .inc();
                }
                self.cooldowns.set(
                    symbol,
                    self.config.engine.symbol_cooldown_after_failed_order_s,
                );
                self.intents.abandon(symbol);
                ("order_failed", None)
            }
        }
    }

    // ========================================================================
    // Maintenance and telemetry
    // ========================================================================

    fn equity(&self) -> Decimal {
        let mut equity = self.quote_free;
        for (symbol, position) in self.positions.iter() {
            if let Some(price) = self.provider.get_price(symbol, true) {
                equity += position.notional_at(price);
            }
        }
        equity
    }

    fn extended_heartbeat(&mut self) {
        let equity = self.equity();
        if equity > self.equity_peak {
            self.equity_peak = equity;
        }
        let drawdown_pct = if self.equity_peak > Decimal::ZERO {
            ((self.equity_peak - equity) / self.equity_peak * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        self.metrics.equity.set(equity.to_f64().unwrap_or(0.0));

        self.event_log.emit(Event::Heartbeat {
            cycle: Some(self.stats.cycles),
            positions: Some(self.positions.len()),
            symbols: Some(self.topcoins.len()),
            label: None,
        });
        self.emit_shutdown_heartbeat();
        info!(
            cycle = self.stats.cycles,
            positions = self.positions.len(),
            %equity,
            drawdown_pct,
            "heartbeat"
        );
    }

    fn emit_shutdown_heartbeat(&self) {
        let status = self.coordinator.status();
        self.event_log.emit(Event::ShutdownHeartbeat {
            registered_components: status.components.len(),
            registered_threads: status.threads.clone(),
            recent_heartbeats: status.recent_beats.clone(),
            stats: serde_json::json!({
                "duplicate_requests": status.duplicate_requests,
                "requested": status.requested,
            }),
        });
    }

    fn maintenance(&mut self) {
        let expired_cache = self.provider.cleanup_expired_cache();
        let expired_cooldowns = self.cooldowns.cleanup_expired();
        let pruned = self.registry.prune_terminal(3600);
        self.signal.maintain();

        for counter in self.guards.drain_counters() {
            if counter.blocks > 0 {
                info!(
                    guard = counter.name,
                    passes = counter.passes,
                    blocks = counter.blocks,
                    "guard summary"
                );
            }
        }
        debug!(expired_cache, expired_cooldowns, pruned, "maintenance pass");
        self.persist_state();
    }

    fn performance_summary(&mut self) {
        let summary = self.pnl.summary(&self.current_prices());
        info!(
            cycles = self.stats.cycles,
            decisions = self.stats.decisions,
            buys = self.stats.buy_orders,
            exit_fills = self.stats.exit_fills,
            errors = self.stats.cycle_errors,
            realized = %summary.realized_pnl_net,
            unrealized = %summary.unrealized_pnl,
            fills = self.pnl.fills_applied(),
            "performance summary"
        );
        // Text exposition lands next to the event log for scraping
        let path = self.session.logs_dir().join("metrics.prom");
        if let Err(e) = std::fs::write(&path, self.metrics.encode_text()) {
            debug!(error = %e, "metrics exposition write failed");
        }
        self.event_log.flush();
    }

    fn current_prices(&self) -> HashMap<Symbol, Decimal> {
        let mut prices = HashMap::new();
        for (symbol, _) in self.positions.iter() {
            if let Some(price) = self.provider.get_price(symbol, true) {
                prices.insert(symbol.clone(), price);
            }
        }
        prices
    }

    fn persist_state(&self) {
        if let Err(e) = atomic_write_json(&self.session.positions_file(), &self.positions) {
            warn!(error = %e, "positions persistence failed");
        }
        let open_buys: Vec<OrderFsm> = self
            .open_buy_orders
            .values()
            .filter_map(|id| self.registry.get(id))
            .collect();
        if let Err(e) = atomic_write_json(&self.session.open_buy_orders_file(), &open_buys) {
            warn!(error = %e, "open-order persistence failed");
        }
    }
}

/// Cadence gate: true (and re-arms) when `interval` elapsed since the last
/// pass, or on the first call.
fn due(last: &mut Option<Instant>, interval: Duration) -> bool {
    let now = Instant::now();
    let is_due = last.map(|t| now.duration_since(t) >= interval).unwrap_or(true);
    if is_due {
        *last = Some(now);
    }
    is_due
}

fn positive_price(ticker: &Ticker) -> Option<Decimal> {
    if ticker.last > Decimal::ZERO {
        Some(ticker.last)
    } else if ticker.ask > Decimal::ZERO {
        Some(ticker.ask)
    } else if ticker.bid > Decimal::ZERO {
        Some(ticker.bid)
    } else {
        None
    }
}

/// Provider configuration derived from the bot config.
pub fn market_data_config(config: &Config) -> MarketDataConfig {
    MarketDataConfig {
        ticker_ttl: Duration::from_secs(config.market_data.ticker_ttl_s),
        cache_max_size: config.market_data.cache_max_size,
        fallback_tolerance: Duration::from_secs(config.market_data.fallback_tolerance_s),
        synthetic_spread_bps: Decimal::from(10),
        timeframe: config.market_data.timeframe.clone(),
        history_max_bars: config.market_data.history_max_bars,
        health: crate::market::HealthConfig {
            failure_threshold: config.market_data.circuit_failure_threshold,
            open_timeout: Duration::from_secs(config.market_data.circuit_timeout_s),
        },
    }
}

fn exit_config(config: &Config) -> ExitConfig {
    ExitConfig {
        rules: ExitRules {
            tp_factor: Some(config.exits.take_profit_threshold),
            sl_factor: Some(config.exits.stop_loss_threshold),
            use_trailing: config.exits.use_trailing_stop,
            trailing_activation_pct: config.exits.trailing_activation_pct,
            trailing_distance_pct: config.exits.trailing_distance_pct,
            max_hold_minutes: (config.exits.trade_ttl_min > 0).then_some(config.exits.trade_ttl_min),
        },
        ladder_bps: config.exits.exit_ladder_bps.clone(),
        step_ttl_s: config.exits.exit_step_ttl_s,
        never_market_sells: config.exits.never_market_sells,
        queue_capacity: 64,
        dedup_ttl: Duration::from_secs(2),
        max_batch: 5,
        reattach_tolerance_pct: Decimal::from(2),
    }
}
