//! Market guards
//!
//! Composable entry filters run in a fixed, deterministic order:
//! spread, SMA, volume, volatility, BTC filter, falling-coins ratio.
//! A disabled guard short-circuits to pass. Missing data also passes: a
//! guard only blocks on evidence, the sizing and spread caps in the buy path
//! still apply either way. Pass/block counters accumulate per guard for the
//! periodic summary.

use dipper_core::config::GuardSettings;
use dipper_core::core::types::Symbol;
use dipper_core::engine::traits::{EntryGuards, GuardCounter, GuardVerdict};
use dipper_core::exchange::client::ExchangeClient;
use dipper_core::market::MarketDataProvider;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const SPREAD_GUARD: &str = "spread_guard";
pub const SMA_GUARD: &str = "sma_guard";
pub const VOLUME_GUARD: &str = "volume_guard";
pub const VOLATILITY_GUARD: &str = "volatility_guard";
pub const BTC_FILTER: &str = "btc_filter";
pub const FALLING_COINS_FILTER: &str = "falling_coins_filter";

pub struct GuardStack<X> {
    settings: GuardSettings,
    provider: Arc<MarketDataProvider<X>>,
    books: HashMap<Symbol, (Decimal, Decimal)>,
    last_volume: HashMap<Symbol, Decimal>,
    btc_change: Option<Decimal>,
    falling_ratio: Option<Decimal>,
    /// Per-symbol spread cap overrides (bps)
    spread_overrides: HashMap<Symbol, Decimal>,
    counters: BTreeMap<&'static str, (u64, u64)>,
}

impl<X: ExchangeClient> GuardStack<X> {
    pub fn new(settings: GuardSettings, provider: Arc<MarketDataProvider<X>>) -> Self {
        Self {
            settings,
            provider,
            books: HashMap::new(),
            last_volume: HashMap::new(),
            btc_change: None,
            falling_ratio: None,
            spread_overrides: HashMap::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn set_spread_override(&mut self, symbol: Symbol, max_spread_bps: Decimal) {
        self.spread_overrides.insert(symbol, max_spread_bps);
    }

    fn record(&mut self, guard: &'static str, pass: bool) {
        let entry = self.counters.entry(guard).or_insert((0, 0));
        if pass {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    fn spread_pass(&self, symbol: &Symbol) -> bool {
        let Some((bid, ask)) = self.books.get(symbol) else {
            return true;
        };
        if *bid <= Decimal::ZERO || *ask <= Decimal::ZERO {
            return true;
        }
        let spread_bps = (*ask - *bid) / *bid * Decimal::from(10_000);
        let cap = self
            .spread_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.settings.max_spread_bps);
        spread_bps <= cap
    }

    fn sma_pass(&self, symbol: &Symbol, price: Decimal) -> bool {
        match self.provider.sma(symbol, self.settings.sma_window) {
            Some(sma) => price >= sma * self.settings.sma_min_ratio,
            None => true,
        }
    }

    fn volume_pass(&self, symbol: &Symbol) -> bool {
        let current = self
            .last_volume
            .get(symbol)
            .copied()
            .or_else(|| self.provider.latest_bar(symbol).map(|b| b.volume));
        let (Some(current), Some(mean)) = (
            current,
            self.provider.mean_volume(symbol, self.settings.volume_window),
        ) else {
            return true;
        };
        current >= self.settings.volume_factor * mean
    }

    /// Rejects dead markets: too little realized volatility to ever reach
    /// the take-profit.
    fn volatility_pass(&self, symbol: &Symbol) -> bool {
        match self
            .provider
            .returns_sigma_bps(symbol, self.settings.volatility_window)
        {
            Some(sigma) => sigma >= self.settings.require_vol_sigma_bps_min,
            None => true,
        }
    }

    fn btc_pass(&self) -> bool {
        match self.btc_change {
            Some(change) => change >= self.settings.btc_change_threshold,
            None => true,
        }
    }

    fn falling_pass(&self) -> bool {
        match self.falling_ratio {
            Some(ratio) => ratio <= self.settings.falling_threshold,
            None => true,
        }
    }
}

impl<X: ExchangeClient> EntryGuards for GuardStack<X> {
    fn feed_price(&mut self, symbol: &Symbol, _price: Decimal, volume: Decimal, _now_s: i64) {
        self.last_volume.insert(symbol.clone(), volume);
    }

    fn feed_book(&mut self, symbol: &Symbol, bid: Decimal, ask: Decimal) {
        self.books.insert(symbol.clone(), (bid, ask));
    }

    fn set_market_aggregates(
        &mut self,
        btc_change_factor: Option<Decimal>,
        falling_ratio: Option<Decimal>,
    ) {
        self.btc_change = btc_change_factor;
        self.falling_ratio = falling_ratio;
    }

    fn check(&mut self, symbol: &Symbol, price: Decimal) -> GuardVerdict {
        let checks: [(&'static str, bool, bool); 6] = [
            (SPREAD_GUARD, self.settings.use_spread_guard, self.spread_pass(symbol)),
            (SMA_GUARD, self.settings.use_sma_guard, self.sma_pass(symbol, price)),
            (VOLUME_GUARD, self.settings.use_volume_guard, self.volume_pass(symbol)),
            (
                VOLATILITY_GUARD,
                self.settings.use_volatility_guard,
                self.volatility_pass(symbol),
            ),
            (BTC_FILTER, self.settings.use_btc_filter, self.btc_pass()),
            (
                FALLING_COINS_FILTER,
                self.settings.use_falling_coins_filter,
                self.falling_pass(),
            ),
        ];

        let mut failed = Vec::new();
        for (name, enabled, pass) in checks {
            if !enabled {
                continue;
            }
            self.record(name, pass);
            if !pass {
                failed.push(name);
            }
        }
        if !failed.is_empty() {
            debug!(%symbol, ?failed, "entry blocked by guards");
        }
        GuardVerdict {
            pass: failed.is_empty(),
            failed,
        }
    }

    fn drain_counters(&mut self) -> Vec<GuardCounter> {
        let drained = self
            .counters
            .iter()
            .map(|(name, (passes, blocks))| GuardCounter {
                name,
                passes: *passes,
                blocks: *blocks,
            })
            .collect();
        self.counters.clear();
        drained
    }
}
