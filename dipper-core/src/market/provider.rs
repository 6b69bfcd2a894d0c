//! Market-data provider
//!
//! Front door for all price data: ticker cache with TTL/LRU, OHLCV history,
//! and a degraded fallback path guarded by a per-symbol circuit breaker.
//! When live fetches fail, the provider serves the last good ticker within a
//! staleness tolerance, or synthesizes bid/ask around the last close with a
//! small assumed spread, flagging the result `degraded`.

use crate::core::clock::now_ms;
use crate::core::errors::ExchangeError;
use crate::core::types::{Bar, Symbol, Ticker};
use crate::exchange::client::ExchangeClient;
use crate::market::cache::{CacheStats, TickerCache};
use crate::market::health::{HealthConfig, SymbolHealth};
use crate::market::history::OhlcvHistory;
use crate::market::MarketSnapshot;
use crate::runtime::event_bus::{BusEvent, EventBus, TOPIC_SNAPSHOTS};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub ticker_ttl: Duration,
    pub cache_max_size: usize,
    /// How old a sidecar ticker may be before the fallback refuses it
    pub fallback_tolerance: Duration,
    /// Assumed full spread when synthesizing bid/ask from a close, in bps
    pub synthetic_spread_bps: Decimal,
    pub timeframe: String,
    pub history_max_bars: usize,
    pub health: HealthConfig,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            ticker_ttl: Duration::from_secs(5),
            cache_max_size: 1000,
            fallback_tolerance: Duration::from_secs(30),
            synthetic_spread_bps: Decimal::from(10),
            timeframe: "1m".to_string(),
            history_max_bars: 1000,
            health: HealthConfig::default(),
        }
    }
}

pub struct MarketDataProvider<X> {
    client: Arc<X>,
    config: MarketDataConfig,
    cache: Mutex<TickerCache>,
    history: Mutex<OhlcvHistory>,
    health: Mutex<HashMap<Symbol, SymbolHealth>>,
    bus: Arc<EventBus>,
}

impl<X: ExchangeClient> MarketDataProvider<X> {
    pub fn new(client: Arc<X>, bus: Arc<EventBus>, config: MarketDataConfig) -> Self {
        Self {
            cache: Mutex::new(TickerCache::new(config.ticker_ttl, config.cache_max_size)),
            history: Mutex::new(OhlcvHistory::new(config.history_max_bars)),
            health: Mutex::new(HashMap::new()),
            client,
            config,
            bus,
        }
    }

    // ========================================================================
    // Tickers
    // ========================================================================

    /// Current ticker, from cache when allowed, otherwise fetched live with
    /// the degraded fallback on failure.
    pub fn get_ticker(&self, symbol: &Symbol, use_cache: bool) -> Option<Ticker> {
        if use_cache {
            if let Some(ticker) = self.cache.lock().get(symbol) {
                return Some(ticker);
            }
        }

        let permitted = {
            let mut health = self.health.lock();
            health
                .entry(symbol.clone())
                .or_insert_with(|| SymbolHealth::new(self.config.health.clone()))
                .fetch_permitted(symbol.as_str())
        };
        if !permitted {
            return self.fallback_ticker(symbol);
        }

        match self.client.fetch_ticker(symbol) {
            Ok(ticker) if ticker.is_valid() => {
                if let Some(h) = self.health.lock().get_mut(symbol) {
                    h.record_success(symbol.as_str());
                }
                self.cache.lock().store(ticker.clone());
                Some(ticker)
            }
            Ok(invalid) => {
                warn!(%symbol, bid = %invalid.bid, ask = %invalid.ask, "invalid ticker");
                self.record_failure(symbol);
                self.fallback_ticker(symbol)
            }
            Err(e) => {
                debug!(%symbol, kind = e.kind(), "ticker fetch failed");
                self.record_failure(symbol);
                self.fallback_ticker(symbol)
            }
        }
    }

    fn record_failure(&self, symbol: &Symbol) {
        if let Some(h) = self.health.lock().get_mut(symbol) {
            h.record_failure(symbol.as_str());
        }
    }

    /// Last resort: stale sidecar ticker, else bid/ask synthesized around the
    /// last stored close. Always flagged `degraded`.
    fn fallback_ticker(&self, symbol: &Symbol) -> Option<Ticker> {
        if let Some(mut stale) = self
            .cache
            .lock()
            .get_stale(symbol, self.config.fallback_tolerance)
        {
            stale.degraded = true;
            return Some(stale);
        }

        let close = self
            .history
            .lock()
            .latest_bar(symbol, &self.config.timeframe)?
            .close;
        if close <= Decimal::ZERO {
            return None;
        }
        let half_spread =
            close * self.config.synthetic_spread_bps / Decimal::from(10_000) / Decimal::from(2);
        Some(Ticker {
            symbol: symbol.clone(),
            last: close,
            bid: close - half_spread,
            ask: close + half_spread,
            volume: Decimal::ZERO,
            timestamp_ms: now_ms(),
            high_24h: None,
            low_24h: None,
            change_pct_24h: None,
            degraded: true,
        })
    }

    /// Best available price: `last`, falling back to `ask`, then `bid`.
    pub fn get_price(&self, symbol: &Symbol, prefer_cache: bool) -> Option<Decimal> {
        let ticker = self.get_ticker(symbol, prefer_cache)?;
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

    pub fn get_spread_bps(&self, symbol: &Symbol) -> Option<Decimal> {
        self.get_ticker(symbol, true)?.spread_bps()
    }

    // ========================================================================
    // OHLCV
    // ========================================================================

    pub fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
        store: bool,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let bars = self.client.fetch_ohlcv(symbol, timeframe, limit, None)?;
        if store {
            self.history.lock().add_bars(symbol, timeframe, &bars);
        }
        Ok(bars)
    }

    /// One-shot bootstrap of per-symbol history. Returns bars stored per
    /// symbol; failed symbols report zero.
    pub fn backfill_history(
        &self,
        symbols: &[Symbol],
        timeframe: &str,
        minutes: usize,
    ) -> HashMap<Symbol, usize> {
        let mut result = HashMap::new();
        for symbol in symbols {
            let stored = match self.fetch_ohlcv(symbol, timeframe, minutes, true) {
                Ok(bars) => bars.len(),
                Err(e) => {
                    warn!(%symbol, kind = e.kind(), "backfill failed");
                    0
                }
            };
            result.insert(symbol.clone(), stored);
        }
        result
    }

    /// Batch refresh: live ticker plus the freshest bars for each symbol.
    pub fn update_market_data(&self, symbols: &[Symbol]) -> HashMap<Symbol, bool> {
        let mut result = HashMap::new();
        for symbol in symbols {
            let ticker_ok = self
                .get_ticker(symbol, false)
                .map(|t| !t.degraded)
                .unwrap_or(false);
            if ticker_ok {
                // Keep the candle history rolling for guard statistics
                let _ = self.fetch_ohlcv(symbol, &self.config.timeframe, 2, true);
            }
            result.insert(symbol.clone(), ticker_ok);
        }
        result
    }

    // ========================================================================
    // Derived series access (guards read these)
    // ========================================================================

    pub fn sma(&self, symbol: &Symbol, window: usize) -> Option<Decimal> {
        self.history.lock().sma(symbol, &self.config.timeframe, window)
    }

    pub fn mean_volume(&self, symbol: &Symbol, window: usize) -> Option<Decimal> {
        self.history
            .lock()
            .mean_volume(symbol, &self.config.timeframe, window)
    }

    pub fn latest_bar(&self, symbol: &Symbol) -> Option<Bar> {
        self.history.lock().latest_bar(symbol, &self.config.timeframe)
    }

    pub fn returns_sigma_bps(&self, symbol: &Symbol, window: usize) -> Option<f64> {
        self.history
            .lock()
            .returns_sigma_bps(symbol, &self.config.timeframe, window)
    }

    pub fn change_factor(&self, symbol: &Symbol, minutes: usize) -> Option<Decimal> {
        self.history
            .lock()
            .change_factor(symbol, &self.config.timeframe, minutes)
    }

    pub fn price_range(&self, symbol: &Symbol, lookback: usize) -> Option<(Decimal, Decimal)> {
        self.history
            .lock()
            .price_range(symbol, &self.config.timeframe, lookback)
    }

    pub fn atr(&self, symbol: &Symbol, period: usize) -> Option<Decimal> {
        self.history.lock().atr(symbol, &self.config.timeframe, period)
    }

    // ========================================================================
    // Maintenance and publication
    // ========================================================================

    pub fn publish_snapshot(&self, snapshot: MarketSnapshot) {
        self.bus
            .publish(TOPIC_SNAPSHOTS, &BusEvent::Snapshot(snapshot));
    }

    pub fn cleanup_expired_cache(&self) -> usize {
        self.cache.lock().cleanup_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;

    fn provider_with_mock() -> (Arc<MockExchange>, MarketDataProvider<MockExchange>) {
        let mock = Arc::new(MockExchange::new());
        let provider = MarketDataProvider::new(
            mock.clone(),
            Arc::new(EventBus::new()),
            MarketDataConfig::default(),
        );
        (mock, provider)
    }

    fn bar(ts: i64, close: Decimal) -> Bar {
        Bar {
            timestamp_ms: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_live_fetch_populates_cache() {
        let (mock, provider) = provider_with_mock();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));

        assert!(provider.get_ticker(&sym, true).is_some());
        // Second call hits the cache, not the client
        assert!(provider.get_ticker(&sym, true).is_some());
        assert_eq!(mock.call_count("fetch_ticker"), 1);
    }

    #[test]
    fn test_fallback_synthesizes_from_close() {
        let (mock, provider) = provider_with_mock();
        let sym = Symbol::from("BTC/USDT");
        mock.set_bars(&sym, "1m", vec![bar(0, dec!(200))]);
        provider.fetch_ohlcv(&sym, "1m", 10, true).unwrap();

        // No ticker scripted: live fetch fails, fallback kicks in
        let ticker = provider.get_ticker(&sym, false).unwrap();
        assert!(ticker.degraded);
        assert_eq!(ticker.last, dec!(200));
        assert!(ticker.bid < dec!(200) && ticker.ask > dec!(200));
        // 0.1% assumed spread => ask - bid = 0.2
        assert_eq!(ticker.ask - ticker.bid, dec!(0.2));
    }

    #[test]
    fn test_circuit_breaker_short_circuits() {
        let (mock, provider) = provider_with_mock();
        let sym = Symbol::from("BTC/USDT");
        // 5 consecutive failures open the breaker
        for _ in 0..5 {
            assert!(provider.get_ticker(&sym, false).is_none());
        }
        let calls_before = mock.call_count("fetch_ticker");
        // Breaker open: no further client calls
        let _ = provider.get_ticker(&sym, false);
        assert_eq!(mock.call_count("fetch_ticker"), calls_before);
    }

    #[test]
    fn test_get_price_fallback_order() {
        let (mock, provider) = provider_with_mock();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker(Ticker {
            symbol: sym.clone(),
            last: Decimal::ZERO,
            bid: dec!(99),
            ask: dec!(101),
            volume: dec!(1),
            timestamp_ms: 0,
            high_24h: None,
            low_24h: None,
            change_pct_24h: None,
            degraded: false,
        });
        // last is zero -> ask preferred
        assert_eq!(provider.get_price(&sym, false), Some(dec!(101)));
    }

    #[test]
    fn test_update_market_data_reports_per_symbol() {
        let (mock, provider) = provider_with_mock();
        let good = Symbol::from("BTC/USDT");
        let bad = Symbol::from("GONE/USDT");
        mock.set_ticker_prices(&good, dec!(100), dec!(99.9), dec!(100.1));

        let result = provider.update_market_data(&[good.clone(), bad.clone()]);
        assert_eq!(result.get(&good), Some(&true));
        assert_eq!(result.get(&bad), Some(&false));
    }
}
