//! RPC tracing decorator
//!
//! Wraps any client and records per-operation call counts, failure counts,
//! and last latency. Debug-level log line per RPC; the periodic performance
//! summary drains the counters.

use crate::core::errors::ExchangeError;
use crate::core::types::{Bar, MarketInfo, OrderBook, Symbol, Ticker};
use crate::exchange::client::{
    Balance, ExchangeClient, ExchangeOrder, OrderRequest, TradeRecord,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpStats {
    pub calls: u64,
    pub failures: u64,
    pub last_latency_ms: u64,
    pub total_latency_ms: u64,
}

pub struct TracedClient<X> {
    inner: X,
    stats: DashMap<&'static str, OpStats>,
}

impl<X: ExchangeClient> TracedClient<X> {
    pub fn new(inner: X) -> Self {
        Self {
            inner,
            stats: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &X {
        &self.inner
    }

    /// Snapshot of per-operation stats for the performance summary.
    pub fn stats(&self) -> HashMap<&'static str, OpStats> {
        self.stats.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    fn traced<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&X) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        let started = Instant::now();
        let result = f(&self.inner);
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut entry = self.stats.entry(op).or_default();
        entry.calls += 1;
        entry.last_latency_ms = latency_ms;
        entry.total_latency_ms += latency_ms;
        if result.is_err() {
            entry.failures += 1;
        }
        drop(entry);

        match &result {
            Ok(_) => debug!(op, latency_ms, "rpc ok"),
            Err(e) => debug!(op, latency_ms, kind = e.kind(), "rpc failed"),
        }
        result
    }
}

impl<X: ExchangeClient> ExchangeClient for TracedClient<X> {
    fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExchangeError> {
        self.traced("fetch_ticker", |x| x.fetch_ticker(symbol))
    }

    fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
        since_ms: Option<i64>,
    ) -> Result<Vec<Bar>, ExchangeError> {
        self.traced("fetch_ohlcv", |x| {
            x.fetch_ohlcv(symbol, timeframe, limit, since_ms)
        })
    }

    fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> Result<OrderBook, ExchangeError> {
        self.traced("fetch_order_book", |x| x.fetch_order_book(symbol, depth))
    }

    fn create_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        self.traced("create_order", |x| x.create_order(request))
    }

    fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        self.traced("cancel_order", |x| x.cancel_order(order_id, symbol))
    }

    fn fetch_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        self.traced("fetch_order", |x| x.fetch_order(order_id, symbol))
    }

    fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError> {
        self.traced("fetch_order_by_client_id", |x| {
            x.fetch_order_by_client_id(client_order_id, symbol)
        })
    }

    fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.traced("fetch_open_orders", |x| x.fetch_open_orders(symbol))
    }

    fn fetch_my_trades(
        &self,
        symbol: &Symbol,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, ExchangeError> {
        self.traced("fetch_my_trades", |x| {
            x.fetch_my_trades(symbol, since_ms, limit)
        })
    }

    fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        self.traced("fetch_balance", |x| x.fetch_balance())
    }

    fn load_markets(&self, reload: bool) -> Result<HashMap<Symbol, MarketInfo>, ExchangeError> {
        self.traced("load_markets", |x| x.load_markets(reload))
    }

    fn resync_clock(&self) -> Result<(), ExchangeError> {
        self.traced("resync_clock", |x| x.resync_clock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counts_calls_and_failures() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));

        let traced = TracedClient::new(mock);
        traced.fetch_ticker(&sym).unwrap();
        traced.fetch_ticker(&Symbol::from("NOPE/USDT")).unwrap_err();

        let stats = traced.stats();
        let op = stats.get("fetch_ticker").unwrap();
        assert_eq!(op.calls, 2);
        assert_eq!(op.failures, 1);
    }
}
