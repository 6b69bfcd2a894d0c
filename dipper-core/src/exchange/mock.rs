//! Scriptable in-memory exchange
//!
//! Backs the paper-trading binary and the test suite. Tickers, bars, books,
//! and balances are set by the harness; orders fill according to the
//! configured [`FillMode`]; failures can be queued per operation to exercise
//! the retry and recovery paths.

use crate::core::clock::now_ms;
use crate::core::errors::ExchangeError;
use crate::core::types::{Bar, MarketInfo, OrderBook, OrderType, Side, Symbol, Ticker};
use crate::exchange::client::{
    AssetBalance, Balance, ExchangeClient, ExchangeOrder, OrderRequest, TradeRecord,
    WireOrderStatus,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How the mock fills incoming orders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    /// Fill the full quantity immediately at the limit (or last) price
    Instant,
    /// Fill this fraction immediately, leave the rest open
    Partial(Decimal),
    /// Leave orders open until canceled
    None,
}

#[derive(Default)]
struct MockState {
    tickers: HashMap<Symbol, Ticker>,
    bars: HashMap<(Symbol, String), Vec<Bar>>,
    books: HashMap<Symbol, OrderBook>,
    markets: HashMap<Symbol, MarketInfo>,
    balance: Balance,
    orders: HashMap<String, ExchangeOrder>,
    trades: Vec<TradeRecord>,
    scripted_failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    call_counts: HashMap<&'static str, u64>,
    call_delays: HashMap<&'static str, Duration>,
    fill_mode: FillMode,
}

impl Default for FillMode {
    fn default() -> Self {
        FillMode::Instant
    }
}

pub struct MockExchange {
    state: Mutex<MockState>,
    order_seq: AtomicU64,
    resyncs: AtomicU64,
    /// Taker fee applied to mock fills, in basis points
    fee_bps: Decimal,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            order_seq: AtomicU64::new(1),
            resyncs: AtomicU64::new(0),
            fee_bps: Decimal::from(10),
        }
    }

    // ========================================================================
    // Scripting surface
    // ========================================================================

    pub fn set_ticker(&self, ticker: Ticker) {
        self.state.lock().tickers.insert(ticker.symbol.clone(), ticker);
    }

    pub fn set_ticker_prices(&self, symbol: &Symbol, last: Decimal, bid: Decimal, ask: Decimal) {
        self.set_ticker(Ticker {
            symbol: symbol.clone(),
            last,
            bid,
            ask,
            volume: Decimal::from(1000),
            timestamp_ms: now_ms(),
            high_24h: None,
            low_24h: None,
            change_pct_24h: None,
            degraded: false,
        });
    }

    pub fn set_bars(&self, symbol: &Symbol, timeframe: &str, bars: Vec<Bar>) {
        self.state
            .lock()
            .bars
            .insert((symbol.clone(), timeframe.to_string()), bars);
    }

    pub fn set_book(&self, book: OrderBook) {
        self.state.lock().books.insert(book.symbol.clone(), book);
    }

    pub fn set_market(&self, symbol: &Symbol, info: MarketInfo) {
        self.state.lock().markets.insert(symbol.clone(), info);
    }

    pub fn set_free_balance(&self, asset: &str, amount: Decimal) {
        self.state.lock().balance.assets.insert(
            asset.to_string(),
            AssetBalance {
                free: amount,
                used: Decimal::ZERO,
                total: amount,
            },
        );
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().fill_mode = mode;
    }

    /// Queue errors returned by the next calls to `op` (consumed in order).
    pub fn fail_next(&self, op: &'static str, errors: Vec<ExchangeError>) {
        self.state
            .lock()
            .scripted_failures
            .entry(op)
            .or_default()
            .extend(errors);
    }

    /// Make every call to `op` block for `delay` before responding,
    /// simulating a slow or hung transport.
    pub fn set_call_delay(&self, op: &'static str, delay: Duration) {
        self.state.lock().call_delays.insert(op, delay);
    }

    /// Calls that reached the venue logic (scripted failures count, fail-fast
    /// shutdown paths in decorators do not).
    pub fn call_count(&self, op: &'static str) -> u64 {
        *self.state.lock().call_counts.get(op).unwrap_or(&0)
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Externally fill an open order (paper-trading price crossing).
    pub fn fill_order(&self, order_id: &str, qty: Decimal, price: Decimal) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fee_bps = self.fee_bps;
        if let Some(order) = state.orders.get_mut(order_id) {
            let fill_qty = qty.min(order.remaining);
            if fill_qty <= Decimal::ZERO {
                return;
            }
            let prev_filled = order.filled;
            let prev_avg = order.average_price.unwrap_or(Decimal::ZERO);
            let new_filled = prev_filled + fill_qty;
            order.average_price =
                Some((prev_filled * prev_avg + fill_qty * price) / new_filled);
            order.filled = new_filled;
            order.remaining = order.qty - new_filled;
            let fee = fill_qty * price * fee_bps / Decimal::from(10_000);
            order.fee_quote += fee;
            if order.remaining <= Decimal::ZERO {
                order.status = WireOrderStatus::Closed;
            }
            let trade = TradeRecord {
                order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: fill_qty,
                price,
                fee_quote: fee,
                timestamp_ms: now_ms(),
            };
            state.trades.push(trade);
        }
    }

    /// Per-op entry point: apply any scripted transport delay (outside the
    /// state lock), count the call, then pop a scripted failure.
    fn gate(&self, op: &'static str) -> Result<(), ExchangeError> {
        let delay = self.state.lock().call_delays.get(op).copied();
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        let mut state = self.state.lock();
        *state.call_counts.entry(op).or_insert(0) += 1;
        match state
            .scripted_failures
            .get_mut(op)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ExchangeClient for MockExchange {
    fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExchangeError> {
        self.gate("fetch_ticker")?;
        let state = self.state.lock();
        state
            .tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Exchange(format!("no ticker for {symbol}")))
    }

    fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
        since_ms: Option<i64>,
    ) -> Result<Vec<Bar>, ExchangeError> {
        self.gate("fetch_ohlcv")?;
        let state = self.state.lock();
        let mut bars = state
            .bars
            .get(&(symbol.clone(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default();
        if let Some(since) = since_ms {
            bars.retain(|b| b.timestamp_ms >= since);
        }
        if bars.len() > limit {
            bars = bars.split_off(bars.len() - limit);
        }
        Ok(bars)
    }

    fn fetch_order_book(&self, symbol: &Symbol, _depth: usize) -> Result<OrderBook, ExchangeError> {
        self.gate("fetch_order_book")?;
        let state = self.state.lock();
        state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Exchange(format!("no book for {symbol}")))
    }

    fn create_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        self.gate("create_order")?;
        let mut state = self.state.lock();

        // Duplicate client order id: the venue remembers accepted ids.
        if state
            .orders
            .values()
            .any(|o| o.client_order_id == request.client_order_id)
        {
            return Err(ExchangeError::DuplicateOrder(
                request.client_order_id.clone(),
            ));
        }

        let fill_price = match request.order_type {
            OrderType::Limit => request.price.ok_or_else(|| {
                ExchangeError::InvalidRequest("limit order without price".to_string())
            })?,
            OrderType::Market => state
                .tickers
                .get(&request.symbol)
                .map(|t| t.last)
                .ok_or_else(|| {
                    ExchangeError::Exchange(format!("no ticker for {}", request.symbol))
                })?,
        };

        let order_id = format!("M{}", self.order_seq.fetch_add(1, Ordering::Relaxed));
        let (filled, status) = match state.fill_mode {
            FillMode::Instant => (request.qty, WireOrderStatus::Closed),
            FillMode::Partial(fraction) => (request.qty * fraction, WireOrderStatus::Open),
            FillMode::None => (Decimal::ZERO, WireOrderStatus::Open),
        };
        let fee = filled * fill_price * self.fee_bps / Decimal::from(10_000);

        let order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status,
            price: request.price,
            qty: request.qty,
            filled,
            remaining: request.qty - filled,
            average_price: (filled > Decimal::ZERO).then_some(fill_price),
            fee_quote: fee,
            timestamp_ms: now_ms(),
        };

        if filled > Decimal::ZERO {
            let trade = TradeRecord {
                order_id: order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                qty: filled,
                price: fill_price,
                fee_quote: fee,
                timestamp_ms: now_ms(),
            };
            state.trades.push(trade);
        }
        state.orders.insert(order_id, order.clone());
        Ok(order)
    }

    fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        self.gate("cancel_order")?;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_open() {
            order.status = WireOrderStatus::Canceled;
        }
        Ok(order.clone())
    }

    fn fetch_order(&self, order_id: &str, _symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        self.gate("fetch_order")?;
        let state = self.state.lock();
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        _symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError> {
        self.gate("fetch_order_by_client_id")?;
        let state = self.state.lock();
        state
            .orders
            .values()
            .find(|o| o.client_order_id == client_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))
    }

    fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.gate("fetch_open_orders")?;
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| &o.symbol == symbol && o.status.is_open())
            .cloned()
            .collect())
    }

    fn fetch_my_trades(
        &self,
        symbol: &Symbol,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, ExchangeError> {
        self.gate("fetch_my_trades")?;
        let state = self.state.lock();
        let mut trades: Vec<TradeRecord> = state
            .trades
            .iter()
            .filter(|t| &t.symbol == symbol)
            .filter(|t| since_ms.map(|s| t.timestamp_ms >= s).unwrap_or(true))
            .cloned()
            .collect();
        if trades.len() > limit {
            trades = trades.split_off(trades.len() - limit);
        }
        Ok(trades)
    }

    fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        self.gate("fetch_balance")?;
        Ok(self.state.lock().balance.clone())
    }

    fn load_markets(&self, _reload: bool) -> Result<HashMap<Symbol, MarketInfo>, ExchangeError> {
        self.gate("load_markets")?;
        Ok(self.state.lock().markets.clone())
    }

    fn resync_clock(&self) -> Result<(), ExchangeError> {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
