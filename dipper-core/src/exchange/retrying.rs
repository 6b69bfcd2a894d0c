//! Retry / timeout / serialization decorator
//!
//! All venue RPCs flow through one decorator that owns the HTTP mutex
//! (the underlying transport is not thread-safe), the per-call deadline, the
//! retry budget, and the clock-skew resync. Every attempt runs on a bounded
//! worker thread; an attempt that overshoots `call_timeout` is abandoned and
//! reported as a network error, so a hung transport can never wedge the
//! engine. Retries apply only to transient failures; filter violations and
//! duplicates surface immediately.

use crate::core::errors::ExchangeError;
use crate::core::types::{Bar, MarketInfo, OrderBook, Symbol, Ticker};
use crate::exchange::client::{
    Balance, ExchangeClient, ExchangeOrder, OrderRequest, TradeRecord, WireOrderStatus,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry policy for transient venue failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, first try included
    pub max_attempts: usize,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Wall-clock budget across all attempts of one call
    pub total_budget: Duration,
    /// Hard per-call deadline; an attempt past this is abandoned and
    /// reported as a network error
    pub call_timeout: Duration,
    /// Randomization around each delay (0.1 = +/-10%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
            total_budget: Duration::from_secs(5),
            call_timeout: Duration::from_secs(7),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Fast retries for tests.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            total_budget: Duration::from_millis(200),
            call_timeout: Duration::from_secs(1),
            jitter_factor: 0.0,
        }
    }
}

type Op<X, T> = Arc<dyn Fn(&X) -> Result<T, ExchangeError> + Send + Sync>;

/// Decorator adding per-call deadlines, retry, backoff, clock-skew resync,
/// idempotent cancel, and HTTP serialization to any [`ExchangeClient`].
pub struct RetryingClient<X> {
    inner: Arc<X>,
    config: RetryConfig,
    /// Serializes every HTTP-bearing call; the only lock held during I/O.
    http_mutex: Mutex<()>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<X: ExchangeClient + 'static> RetryingClient<X> {
    pub fn new(inner: X, config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config,
            http_mutex: Mutex::new(()),
            shutdown: None,
        }
    }

    /// Observe a shutdown flag: once set, calls fail fast with a synthetic
    /// network error instead of burning the retry budget.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn inner(&self) -> &X {
        &self.inner
    }

    fn shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = self.config.jitter_factor;
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        delay.mul_f64(factor.max(0.0))
    }

    /// One attempt on a worker thread, bounded by the per-call deadline.
    ///
    /// On overshoot the worker is abandoned (its late result lands in a
    /// closed channel and is dropped) and the attempt reports a network
    /// error. The deadline wins over strict transport serialization: an
    /// abandoned worker may still be draining its socket while the next
    /// attempt starts.
    fn dispatch<T: Send + 'static>(
        &self,
        op_name: &'static str,
        op: &Op<X, T>,
    ) -> Result<T, ExchangeError> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let inner = self.inner.clone();
        let op = op.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("rpc-{op_name}"))
            .spawn(move || {
                let _ = tx.send(op(&inner));
            });
        if spawned.is_err() {
            return Err(ExchangeError::Network(format!(
                "{op_name}: rpc worker spawn failed"
            )));
        }
        match rx.recv_timeout(self.config.call_timeout) {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op = op_name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "call deadline overshot, worker abandoned"
                );
                Err(ExchangeError::Network(format!(
                    "{op_name}: call timeout after {:?}",
                    self.config.call_timeout
                )))
            }
        }
    }

    /// Run `op` under the HTTP mutex with a deadline per attempt and bounded
    /// retries across attempts.
    fn with_retry<T: Send + 'static>(
        &self,
        op_name: &'static str,
        op: impl Fn(&X) -> Result<T, ExchangeError> + Send + Sync + 'static,
    ) -> Result<T, ExchangeError> {
        let op: Op<X, T> = Arc::new(op);
        let _http = self.http_mutex.lock();
        let started = Instant::now();
        let mut delay = self.config.base_delay;
        let mut resynced = false;

        for attempt in 1..=self.config.max_attempts {
            if self.shutting_down() {
                return Err(ExchangeError::Network("shutdown in progress".to_string()));
            }

            match self.dispatch(op_name, &op) {
                Ok(value) => return Ok(value),
                Err(ExchangeError::ClockSkew(msg)) if !resynced => {
                    // One resync, then an immediate retry that does not
                    // consume backoff budget.
                    warn!(op = op_name, %msg, "clock skew, resyncing server time");
                    self.inner.resync_clock()?;
                    resynced = true;
                    continue;
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let hint = match &err {
                        ExchangeError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Some(Duration::from_millis(*ms)),
                        _ => None,
                    };
                    let sleep = hint.unwrap_or_else(|| self.jittered(delay)).min(self.config.max_delay);
                    if started.elapsed() + sleep > self.config.total_budget {
                        debug!(op = op_name, attempt, "retry budget exhausted");
                        return Err(err);
                    }
                    debug!(op = op_name, attempt, delay_ms = sleep.as_millis() as u64, kind = err.kind(), "retrying");
                    std::thread::sleep(sleep);
                    delay = (delay * 2).min(self.config.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ExchangeError::Network(format!(
            "{op_name}: attempts exhausted"
        )))
    }
}

impl<X: ExchangeClient + 'static> ExchangeClient for RetryingClient<X> {
    fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExchangeError> {
        let symbol = symbol.clone();
        self.with_retry("fetch_ticker", move |x| x.fetch_ticker(&symbol))
    }

    fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
        since_ms: Option<i64>,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let symbol = symbol.clone();
        let timeframe = timeframe.to_string();
        self.with_retry("fetch_ohlcv", move |x| {
            x.fetch_ohlcv(&symbol, &timeframe, limit, since_ms)
        })
    }

    fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> Result<OrderBook, ExchangeError> {
        let symbol = symbol.clone();
        self.with_retry("fetch_order_book", move |x| x.fetch_order_book(&symbol, depth))
    }

    fn create_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let request = request.clone();
        self.with_retry("create_order", move |x| x.create_order(&request))
    }

    /// Idempotent cancel: an order the venue no longer knows counts as
    /// canceled and yields a synthetic record.
    fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        let id = order_id.to_string();
        let sym = symbol.clone();
        let result = self.with_retry("cancel_order", move |x| x.cancel_order(&id, &sym));
        match result {
            Err(ExchangeError::OrderNotFound(_)) => Ok(ExchangeOrder {
                order_id: order_id.to_string(),
                client_order_id: String::new(),
                symbol: symbol.clone(),
                side: crate::core::types::Side::Sell,
                order_type: crate::core::types::OrderType::Limit,
                status: WireOrderStatus::Canceled,
                price: None,
                qty: rust_decimal::Decimal::ZERO,
                filled: rust_decimal::Decimal::ZERO,
                remaining: rust_decimal::Decimal::ZERO,
                average_price: None,
                fee_quote: rust_decimal::Decimal::ZERO,
                timestamp_ms: crate::core::clock::now_ms(),
            }),
            other => other,
        }
    }

    fn fetch_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError> {
        let id = order_id.to_string();
        let symbol = symbol.clone();
        self.with_retry("fetch_order", move |x| x.fetch_order(&id, &symbol))
    }

    fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let coid = client_order_id.to_string();
        let symbol = symbol.clone();
        self.with_retry("fetch_order_by_client_id", move |x| {
            x.fetch_order_by_client_id(&coid, &symbol)
        })
    }

    fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let symbol = symbol.clone();
        self.with_retry("fetch_open_orders", move |x| x.fetch_open_orders(&symbol))
    }

    fn fetch_my_trades(
        &self,
        symbol: &Symbol,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, ExchangeError> {
        let symbol = symbol.clone();
        self.with_retry("fetch_my_trades", move |x| {
            x.fetch_my_trades(&symbol, since_ms, limit)
        })
    }

    fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        self.with_retry("fetch_balance", move |x| x.fetch_balance())
    }

    fn load_markets(&self, reload: bool) -> Result<HashMap<Symbol, MarketInfo>, ExchangeError> {
        self.with_retry("load_markets", move |x| x.load_markets(reload))
    }

    fn resync_clock(&self) -> Result<(), ExchangeError> {
        self.inner.resync_clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retries_transient_then_succeeds() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));
        mock.fail_next(
            "fetch_ticker",
            vec![
                ExchangeError::Network("reset".into()),
                ExchangeError::Network("reset".into()),
            ],
        );

        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        let t = client.fetch_ticker(&sym).unwrap();
        assert_eq!(t.last, dec!(100));
    }

    #[test]
    fn test_does_not_retry_invalid_request() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));
        mock.fail_next(
            "fetch_ticker",
            vec![ExchangeError::InvalidRequest("bad tif".into())],
        );

        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        let err = client.fetch_ticker(&sym).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidRequest(_)));
        // The scripted failure was consumed on the single attempt
        assert_eq!(client.inner().call_count("fetch_ticker"), 1);
    }

    #[test]
    fn test_attempts_exhausted_surfaces_error() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.fail_next(
            "fetch_ticker",
            vec![
                ExchangeError::Network("a".into()),
                ExchangeError::Network("b".into()),
                ExchangeError::Network("c".into()),
                ExchangeError::Network("d".into()),
            ],
        );

        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        assert!(client.fetch_ticker(&sym).is_err());
    }

    #[test]
    fn test_cancel_not_found_is_success() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        let order = client.cancel_order("missing-id", &sym).unwrap();
        assert_eq!(order.status, WireOrderStatus::Canceled);
        assert_eq!(order.order_id, "missing-id");
    }

    #[test]
    fn test_clock_skew_resyncs_once() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));
        mock.fail_next(
            "fetch_ticker",
            vec![ExchangeError::ClockSkew("recvWindow".into())],
        );

        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        assert!(client.fetch_ticker(&sym).is_ok());
        assert_eq!(client.inner().resync_count(), 1);
    }

    #[test]
    fn test_shutdown_fails_fast() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));

        let flag = Arc::new(AtomicBool::new(true));
        let client = RetryingClient::new(mock, RetryConfig::aggressive()).with_shutdown_flag(flag);
        let err = client.fetch_ticker(&sym).unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));
        assert_eq!(client.inner().call_count("fetch_ticker"), 0);
    }

    #[test]
    fn test_call_timeout_aborts_hung_transport() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));
        // Transport hangs for far longer than the deadline
        mock.set_call_delay("fetch_ticker", Duration::from_millis(200));

        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            total_budget: Duration::from_millis(500),
            call_timeout: Duration::from_millis(30),
            jitter_factor: 0.0,
        };
        let client = RetryingClient::new(mock, config);

        let started = Instant::now();
        let err = client.fetch_ticker(&sym).unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));
        // Both attempts abort at the deadline instead of waiting out the
        // 200ms transport hang twice
        assert!(started.elapsed() < Duration::from_millis(380));

        // Attempt accounting still applies: the abandoned workers reach the
        // mock once per attempt
        std::thread::sleep(Duration::from_millis(450));
        assert_eq!(client.inner().call_count("fetch_ticker"), 2);
    }

    #[test]
    fn test_slow_call_inside_deadline_succeeds() {
        let mock = MockExchange::new();
        let sym = Symbol::from("BTC/USDT");
        mock.set_ticker_prices(&sym, dec!(100), dec!(99.9), dec!(100.1));
        mock.set_call_delay("fetch_ticker", Duration::from_millis(20));

        let client = RetryingClient::new(mock, RetryConfig::aggressive());
        let t = client.fetch_ticker(&sym).unwrap();
        assert_eq!(t.last, dec!(100));
        assert_eq!(client.inner().call_count("fetch_ticker"), 1);
    }
}
