//! Exchange client capability
//!
//! One trait stands in for the venue. The live REST adapter is injected by
//! the binary; the crate ships the retry/timeout decorator, the tracing
//! decorator, and a scriptable mock. Everything above this seam is
//! venue-agnostic.

use crate::core::errors::ExchangeError;
use crate::core::types::{Bar, MarketInfo, OrderBook, OrderType, Side, Symbol, Ticker, TimeInForce};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Order submission parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub order_type: OrderType,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub tif: TimeInForce,
    pub post_only: bool,
    pub client_order_id: String,
}

/// Venue-side order status as reported by the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
}

impl WireOrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, WireOrderStatus::Open)
    }
}

/// Order record as returned by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: WireOrderStatus,
    pub price: Option<Decimal>,
    pub qty: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub average_price: Option<Decimal>,
    pub fee_quote: Decimal,
    pub timestamp_ms: i64,
}

/// One executed trade belonging to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee_quote: Decimal,
    pub timestamp_ms: i64,
}

/// Per-asset balance triple.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// Full account balance keyed by asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub assets: HashMap<String, AssetBalance>,
}

impl Balance {
    pub fn free(&self, asset: &str) -> Decimal {
        self.assets.get(asset).map(|a| a.free).unwrap_or_default()
    }

    pub fn total(&self, asset: &str) -> Decimal {
        self.assets.get(asset).map(|a| a.total).unwrap_or_default()
    }
}

/// Blocking exchange capability.
///
/// Implementations surface [`ExchangeError`] kinds instead of stringly-typed
/// failures; the retry decorator branches on `is_retryable()`.
pub trait ExchangeClient: Send + Sync {
    fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExchangeError>;

    fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
        since_ms: Option<i64>,
    ) -> Result<Vec<Bar>, ExchangeError>;

    fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> Result<OrderBook, ExchangeError>;

    fn create_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError>;

    /// Cancel by venue order id. Implementations report
    /// [`ExchangeError::OrderNotFound`] as-is; the retry decorator maps it to
    /// an idempotent success.
    fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError>;

    fn fetch_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder, ExchangeError>;

    fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError>;

    fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    fn fetch_my_trades(
        &self,
        symbol: &Symbol,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, ExchangeError>;

    fn fetch_balance(&self) -> Result<Balance, ExchangeError>;

    fn load_markets(&self, reload: bool) -> Result<HashMap<Symbol, MarketInfo>, ExchangeError>;

    /// Resynchronize the client's clock with the venue after a
    /// [`ExchangeError::ClockSkew`]. Default is a no-op for venues without
    /// signed timestamps.
    fn resync_clock(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
