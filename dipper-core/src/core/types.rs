//! Core market and order types
//!
//! Everything that touches an order is carried as `rust_decimal::Decimal`.
//! Floats only appear at the telemetry boundary (logging, metrics), never in
//! sizing or price arithmetic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading symbol, e.g. `"BTC/USDT"`.
///
/// Newtype over `String` so symbols can't be confused with other identifiers
/// (client order ids, decision ids) at API boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset of a `BASE/QUOTE` pair, if the symbol is pair-shaped.
    pub fn base(&self) -> Option<&str> {
        self.0.split('/').next()
    }

    /// Quote asset of a `BASE/QUOTE` pair, if the symbol is pair-shaped.
    pub fn quote(&self) -> Option<&str> {
        let mut parts = self.0.split('/');
        parts.next()?;
        parts.next()
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till canceled
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange filters for one market, loaded once at startup.
///
/// Treated as immutable between explicit `load_markets(reload=true)` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Minimum price increment
    pub price_tick: Decimal,
    /// Minimum quantity increment
    pub quantity_step: Decimal,
    /// Smallest order quantity accepted
    pub min_quantity: Decimal,
    /// Floor on `price * quantity` per order
    pub min_notional: Decimal,
}

impl MarketInfo {
    /// Permissive filters for tests and paper trading.
    pub fn unrestricted() -> Self {
        Self {
            price_tick: Decimal::ZERO,
            quantity_step: Decimal::ZERO,
            min_quantity: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        }
    }
}

/// Level-1 ticker as fetched from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub high_24h: Option<Decimal>,
    #[serde(default)]
    pub low_24h: Option<Decimal>,
    #[serde(default)]
    pub change_pct_24h: Option<Decimal>,
    /// True when bid/ask were synthesized from stale data (fallback path).
    #[serde(default)]
    pub degraded: bool,
}

impl Ticker {
    /// `(ask - bid) / bid * 10_000`, None when the book side is unusable.
    pub fn spread_bps(&self) -> Option<Decimal> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return None;
        }
        Some((self.ask - self.bid) / self.bid * Decimal::from(10_000))
    }

    pub fn mid(&self) -> Option<Decimal> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return None;
        }
        Some((self.bid + self.ask) / Decimal::from(2))
    }

    /// A ticker is valid only if `bid > 0 && ask > 0 && ask >= bid`.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn body_size(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// Order book levels as `(price, quantity)` pairs, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp_ms: i64,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(px, _)| *px)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(px, _)| *px)
    }

    pub fn spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if bid <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / bid * Decimal::from(10_000))
    }
}

// ============================================================================
// Directional rounding
// ============================================================================

/// Round `value` down to a multiple of `step`. A zero step passes through.
///
/// SELL quantities are floored: never sell more than inventory holds.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Round `value` up to a multiple of `step`. A zero step passes through.
///
/// BUY quantities derived from a quote budget are ceiled where needed to
/// clear min-notional.
pub fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

/// Round a price down to a multiple of `tick`.
pub fn round_price_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    floor_to_step(price, tick)
}

/// Why a proposed order size was rejected before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizingError {
    PriceZeroOrNegative,
    QtyRoundedToZero,
    BelowMinNotional,
}

impl SizingError {
    /// Reason string used in decision events.
    pub fn reason(&self) -> &'static str {
        match self {
            SizingError::PriceZeroOrNegative => "price_zero_or_negative",
            SizingError::QtyRoundedToZero => "qty_rounded_to_zero",
            SizingError::BelowMinNotional => "below_min_notional",
        }
    }
}

/// Size a BUY from a quote budget against the market's filters.
///
/// The quantity is floored to the step; when the floored notional misses
/// min-notional (or min-quantity) the quantity is ceiled back up, but never
/// past the budget.
pub fn size_buy_from_quote(
    quote_budget: Decimal,
    price: Decimal,
    market: &MarketInfo,
) -> Result<Decimal, SizingError> {
    if price <= Decimal::ZERO {
        return Err(SizingError::PriceZeroOrNegative);
    }

    let mut qty = floor_to_step(quote_budget / price, market.quantity_step);
    if qty <= Decimal::ZERO {
        return Err(SizingError::QtyRoundedToZero);
    }

    if market.min_notional > Decimal::ZERO && qty * price < market.min_notional {
        qty = ceil_to_step(market.min_notional / price, market.quantity_step);
    }
    if market.min_quantity > Decimal::ZERO && qty < market.min_quantity {
        qty = ceil_to_step(market.min_quantity, market.quantity_step);
    }

    if qty * price > quote_budget {
        return Err(SizingError::BelowMinNotional);
    }
    Ok(qty)
}
