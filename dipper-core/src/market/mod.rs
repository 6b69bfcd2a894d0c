//! Market data: ticker cache, OHLCV history, anchors, degraded fallback.

pub mod anchor;
pub mod cache;
pub mod health;
pub mod history;
pub mod provider;

pub use anchor::{AnchorConfig, AnchorManager, AnchorMode, AnchorRecord};
pub use cache::{CacheStats, TickerCache};
pub use health::{CircuitState, HealthConfig, SymbolHealth};
pub use history::OhlcvHistory;
pub use provider::{MarketDataConfig, MarketDataProvider};

use crate::core::types::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Point-in-time view of one symbol published on `drop.snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub version: u32,
    pub symbol: Symbol,
    pub price: SnapshotPrice,
    pub windows: SnapshotWindows,
    pub liquidity: SnapshotLiquidity,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPrice {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWindows {
    pub anchor: Option<Decimal>,
    pub peak: Option<Decimal>,
    pub drop_pct: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLiquidity {
    pub spread_pct: Option<Decimal>,
}

impl MarketSnapshot {
    pub const VERSION: u32 = 1;
}
