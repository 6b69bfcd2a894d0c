//! PnL service
//!
//! Single source of truth for realized and unrealized PnL. Consumes the fill
//! stream, maintains a per-symbol projection (weighted-average entry with
//! fee attribution), and appends every fill to the append-only ledger.
//! Unrealized PnL is recomputed on demand and never persisted.

use crate::core::types::{Side, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// One fill as seen by the PnL service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub fee_quote: Decimal,
    pub ts: i64,
    /// Entry price linked by the caller for exit fills (telemetry only; the
    /// projection's own entry price governs realization).
    #[serde(default)]
    pub entry_price: Option<Decimal>,
}

/// Per-symbol position projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PnlPosition {
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_fee_per_unit: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlSummary {
    pub realized_pnl_net: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<(Symbol, PnlPosition)>,
}

pub struct PnlService {
    positions: Mutex<HashMap<Symbol, PnlPosition>>,
    realized_net: Mutex<Decimal>,
    ledger: Option<Mutex<BufWriter<File>>>,
    fills_applied: Mutex<u64>,
}

impl PnlService {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            realized_net: Mutex::new(Decimal::ZERO),
            ledger: None,
            fills_applied: Mutex::new(0),
        }
    }

    /// Attach the append-only JSONL ledger.
    pub fn with_ledger(mut self, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.ledger = Some(Mutex::new(BufWriter::new(file)));
        Ok(self)
    }

    /// Apply one fill to the projection and the ledger.
    pub fn apply_fill(&self, event: &FillEvent) {
        if event.qty <= Decimal::ZERO {
            debug!(symbol = %event.symbol, "ignoring non-positive fill");
            return;
        }

        self.append_ledger(event);
        *self.fills_applied.lock() += 1;

        let mut positions = self.positions.lock();
        match event.side {
            Side::Buy => {
                let entry = positions.entry(event.symbol.clone()).or_insert(PnlPosition {
                    qty: Decimal::ZERO,
                    entry_price: Decimal::ZERO,
                    entry_fee_per_unit: Decimal::ZERO,
                });
                let new_qty = entry.qty + event.qty;
                entry.entry_price =
                    (entry.qty * entry.entry_price + event.qty * event.avg_price) / new_qty;
                entry.entry_fee_per_unit =
                    (entry.qty * entry.entry_fee_per_unit + event.fee_quote) / new_qty;
                entry.qty = new_qty;
                debug!(
                    symbol = %event.symbol,
                    qty = %entry.qty,
                    entry = %entry.entry_price,
                    "buy fill applied"
                );
            }
            Side::Sell => {
                let Some(entry) = positions.get_mut(&event.symbol) else {
                    warn!(symbol = %event.symbol, "sell fill without position state");
                    return;
                };
                let qty = event.qty.min(entry.qty);
                if event.qty > entry.qty {
                    warn!(
                        symbol = %event.symbol,
                        fill = %event.qty,
                        held = %entry.qty,
                        "sell fill exceeds tracked quantity, clamped"
                    );
                }
                let gross = qty * (event.avg_price - entry.entry_price);
                let entry_fees = qty * entry.entry_fee_per_unit;
                let realized = gross - event.fee_quote - entry_fees;
                *self.realized_net.lock() += realized;

                entry.qty -= qty;
                info!(
                    symbol = %event.symbol,
                    qty = %qty,
                    realized = %realized,
                    remaining = %entry.qty,
                    "sell fill realized"
                );
                if entry.qty <= Decimal::ZERO {
                    positions.remove(&event.symbol);
                }
            }
        }
    }

    fn append_ledger(&self, event: &FillEvent) {
        let Some(ledger) = &self.ledger else { return };
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "ledger serialization failed");
                return;
            }
        };
        let mut writer = ledger.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(error = %e, "ledger write failed");
        }
    }

    /// Pure function of the projection and the current price.
    pub fn unrealized(&self, symbol: &Symbol, current_price: Decimal) -> Option<Decimal> {
        let positions = self.positions.lock();
        let state = positions.get(symbol)?;
        Some(state.qty * (current_price - state.entry_price) - state.qty * state.entry_fee_per_unit)
    }

    pub fn position(&self, symbol: &Symbol) -> Option<PnlPosition> {
        self.positions.lock().get(symbol).copied()
    }

    pub fn realized_net(&self) -> Decimal {
        *self.realized_net.lock()
    }

    pub fn fills_applied(&self) -> u64 {
        *self.fills_applied.lock()
    }

    pub fn summary(&self, current_prices: &HashMap<Symbol, Decimal>) -> PnlSummary {
        let positions = self.positions.lock();
        let mut unrealized = Decimal::ZERO;
        for (symbol, state) in positions.iter() {
            if let Some(price) = current_prices.get(symbol) {
                unrealized +=
                    state.qty * (*price - state.entry_price) - state.qty * state.entry_fee_per_unit;
            }
        }
        PnlSummary {
            realized_pnl_net: *self.realized_net.lock(),
            unrealized_pnl: unrealized,
            positions: positions.iter().map(|(s, p)| (s.clone(), *p)).collect(),
        }
    }
}

impl Default for PnlService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(symbol: &str, qty: Decimal, price: Decimal, fee: Decimal) -> FillEvent {
        FillEvent {
            symbol: Symbol::from(symbol),
            side: Side::Buy,
            qty,
            avg_price: price,
            fee_quote: fee,
            ts: 0,
            entry_price: None,
        }
    }

    fn sell(symbol: &str, qty: Decimal, price: Decimal, fee: Decimal) -> FillEvent {
        FillEvent {
            symbol: Symbol::from(symbol),
            side: Side::Sell,
            qty,
            avg_price: price,
            fee_quote: fee,
            ts: 0,
            entry_price: None,
        }
    }

    #[test]
    fn test_weighted_entry_and_fee_per_unit() {
        let pnl = PnlService::new();
        pnl.apply_fill(&buy("BTC/USDT", dec!(0.1), dec!(50000), dec!(5)));
        pnl.apply_fill(&buy("BTC/USDT", dec!(0.1), dec!(51000), dec!(5)));

        let pos = pnl.position(&Symbol::from("BTC/USDT")).unwrap();
        assert_eq!(pos.qty, dec!(0.2));
        assert_eq!(pos.entry_price, dec!(50500));
        assert_eq!(pos.entry_fee_per_unit, dec!(50)); // 10 quote fee / 0.2
    }

    #[test]
    fn test_realized_with_fee_attribution() {
        let pnl = PnlService::new();
        pnl.apply_fill(&buy("BTC/USDT", dec!(1), dec!(100), dec!(1)));
        pnl.apply_fill(&sell("BTC/USDT", dec!(1), dec!(110), dec!(1.1)));

        // gross 10, sell fee 1.1, entry fee 1 => 7.9
        assert_eq!(pnl.realized_net(), dec!(7.9));
        assert!(pnl.position(&Symbol::from("BTC/USDT")).is_none());
    }

    #[test]
    fn test_partial_sell_keeps_entry() {
        let pnl = PnlService::new();
        pnl.apply_fill(&buy("ETH/USDT", dec!(2), dec!(1000), dec!(2)));
        pnl.apply_fill(&sell("ETH/USDT", dec!(0.5), dec!(1100), dec!(0.55)));

        let pos = pnl.position(&Symbol::from("ETH/USDT")).unwrap();
        assert_eq!(pos.qty, dec!(1.5));
        assert_eq!(pos.entry_price, dec!(1000));
        // gross 50 - fee 0.55 - entry fees 0.5 = 48.95
        assert_eq!(pnl.realized_net(), dec!(48.95));
    }

    #[test]
    fn test_unrealized_recomputed_on_demand() {
        let pnl = PnlService::new();
        pnl.apply_fill(&buy("ETH/USDT", dec!(2), dec!(1000), dec!(2)));
        let sym = Symbol::from("ETH/USDT");
        // 2 * (1050 - 1000) - 2 * 1 = 98
        assert_eq!(pnl.unrealized(&sym, dec!(1050)).unwrap(), dec!(98));
        assert_eq!(pnl.unrealized(&sym, dec!(1000)).unwrap(), dec!(-2));
    }

    #[test]
    fn test_oversell_clamped() {
        let pnl = PnlService::new();
        pnl.apply_fill(&buy("X/USDT", dec!(1), dec!(10), Decimal::ZERO));
        pnl.apply_fill(&sell("X/USDT", dec!(2), dec!(12), Decimal::ZERO));
        // Only the held quantity realizes
        assert_eq!(pnl.realized_net(), dec!(2));
        assert!(pnl.position(&Symbol::from("X/USDT")).is_none());
    }

    #[test]
    fn test_ledger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pnl_ledger.jsonl");
        let pnl = PnlService::new().with_ledger(&path).unwrap();
        pnl.apply_fill(&buy("BTC/USDT", dec!(1), dec!(100), dec!(0.1)));
        pnl.apply_fill(&sell("BTC/USDT", dec!(1), dec!(101), dec!(0.1)));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: FillEvent = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.side, Side::Buy);
    }
}
