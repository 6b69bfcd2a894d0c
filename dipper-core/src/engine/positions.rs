//! Open positions
//!
//! A position is created on the first buy fill for a symbol, mutated only by
//! the fill handler and the trailing-stop updater, and destroyed on a fully
//! filled exit. The engine thread owns the map; external readers get cloned
//! snapshots.

use crate::core::types::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time_s: i64,
    pub entry_fee_per_unit: Decimal,
    #[serde(default)]
    pub active_exit_order_id: Option<String>,
    pub peak_price_since_entry: Decimal,
    pub enable_trailing: bool,
    pub signal_reason: String,
}

impl Position {
    pub fn open(
        symbol: Symbol,
        quantity: Decimal,
        entry_price: Decimal,
        entry_time_s: i64,
        entry_fee_per_unit: Decimal,
        enable_trailing: bool,
        signal_reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            quantity,
            entry_price,
            entry_time_s,
            entry_fee_per_unit,
            active_exit_order_id: None,
            peak_price_since_entry: entry_price,
            enable_trailing,
            signal_reason: signal_reason.into(),
        }
    }

    /// Raise the high-water mark; returns true when a new peak was set.
    pub fn update_peak(&mut self, price: Decimal) -> bool {
        if price > self.peak_price_since_entry {
            self.peak_price_since_entry = price;
            true
        } else {
            false
        }
    }

    pub fn notional_at(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    pub fn held_for_s(&self, now_s: i64) -> i64 {
        (now_s - self.entry_time_s).max(0)
    }
}

/// Engine-owned position map with snapshot reads.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PositionBook {
    positions: HashMap<Symbol, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn remove(&mut self, symbol: &Symbol) -> Option<Position> {
        self.positions.remove(symbol)
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.positions.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Position)> {
        self.positions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Symbol, &mut Position)> {
        self.positions.iter_mut()
    }

    /// Copy for external readers and persistence.
    pub fn snapshot(&self) -> HashMap<Symbol, Position> {
        self.positions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_peak_only_rises() {
        let mut p = Position::open(
            Symbol::from("BTC/USDT"),
            dec!(0.1),
            dec!(100),
            0,
            dec!(0.01),
            true,
            "drop_trigger",
        );
        assert_eq!(p.peak_price_since_entry, dec!(100));
        assert!(p.update_peak(dec!(105)));
        assert!(!p.update_peak(dec!(101)));
        assert_eq!(p.peak_price_since_entry, dec!(105));
    }

    #[test]
    fn test_book_round_trip() {
        let mut book = PositionBook::new();
        let sym = Symbol::from("ETH/USDT");
        book.insert(Position::open(
            sym.clone(),
            dec!(1),
            dec!(2000),
            10,
            Decimal::ZERO,
            false,
            "manual",
        ));
        assert!(book.contains(&sym));

        let json = serde_json::to_string(&book).unwrap();
        let back: PositionBook = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&sym).unwrap().entry_price, dec!(2000));
    }
}
