//! Confirmation stabilizer
//!
//! Counts consecutive confirming ticks per symbol; a decision is stable once
//! the count reaches the configured threshold. Any non-confirming tick
//! resets the counter.

use dipper_core::core::types::Symbol;
use std::collections::HashMap;

pub struct Stabilizer {
    need: u32,
    counts: HashMap<Symbol, u32>,
}

impl Stabilizer {
    pub fn new(confirm_ticks: u32) -> Self {
        Self {
            need: confirm_ticks.max(1),
            counts: HashMap::new(),
        }
    }

    /// Start counting from zero for a symbol.
    pub fn arm(&mut self, symbol: &Symbol) {
        self.counts.insert(symbol.clone(), 0);
    }

    /// Advance with the current condition; true once stable.
    pub fn step(&mut self, symbol: &Symbol, condition_ok: bool) -> bool {
        let count = self.counts.entry(symbol.clone()).or_insert(0);
        *count = if condition_ok { *count + 1 } else { 0 };
        *count >= self.need
    }

    pub fn count(&self, symbol: &Symbol) -> u32 {
        self.counts.get(symbol).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, symbol: Option<&Symbol>) {
        match symbol {
            Some(s) => {
                self.counts.insert(s.clone(), 0);
            }
            None => self.counts.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> Symbol {
        Symbol::from("BTC/USDT")
    }

    #[test]
    fn test_single_tick_confirms_immediately() {
        let mut s = Stabilizer::new(1);
        assert!(s.step(&sym(), true));
    }

    #[test]
    fn test_requires_consecutive_ticks() {
        let mut s = Stabilizer::new(3);
        assert!(!s.step(&sym(), true));
        assert!(!s.step(&sym(), true));
        assert!(s.step(&sym(), true));
    }

    #[test]
    fn test_failure_resets_count() {
        let mut s = Stabilizer::new(2);
        assert!(!s.step(&sym(), true));
        assert!(!s.step(&sym(), false));
        assert_eq!(s.count(&sym()), 0);
        assert!(!s.step(&sym(), true));
        assert!(s.step(&sym(), true));
    }

    #[test]
    fn test_reset_scopes() {
        let mut s = Stabilizer::new(2);
        s.step(&Symbol::from("A/USDT"), true);
        s.step(&Symbol::from("B/USDT"), true);
        s.reset(Some(&Symbol::from("A/USDT")));
        assert_eq!(s.count(&Symbol::from("A/USDT")), 0);
        assert_eq!(s.count(&Symbol::from("B/USDT")), 1);
        s.reset(None);
        assert_eq!(s.count(&Symbol::from("B/USDT")), 0);
    }
}
