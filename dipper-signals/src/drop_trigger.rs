//! Drop trigger with hysteresis and debounce
//!
//! `drop_bp = (1 - price/anchor) * 10_000`. A fire requires clearing the
//! nominal threshold plus the hysteresis band, and at least `debounce_s`
//! since the last fire for the same symbol.

use dipper_core::core::types::Symbol;
use dipper_core::engine::traits::{TriggerEval, TriggerReason};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DropTriggerConfig {
    pub threshold_bp: i64,
    pub hysteresis_bp: i64,
    pub debounce_s: i64,
}

impl Default for DropTriggerConfig {
    fn default() -> Self {
        Self {
            threshold_bp: 200,
            hysteresis_bp: 20,
            debounce_s: 15,
        }
    }
}

pub struct DropTrigger {
    config: DropTriggerConfig,
    last_fire: HashMap<Symbol, i64>,
}

impl DropTrigger {
    pub fn new(config: DropTriggerConfig) -> Self {
        Self {
            config,
            last_fire: HashMap::new(),
        }
    }

    pub fn evaluate(
        &mut self,
        symbol: &Symbol,
        price: Decimal,
        anchor: Option<Decimal>,
        now: i64,
    ) -> TriggerEval {
        let anchor = match anchor {
            Some(a) if a > Decimal::ZERO => a,
            _ => return TriggerEval::rejected(TriggerReason::NoAnchor),
        };

        let drop_bp = (Decimal::ONE - price / anchor) * Decimal::from(10_000);

        if drop_bp < Decimal::from(self.config.threshold_bp) {
            return TriggerEval {
                triggered: false,
                reason: TriggerReason::BelowThreshold,
                drop_bp: Some(drop_bp),
                anchor: Some(anchor),
            };
        }
        if drop_bp < Decimal::from(self.config.threshold_bp + self.config.hysteresis_bp) {
            return TriggerEval {
                triggered: false,
                reason: TriggerReason::NeedHysteresis,
                drop_bp: Some(drop_bp),
                anchor: Some(anchor),
            };
        }
        if let Some(last) = self.last_fire.get(symbol) {
            if now - last < self.config.debounce_s {
                return TriggerEval {
                    triggered: false,
                    reason: TriggerReason::Debounce,
                    drop_bp: Some(drop_bp),
                    anchor: Some(anchor),
                };
            }
        }

        self.last_fire.insert(symbol.clone(), now);
        TriggerEval {
            triggered: true,
            reason: TriggerReason::Fired,
            drop_bp: Some(drop_bp),
            anchor: Some(anchor),
        }
    }

    /// Drop the debounce timer, allowing an immediate re-fire.
    pub fn reset_debounce(&mut self, symbol: &Symbol) {
        self.last_fire.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trigger() -> DropTrigger {
        DropTrigger::new(DropTriggerConfig {
            threshold_bp: 200,
            hysteresis_bp: 20,
            debounce_s: 15,
        })
    }

    fn sym() -> Symbol {
        Symbol::from("BTC/USDT")
    }

    #[test]
    fn test_no_anchor() {
        let mut t = trigger();
        let eval = t.evaluate(&sym(), dec!(100), None, 0);
        assert!(!eval.triggered);
        assert_eq!(eval.reason, TriggerReason::NoAnchor);
    }

    #[test]
    fn test_below_threshold_then_hysteresis_then_fire() {
        let mut t = trigger();
        let anchor = Some(dec!(100));

        // 1% drop: below the 2% threshold
        let eval = t.evaluate(&sym(), dec!(99), anchor, 0);
        assert_eq!(eval.reason, TriggerReason::BelowThreshold);
        assert_eq!(eval.drop_bp, Some(dec!(100)));

        // 2.1% drop clears the threshold but not threshold + hysteresis
        let eval = t.evaluate(&sym(), dec!(97.9), anchor, 1);
        assert_eq!(eval.reason, TriggerReason::NeedHysteresis);

        // 2.2% drop fires
        let eval = t.evaluate(&sym(), dec!(97.8), anchor, 2);
        assert!(eval.triggered);
        assert_eq!(eval.drop_bp, Some(dec!(220)));
    }

    #[test]
    fn test_debounce_suppresses_refire() {
        let mut t = trigger();
        let anchor = Some(dec!(100));

        assert!(t.evaluate(&sym(), dec!(97), anchor, 100).triggered);
        // Inside the 15s debounce window
        let eval = t.evaluate(&sym(), dec!(96.5), anchor, 110);
        assert!(!eval.triggered);
        assert_eq!(eval.reason, TriggerReason::Debounce);
        // Past the window it may fire again
        assert!(t.evaluate(&sym(), dec!(96.5), anchor, 115).triggered);
    }

    #[test]
    fn test_debounce_is_per_symbol() {
        let mut t = trigger();
        let anchor = Some(dec!(100));
        assert!(t.evaluate(&Symbol::from("A/USDT"), dec!(97), anchor, 0).triggered);
        assert!(t.evaluate(&Symbol::from("B/USDT"), dec!(97), anchor, 1).triggered);
    }

    #[test]
    fn test_reset_debounce() {
        let mut t = trigger();
        let anchor = Some(dec!(100));
        assert!(t.evaluate(&sym(), dec!(97), anchor, 0).triggered);
        t.reset_debounce(&sym());
        assert!(t.evaluate(&sym(), dec!(97), anchor, 1).triggered);
    }
}
