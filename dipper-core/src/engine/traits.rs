//! Capability traits the engine composes over
//!
//! The engine is generic over the buy-signal pipeline and the entry-guard
//! stack; concrete implementations live in `dipper-signals`. Everything here
//! is plain data in and out so implementations stay testable without an
//! exchange.

use crate::core::types::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why a trigger evaluation did or did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    NoAnchor,
    BelowThreshold,
    NeedHysteresis,
    Debounce,
    Fired,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::NoAnchor => "no_anchor",
            TriggerReason::BelowThreshold => "below_threshold",
            TriggerReason::NeedHysteresis => "need_hysteresis",
            TriggerReason::Debounce => "debounce",
            TriggerReason::Fired => "fired",
        }
    }
}

/// Outcome of one drop-trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerEval {
    pub triggered: bool,
    pub reason: TriggerReason,
    pub drop_bp: Option<Decimal>,
    pub anchor: Option<Decimal>,
}

impl TriggerEval {
    pub fn rejected(reason: TriggerReason) -> Self {
        Self {
            triggered: false,
            reason,
            drop_bp: None,
            anchor: None,
        }
    }
}

/// Signal-side view of a symbol for snapshot publication.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalSnapshot {
    pub anchor: Option<Decimal>,
    pub peak: Option<Decimal>,
    pub drop_pct: Option<Decimal>,
}

/// Buy-signal pipeline: anchors, rolling window, trigger, stabilizer.
pub trait BuySignal: Send {
    /// Feed a price observation (updates anchors and the rolling window).
    fn observe(&mut self, symbol: &Symbol, price: Decimal, now_s: i64);

    /// Evaluate the drop trigger at the current price.
    fn evaluate(&mut self, symbol: &Symbol, price: Decimal, now_s: i64) -> TriggerEval;

    /// Step the confirmation stabilizer; true once enough consecutive
    /// confirmations accumulated.
    fn confirm(&mut self, symbol: &Symbol, condition_ok: bool) -> bool;

    /// Notify a filled entry so the pipeline can re-anchor and reset
    /// debounce state.
    fn on_position_opened(&mut self, symbol: &Symbol, fill_price: Decimal, now_s: i64);

    /// Current anchor/peak/drop view for bus snapshots.
    fn snapshot(&self, symbol: &Symbol) -> SignalSnapshot;

    /// Periodic maintenance hook (anchor persistence flush).
    fn maintain(&mut self) {}
}

/// Result of running the composite guard stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardVerdict {
    pub pass: bool,
    pub failed: Vec<&'static str>,
}

impl GuardVerdict {
    pub fn passed() -> Self {
        Self {
            pass: true,
            failed: Vec::new(),
        }
    }
}

/// Per-guard counters drained into the periodic summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardCounter {
    pub name: &'static str,
    pub passes: u64,
    pub blocks: u64,
}

/// Composable entry filters fed by the engine's market refresh.
pub trait EntryGuards: Send {
    /// Latest price/volume observation for per-symbol guard state.
    fn feed_price(&mut self, symbol: &Symbol, price: Decimal, volume: Decimal, now_s: i64);

    /// Latest top-of-book for spread checks.
    fn feed_book(&mut self, symbol: &Symbol, bid: Decimal, ask: Decimal);

    /// Market-wide aggregates computed once per refresh.
    fn set_market_aggregates(
        &mut self,
        btc_change_factor: Option<Decimal>,
        falling_ratio: Option<Decimal>,
    );

    /// Run every enabled guard in deterministic order.
    fn check(&mut self, symbol: &Symbol, price: Decimal) -> GuardVerdict;

    /// Drain pass/block counters accumulated since the last drain.
    fn drain_counters(&mut self) -> Vec<GuardCounter>;
}
