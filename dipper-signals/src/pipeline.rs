//! Drop-trigger buy pipeline
//!
//! Wires anchors, the rolling window, the trigger, and the confirmation
//! stabilizer behind the engine's `BuySignal` seam. The anchor manager
//! persists Mode-4 anchors into the session directory; `maintain()` flushes
//! them.

use crate::drop_trigger::{DropTrigger, DropTriggerConfig};
use crate::rolling_window::WindowSet;
use crate::stabilizer::Stabilizer;
use dipper_core::config::Config;
use dipper_core::core::types::Symbol;
use dipper_core::engine::traits::{BuySignal, SignalSnapshot, TriggerEval};
use dipper_core::market::anchor::{AnchorConfig, AnchorManager};
use dipper_core::persist::SessionDirs;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DropPipelineConfig {
    pub trigger: DropTriggerConfig,
    pub confirm_ticks: u32,
    pub lookback_s: i64,
    pub window_capacity: usize,
    pub anchors: AnchorConfig,
}

impl DropPipelineConfig {
    /// Derive the pipeline configuration from the bot config; Mode-4 anchors
    /// persist into the session directory.
    pub fn from_config(config: &Config, session: &SessionDirs) -> anyhow::Result<Self> {
        let mode = config.trigger.mode()?;
        Ok(Self {
            trigger: DropTriggerConfig {
                threshold_bp: config.trigger.threshold_bp(),
                hysteresis_bp: config.trigger.hysteresis_bps,
                debounce_s: config.trigger.debounce_s,
            },
            confirm_ticks: config.trigger.confirm_ticks,
            lookback_s: (config.trigger.lookback_min * 60) as i64,
            // One point per engine market refresh; keep a generous margin
            window_capacity: (config.trigger.lookback_min as usize * 60).max(60),
            anchors: AnchorConfig {
                mode,
                clamp_above_peak_pct: config.anchors.clamp_max_above_peak_pct,
                max_start_drop_pct: config.anchors.max_start_drop_pct,
                stale_minutes: config.anchors.stale_minutes,
                max_age_hours: config.anchors.max_age_hours,
                path: Some(session.anchors_file()),
            },
        })
    }
}

pub struct DropPipeline {
    anchors: AnchorManager,
    windows: WindowSet,
    trigger: DropTrigger,
    stabilizer: Stabilizer,
    last_eval: HashMap<Symbol, TriggerEval>,
}

impl DropPipeline {
    pub fn new(config: DropPipelineConfig) -> Self {
        Self {
            anchors: AnchorManager::new(config.anchors),
            windows: WindowSet::new(config.window_capacity, config.lookback_s),
            trigger: DropTrigger::new(config.trigger),
            stabilizer: Stabilizer::new(config.confirm_ticks),
            last_eval: HashMap::new(),
        }
    }

    pub fn anchors(&self) -> &AnchorManager {
        &self.anchors
    }
}

impl BuySignal for DropPipeline {
    fn observe(&mut self, symbol: &Symbol, price: Decimal, now_s: i64) {
        if price <= Decimal::ZERO {
            return;
        }
        self.anchors.note_price(symbol, price, now_s);
        self.windows.push(symbol, now_s, price);
    }

    fn evaluate(&mut self, symbol: &Symbol, price: Decimal, now_s: i64) -> TriggerEval {
        let rolling_peak = self.windows.peak(symbol).unwrap_or(price);
        let anchor = self
            .anchors
            .compute_anchor(symbol, price, now_s, rolling_peak);
        let eval = self.trigger.evaluate(symbol, price, Some(anchor), now_s);
        self.last_eval.insert(symbol.clone(), eval);
        eval
    }

    fn confirm(&mut self, symbol: &Symbol, condition_ok: bool) -> bool {
        self.stabilizer.step(symbol, condition_ok)
    }

    fn on_position_opened(&mut self, symbol: &Symbol, fill_price: Decimal, now_s: i64) {
        // Re-anchor to the fill so the trigger cannot immediately re-fire
        // against the pre-buy peak (Mode 4); the stabilizer starts over.
        self.anchors.reset_anchor(symbol, fill_price, now_s);
        self.stabilizer.reset(Some(symbol));
    }

    fn snapshot(&self, symbol: &Symbol) -> SignalSnapshot {
        let eval = self.last_eval.get(symbol);
        SignalSnapshot {
            anchor: eval.and_then(|e| e.anchor),
            peak: self
                .windows
                .peak(symbol)
                .or_else(|| self.anchors.session_peak(symbol)),
            drop_pct: eval
                .and_then(|e| e.drop_bp)
                .map(|bp| bp / Decimal::from(100)),
        }
    }

    fn maintain(&mut self) {
        self.anchors.persist_if_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dipper_core::engine::traits::TriggerReason;
    use dipper_core::market::anchor::AnchorMode;
    use rust_decimal_macros::dec;

    fn pipeline(mode: AnchorMode) -> DropPipeline {
        DropPipeline::new(DropPipelineConfig {
            trigger: DropTriggerConfig {
                threshold_bp: 200,
                hysteresis_bp: 20,
                debounce_s: 15,
            },
            confirm_ticks: 1,
            lookback_s: 900,
            window_capacity: 900,
            anchors: AnchorConfig {
                mode,
                path: None,
                ..AnchorConfig::default()
            },
        })
    }

    fn sym() -> Symbol {
        Symbol::from("BTC/USDT")
    }

    #[test]
    fn test_mode1_sequence_fires_once_with_hysteresis() {
        // Spec scenario S1: prices 100,100,100,98.5,98 with threshold 200bp,
        // hysteresis 20bp, debounce 15s.
        let mut p = pipeline(AnchorMode::SessionHigh);
        let s = sym();

        let mut results = Vec::new();
        for (i, price) in [dec!(100), dec!(100), dec!(100), dec!(98.5), dec!(98)]
            .iter()
            .enumerate()
        {
            let now = i as i64;
            p.observe(&s, *price, now);
            results.push(p.evaluate(&s, *price, now));
        }

        assert!(!results[0].triggered); // 0bp drop
        assert!(!results[1].triggered);
        assert!(!results[2].triggered);
        // 150bp: below the 200bp threshold
        assert_eq!(results[3].reason, TriggerReason::BelowThreshold);
        // 200bp: threshold met but hysteresis not cleared... the anchor is
        // the session peak 100, so 98 is exactly 200bp
        assert_eq!(results[4].reason, TriggerReason::NeedHysteresis);

        // One more tick below threshold + hysteresis fires
        p.observe(&s, dec!(97.7), 5);
        let eval = p.evaluate(&s, dec!(97.7), 5);
        assert!(eval.triggered);
        assert_eq!(eval.drop_bp, Some(dec!(230)));

        // Immediate re-evaluation debounces
        let eval = p.evaluate(&s, dec!(97.6), 6);
        assert_eq!(eval.reason, TriggerReason::Debounce);
    }

    #[test]
    fn test_anchor_reset_after_fill_blocks_refire() {
        let mut p = pipeline(AnchorMode::Persistent);
        let s = sym();

        p.observe(&s, dec!(100), 0);
        p.evaluate(&s, dec!(100), 0);
        p.observe(&s, dec!(97), 1);
        assert!(p.evaluate(&s, dec!(97), 1).triggered);

        // Filled at 97: anchor drops to the fill price
        p.on_position_opened(&s, dec!(97), 2);
        assert_eq!(p.anchors().get_anchor(&s).unwrap().anchor, dec!(97));

        // Right after the fill the debounce window holds the trigger shut
        p.observe(&s, dec!(96.9), 5);
        let eval = p.evaluate(&s, dec!(96.9), 5);
        assert!(!eval.triggered);
        assert_eq!(eval.reason, TriggerReason::Debounce);
    }

    #[test]
    fn test_snapshot_reports_anchor_and_drop() {
        let mut p = pipeline(AnchorMode::SessionHigh);
        let s = sym();
        p.observe(&s, dec!(100), 0);
        p.evaluate(&s, dec!(99), 0);

        let snap = p.snapshot(&s);
        assert_eq!(snap.anchor, Some(dec!(100)));
        assert_eq!(snap.drop_pct, Some(dec!(1)));
    }
}
