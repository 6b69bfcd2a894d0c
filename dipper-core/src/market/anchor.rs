//! Anchor management for the drop trigger
//!
//! The anchor is the reference price a drop is measured against. Four modes:
//!
//! 1. session-high: max price since start
//! 2. rolling-high: max price inside the lookback window
//! 3. hybrid: max of both
//! 4. persistent: monotonically non-decreasing over its own lifetime, reset
//!    when stale, persisted across restarts
//!
//! Two clamps apply in every mode, in order: the anchor may not sit more
//! than `clamp_above_peak_pct` above the session peak, and may not fall more
//! than `max_start_drop_pct` below the session start price.

use crate::core::types::Symbol;
use crate::persist::{atomic_write_json, load_json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AnchorMode {
    SessionHigh,
    RollingHigh,
    Hybrid,
    Persistent,
}

impl TryFrom<u8> for AnchorMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AnchorMode::SessionHigh),
            2 => Ok(AnchorMode::RollingHigh),
            3 => Ok(AnchorMode::Hybrid),
            4 => Ok(AnchorMode::Persistent),
            other => Err(format!("anchor mode must be 1..=4, got {other}")),
        }
    }
}

impl From<AnchorMode> for u8 {
    fn from(mode: AnchorMode) -> u8 {
        match mode {
            AnchorMode::SessionHigh => 1,
            AnchorMode::RollingHigh => 2,
            AnchorMode::Hybrid => 3,
            AnchorMode::Persistent => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub mode: AnchorMode,
    /// Over-peak clamp, percent above session peak
    pub clamp_above_peak_pct: Decimal,
    /// Start-drop clamp, percent below session start
    pub max_start_drop_pct: Decimal,
    /// Mode-4 stale reset after this many minutes without an update
    pub stale_minutes: i64,
    /// Persisted anchors older than this are discarded on load
    pub max_age_hours: i64,
    /// Mode-4 persistence target; None disables persistence
    pub path: Option<PathBuf>,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            mode: AnchorMode::Persistent,
            clamp_above_peak_pct: Decimal::new(5, 1), // 0.5
            max_start_drop_pct: Decimal::from(8),
            stale_minutes: 60,
            max_age_hours: 24,
            path: None,
        }
    }
}

/// Persisted anchor entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub anchor: Decimal,
    pub ts: i64,
}

pub struct AnchorManager {
    config: AnchorConfig,
    anchors: HashMap<Symbol, AnchorRecord>,
    session_high: HashMap<Symbol, Decimal>,
    session_start: HashMap<Symbol, Decimal>,
    dirty: bool,
}

impl AnchorManager {
    pub fn new(config: AnchorConfig) -> Self {
        let mut mgr = Self {
            config,
            anchors: HashMap::new(),
            session_high: HashMap::new(),
            session_start: HashMap::new(),
            dirty: false,
        };
        mgr.load();
        mgr
    }

    fn load(&mut self) {
        let path = match &self.config.path {
            Some(p) => p.clone(),
            None => return,
        };
        let loaded: HashMap<Symbol, AnchorRecord> = match load_json(&path) {
            Ok(Some(map)) => map,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "anchor state unreadable, starting fresh");
                return;
            }
        };

        let cutoff = crate::core::clock::now_s() - self.config.max_age_hours * 3600;
        let total = loaded.len();
        self.anchors = loaded
            .into_iter()
            .filter(|(_, rec)| rec.ts >= cutoff)
            .collect();
        info!(
            kept = self.anchors.len(),
            discarded = total - self.anchors.len(),
            "anchors loaded"
        );
    }

    /// Write the Mode-4 anchor map if it changed since the last save.
    pub fn persist_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(path) = &self.config.path {
            match atomic_write_json(path, &self.anchors) {
                Ok(()) => self.dirty = false,
                Err(e) => warn!(error = %e, "anchor persistence failed"),
            }
        } else {
            self.dirty = false;
        }
    }

    /// Track session start (first observation) and session peak.
    pub fn note_price(&mut self, symbol: &Symbol, price: Decimal, _now: i64) {
        if price <= Decimal::ZERO {
            return;
        }
        self.session_start.entry(symbol.clone()).or_insert(price);
        let high = self.session_high.entry(symbol.clone()).or_insert(price);
        if price > *high {
            *high = price;
        }
    }

    /// Compute the anchor for `symbol` given the rolling-window peak.
    pub fn compute_anchor(
        &mut self,
        symbol: &Symbol,
        last: Decimal,
        now: i64,
        rolling_peak: Decimal,
    ) -> Decimal {
        let session_peak = *self.session_high.get(symbol).unwrap_or(&last);

        let mut anchor = match self.config.mode {
            AnchorMode::SessionHigh => session_peak,
            AnchorMode::RollingHigh => rolling_peak,
            AnchorMode::Hybrid => session_peak.max(rolling_peak),
            AnchorMode::Persistent => {
                let base = session_peak.max(rolling_peak);
                let prev = self.anchors.get(symbol).copied();
                match prev {
                    None => base,
                    Some(rec) if now - rec.ts > self.config.stale_minutes * 60 => {
                        debug!(
                            %symbol,
                            age_min = (now - rec.ts) / 60,
                            "stale anchor reset"
                        );
                        base
                    }
                    // The anchor only rises, and never falls below base
                    Some(rec) => base.max(rec.anchor),
                }
            }
        };

        anchor = self.apply_clamps(symbol, anchor, session_peak);

        if self.config.mode == AnchorMode::Persistent {
            self.anchors
                .insert(symbol.clone(), AnchorRecord { anchor, ts: now });
            self.dirty = true;
        }
        anchor
    }

    fn apply_clamps(&self, symbol: &Symbol, mut anchor: Decimal, session_peak: Decimal) -> Decimal {
        let hundred = Decimal::from(100);

        let max_anchor = session_peak * (Decimal::ONE + self.config.clamp_above_peak_pct / hundred);
        if anchor > max_anchor {
            debug!(%symbol, %anchor, clamped = %max_anchor, "over-peak clamp");
            anchor = max_anchor;
        }

        if let Some(start) = self.session_start.get(symbol) {
            let min_anchor = *start * (Decimal::ONE - self.config.max_start_drop_pct / hundred);
            if anchor < min_anchor {
                debug!(%symbol, %anchor, clamped = %min_anchor, "start-drop clamp");
                anchor = min_anchor;
            }
        }
        anchor
    }

    /// After a buy fill in Mode 4 the anchor drops to the fill price so the
    /// trigger cannot re-fire against the pre-buy peak.
    pub fn reset_anchor(&mut self, symbol: &Symbol, price: Decimal, now: i64) {
        if self.config.mode != AnchorMode::Persistent {
            return;
        }
        self.anchors
            .insert(symbol.clone(), AnchorRecord { anchor: price, ts: now });
        self.dirty = true;
        info!(%symbol, %price, "anchor reset after fill");
    }

    pub fn get_anchor(&self, symbol: &Symbol) -> Option<AnchorRecord> {
        self.anchors.get(symbol).copied()
    }

    pub fn session_peak(&self, symbol: &Symbol) -> Option<Decimal> {
        self.session_high.get(symbol).copied()
    }

    pub fn session_start(&self, symbol: &Symbol) -> Option<Decimal> {
        self.session_start.get(symbol).copied()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::now_s;
    use rust_decimal_macros::dec;

    fn manager(mode: AnchorMode) -> AnchorManager {
        AnchorManager::new(AnchorConfig {
            mode,
            ..AnchorConfig::default()
        })
    }

    fn sym() -> Symbol {
        Symbol::from("BTC/USDT")
    }

    #[test]
    fn test_session_tracking() {
        let mut mgr = manager(AnchorMode::SessionHigh);
        mgr.note_price(&sym(), dec!(100), 0);
        mgr.note_price(&sym(), dec!(110), 1);
        mgr.note_price(&sym(), dec!(105), 2);
        assert_eq!(mgr.session_peak(&sym()), Some(dec!(110)));
        assert_eq!(mgr.session_start(&sym()), Some(dec!(100)));
    }

    #[test]
    fn test_mode1_uses_session_peak() {
        let mut mgr = manager(AnchorMode::SessionHigh);
        mgr.note_price(&sym(), dec!(100), 0);
        mgr.note_price(&sym(), dec!(108), 1);
        let anchor = mgr.compute_anchor(&sym(), dec!(104), 2, dec!(101));
        assert_eq!(anchor, dec!(108));
    }

    #[test]
    fn test_mode2_uses_rolling_peak() {
        let mut mgr = manager(AnchorMode::RollingHigh);
        mgr.note_price(&sym(), dec!(100), 0);
        let anchor = mgr.compute_anchor(&sym(), dec!(99), 1, dec!(100.2));
        assert_eq!(anchor, dec!(100.2));
    }

    #[test]
    fn test_mode3_hybrid_max() {
        let mut mgr = manager(AnchorMode::Hybrid);
        mgr.note_price(&sym(), dec!(100), 0);
        mgr.note_price(&sym(), dec!(103), 1);
        let anchor = mgr.compute_anchor(&sym(), dec!(99), 2, dec!(101));
        assert_eq!(anchor, dec!(103));
    }

    #[test]
    fn test_over_peak_clamp() {
        // Spec scenario: peak 100, rolling 150, clamp 0.5% => anchor <= 100.5
        let mut mgr = manager(AnchorMode::Persistent);
        mgr.note_price(&sym(), dec!(100), 0);
        let anchor = mgr.compute_anchor(&sym(), dec!(100), 1, dec!(150));
        assert_eq!(anchor, dec!(100.5));
    }

    #[test]
    fn test_start_drop_clamp() {
        let mut mgr = manager(AnchorMode::SessionHigh);
        mgr.note_price(&sym(), dec!(100), 0);
        // Session collapses: session peak would put the anchor below
        // start * (1 - 8%) = 92, so it clamps there.
        mgr.session_high.insert(sym(), dec!(80));
        let anchor = mgr.compute_anchor(&sym(), dec!(80), 1, dec!(0));
        assert_eq!(anchor, dec!(92.0));
    }

    #[test]
    fn test_mode4_monotone_until_stale() {
        let mut mgr = manager(AnchorMode::Persistent);
        mgr.note_price(&sym(), dec!(100), 0);

        let a1 = mgr.compute_anchor(&sym(), dec!(100), 100, dec!(100));
        // Lower base later: anchor must not fall
        let a2 = mgr.compute_anchor(&sym(), dec!(95), 200, dec!(95));
        assert!(a2 >= a1);

        // Past stale window the anchor resets to base (clamps still apply)
        let stale_at = 200 + 61 * 60;
        let a3 = mgr.compute_anchor(&sym(), dec!(95), stale_at, dec!(95));
        assert_eq!(a3, dec!(100)); // base 100 from session peak
        assert!(a3 <= a2);
    }

    #[test]
    fn test_reset_anchor_after_fill() {
        let mut mgr = manager(AnchorMode::Persistent);
        mgr.note_price(&sym(), dec!(100), 0);
        mgr.compute_anchor(&sym(), dec!(100), 1, dec!(100));
        mgr.reset_anchor(&sym(), dec!(97), 2);
        assert_eq!(mgr.get_anchor(&sym()).unwrap().anchor, dec!(97));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");
        let now = now_s();

        let mut mgr = AnchorManager::new(AnchorConfig {
            mode: AnchorMode::Persistent,
            path: Some(path.clone()),
            ..AnchorConfig::default()
        });
        mgr.note_price(&sym(), dec!(100), now);
        let anchor = mgr.compute_anchor(&sym(), dec!(100), now, dec!(100));
        mgr.persist_if_dirty();

        // Restart: fresh age, record survives
        let reloaded = AnchorManager::new(AnchorConfig {
            mode: AnchorMode::Persistent,
            path: Some(path.clone()),
            ..AnchorConfig::default()
        });
        assert_eq!(reloaded.get_anchor(&sym()).unwrap().anchor, anchor);
    }

    #[test]
    fn test_load_discards_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");

        let mut stale = HashMap::new();
        stale.insert(
            sym(),
            AnchorRecord {
                anchor: dec!(123),
                ts: now_s() - 25 * 3600,
            },
        );
        atomic_write_json(&path, &stale).unwrap();

        let mgr = AnchorManager::new(AnchorConfig {
            mode: AnchorMode::Persistent,
            path: Some(path),
            ..AnchorConfig::default()
        });
        assert_eq!(mgr.anchor_count(), 0);
    }
}
