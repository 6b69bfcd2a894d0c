//! Rolling stats and intent latency tracking

use crate::core::types::Symbol;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Time-windowed samples with mean/max aggregation.
pub struct RollingWindowStats {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl RollingWindowStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, value: f64) {
        self.samples.push_back((Instant::now(), value));
        self.evict();
    }

    fn evict(&mut self) {
        let cutoff = Instant::now() - self.window;
        while matches!(self.samples.front(), Some((t, _)) if *t < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn count(&mut self) -> usize {
        self.evict();
        self.samples.len()
    }

    pub fn mean(&mut self) -> Option<f64> {
        self.evict();
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn max(&mut self) -> Option<f64> {
        self.evict();
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

/// Pre-order intent, kept from decision to first fill for latency telemetry.
#[derive(Debug, Clone)]
pub struct Intent {
    pub intent_id: String,
    pub symbol: Symbol,
    pub signal: String,
    pub started: Instant,
    pub quote_budget: Decimal,
}

#[derive(Default)]
pub struct IntentTracker {
    pending: HashMap<Symbol, Intent>,
    seq: u64,
}

impl IntentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, symbol: &Symbol, signal: &str, quote_budget: Decimal) -> String {
        self.seq += 1;
        let intent_id = format!("i-{}", self.seq);
        self.pending.insert(
            symbol.clone(),
            Intent {
                intent_id: intent_id.clone(),
                symbol: symbol.clone(),
                signal: signal.to_string(),
                started: Instant::now(),
                quote_budget,
            },
        );
        intent_id
    }

    /// First fill arrived: report elapsed time and drop the intent.
    pub fn resolve(&mut self, symbol: &Symbol) -> Option<Duration> {
        self.pending.remove(symbol).map(|i| i.started.elapsed())
    }

    /// Order failed or expired without a fill.
    pub fn abandon(&mut self, symbol: &Symbol) {
        self.pending.remove(symbol);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rolling_mean_and_max() {
        let mut stats = RollingWindowStats::new(Duration::from_secs(60));
        stats.record(1.0);
        stats.record(3.0);
        assert_eq!(stats.count(), 2);
        approx::assert_relative_eq!(stats.mean().unwrap(), 2.0);
        approx::assert_relative_eq!(stats.max().unwrap(), 3.0);
    }

    #[test]
    fn test_intent_lifecycle() {
        let mut tracker = IntentTracker::new();
        let sym = Symbol::from("BTC/USDT");

        let id = tracker.open(&sym, "drop_trigger", dec!(100));
        assert!(id.starts_with("i-"));
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.resolve(&sym).is_some());
        assert_eq!(tracker.pending_count(), 0);
        assert!(tracker.resolve(&sym).is_none());
    }

    #[test]
    fn test_abandon_drops_intent() {
        let mut tracker = IntentTracker::new();
        let sym = Symbol::from("ETH/USDT");
        tracker.open(&sym, "drop_trigger", dec!(50));
        tracker.abandon(&sym);
        assert_eq!(tracker.pending_count(), 0);
    }
}
