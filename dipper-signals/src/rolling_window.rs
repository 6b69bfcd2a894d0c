//! Rolling price window
//!
//! Fixed-capacity FIFO of `(timestamp, price)` points spanning at most the
//! configured lookback. The running max is maintained incrementally and only
//! recomputed when the evicted point carried it.

use dipper_core::core::types::Symbol;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

pub struct RollingWindow {
    points: VecDeque<(i64, Decimal)>,
    capacity: usize,
    lookback_s: i64,
    max: Option<Decimal>,
}

impl RollingWindow {
    pub fn new(capacity: usize, lookback_s: i64) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            lookback_s,
            max: None,
        }
    }

    pub fn push(&mut self, ts: i64, price: Decimal) {
        let mut max_evicted = false;

        // Age out points beyond the lookback, then enforce capacity
        let cutoff = ts - self.lookback_s;
        while matches!(self.points.front(), Some((t, _)) if *t < cutoff) {
            max_evicted |= self.evict_front();
        }
        while self.points.len() >= self.capacity {
            max_evicted |= self.evict_front();
        }

        self.points.push_back((ts, price));
        match self.max {
            Some(m) if price <= m => {}
            _ => self.max = Some(price),
        }
        if max_evicted {
            self.recompute_max();
        }
    }

    fn evict_front(&mut self) -> bool {
        match self.points.pop_front() {
            Some((_, price)) => Some(price) == self.max,
            None => false,
        }
    }

    fn recompute_max(&mut self) {
        self.max = self.points.iter().map(|(_, p)| *p).max();
    }

    pub fn max(&self) -> Option<Decimal> {
        self.max
    }

    /// Oldest price still inside the window.
    pub fn window_start_price(&self) -> Option<Decimal> {
        self.points.front().map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }
}

/// Per-symbol window registry.
pub struct WindowSet {
    windows: HashMap<Symbol, RollingWindow>,
    capacity: usize,
    lookback_s: i64,
}

impl WindowSet {
    pub fn new(capacity: usize, lookback_s: i64) -> Self {
        Self {
            windows: HashMap::new(),
            capacity,
            lookback_s,
        }
    }

    pub fn push(&mut self, symbol: &Symbol, ts: i64, price: Decimal) {
        self.windows
            .entry(symbol.clone())
            .or_insert_with(|| RollingWindow::new(self.capacity, self.lookback_s))
            .push(ts, price);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&RollingWindow> {
        self.windows.get(symbol)
    }

    pub fn peak(&self, symbol: &Symbol) -> Option<Decimal> {
        self.windows.get(symbol).and_then(|w| w.max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_max_tracks_new_high() {
        let mut w = RollingWindow::new(10, 600);
        w.push(0, dec!(100));
        w.push(1, dec!(105));
        w.push(2, dec!(103));
        assert_eq!(w.max(), Some(dec!(105)));
        assert_eq!(w.window_start_price(), Some(dec!(100)));
    }

    #[test]
    fn test_max_recomputed_when_peak_ages_out() {
        let mut w = RollingWindow::new(10, 5);
        w.push(0, dec!(110));
        w.push(1, dec!(100));
        w.push(2, dec!(105));
        assert_eq!(w.max(), Some(dec!(110)));

        // At t=7 the peak at t=0 is older than the 5s lookback
        w.push(7, dec!(101));
        assert_eq!(w.max(), Some(dec!(105)));
    }

    #[test]
    fn test_capacity_eviction() {
        let mut w = RollingWindow::new(3, 1_000_000);
        for (i, px) in [dec!(110), dec!(100), dec!(101), dec!(102)].iter().enumerate() {
            w.push(i as i64, *px);
        }
        assert_eq!(w.len(), 3);
        // The 110 print fell out by capacity
        assert_eq!(w.max(), Some(dec!(102)));
        assert_eq!(w.window_start_price(), Some(dec!(100)));
    }

    #[test]
    fn test_window_set_per_symbol() {
        let mut set = WindowSet::new(10, 600);
        set.push(&Symbol::from("A/USDT"), 0, dec!(5));
        set.push(&Symbol::from("B/USDT"), 0, dec!(7));
        assert_eq!(set.peak(&Symbol::from("A/USDT")), Some(dec!(5)));
        assert_eq!(set.peak(&Symbol::from("B/USDT")), Some(dec!(7)));
        assert_eq!(set.peak(&Symbol::from("C/USDT")), None);
    }

    proptest! {
        /// The incremental max always equals a full scan of the retained
        /// points.
        #[test]
        fn prop_max_matches_reference(prices in prop::collection::vec(1u32..1_000_000, 1..200)) {
            let mut w = RollingWindow::new(50, 1_000_000);
            let mut reference: Vec<Decimal> = Vec::new();
            for (i, p) in prices.iter().enumerate() {
                let price = Decimal::from(*p);
                w.push(i as i64, price);
                reference.push(price);
                if reference.len() > 50 {
                    reference.remove(0);
                }
                prop_assert_eq!(w.max(), reference.iter().copied().max());
            }
        }
    }
}
