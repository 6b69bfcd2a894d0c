//! OHLCV history store
//!
//! Bounded, insertion-ordered bar sequences per `(symbol, timeframe)`,
//! deduplicated by bar timestamp (a newer bar overwrites the open candle
//! with the same timestamp). Derived statistics feed the guard stack.

use crate::core::types::{Bar, Symbol};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

pub struct OhlcvHistory {
    series: HashMap<(Symbol, String), VecDeque<Bar>>,
    max_bars: usize,
}

impl OhlcvHistory {
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: HashMap::new(),
            max_bars: max_bars.max(1),
        }
    }

    pub fn add_bars(&mut self, symbol: &Symbol, timeframe: &str, bars: &[Bar]) {
        let key = (symbol.clone(), timeframe.to_string());
        let series = self.series.entry(key).or_default();
        for bar in bars {
            match series.iter().rposition(|b| b.timestamp_ms == bar.timestamp_ms) {
                Some(idx) => series[idx] = *bar,
                None => {
                    series.push_back(*bar);
                    if series.len() > self.max_bars {
                        series.pop_front();
                    }
                }
            }
        }
    }

    pub fn bars(&self, symbol: &Symbol, timeframe: &str, limit: Option<usize>) -> Vec<Bar> {
        let key = (symbol.clone(), timeframe.to_string());
        let series = match self.series.get(&key) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let take = limit.unwrap_or(series.len()).min(series.len());
        series.iter().skip(series.len() - take).copied().collect()
    }

    pub fn latest_bar(&self, symbol: &Symbol, timeframe: &str) -> Option<Bar> {
        let key = (symbol.clone(), timeframe.to_string());
        self.series.get(&key).and_then(|s| s.back().copied())
    }

    pub fn len(&self, symbol: &Symbol, timeframe: &str) -> usize {
        let key = (symbol.clone(), timeframe.to_string());
        self.series.get(&key).map(|s| s.len()).unwrap_or(0)
    }

    // ========================================================================
    // Derived statistics
    // ========================================================================

    /// Simple moving average of closes over the last `window` bars.
    pub fn sma(&self, symbol: &Symbol, timeframe: &str, window: usize) -> Option<Decimal> {
        let bars = self.bars(symbol, timeframe, Some(window));
        if bars.len() < window || window == 0 {
            return None;
        }
        let sum: Decimal = bars.iter().map(|b| b.close).sum();
        Some(sum / Decimal::from(window))
    }

    /// Mean volume over the last `window` bars.
    pub fn mean_volume(&self, symbol: &Symbol, timeframe: &str, window: usize) -> Option<Decimal> {
        let bars = self.bars(symbol, timeframe, Some(window));
        if bars.len() < window || window == 0 {
            return None;
        }
        let sum: Decimal = bars.iter().map(|b| b.volume).sum();
        Some(sum / Decimal::from(window))
    }

    /// `(low, high)` over the last `lookback` bars.
    pub fn price_range(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        lookback: usize,
    ) -> Option<(Decimal, Decimal)> {
        let bars = self.bars(symbol, timeframe, Some(lookback));
        if bars.is_empty() {
            return None;
        }
        let low = bars.iter().map(|b| b.low).min()?;
        let high = bars.iter().map(|b| b.high).max()?;
        Some((low, high))
    }

    /// Average true range over `period` bars (simple mean of true ranges).
    pub fn atr(&self, symbol: &Symbol, timeframe: &str, period: usize) -> Option<Decimal> {
        let bars = self.bars(symbol, timeframe, Some(period + 1));
        if bars.len() < period + 1 || period == 0 {
            return None;
        }
        let mut sum = Decimal::ZERO;
        for pair in bars.windows(2) {
            sum += pair[1].true_range(Some(pair[0].close));
        }
        Some(sum / Decimal::from(period))
    }

    /// Standard deviation of close-to-close returns over `window` bars,
    /// in basis points. Telemetry-grade: computed in f64.
    pub fn returns_sigma_bps(&self, symbol: &Symbol, timeframe: &str, window: usize) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;
        let bars = self.bars(symbol, timeframe, Some(window + 1));
        if bars.len() < window + 1 || window == 0 {
            return None;
        }
        let mut returns = Vec::with_capacity(window);
        for pair in bars.windows(2) {
            let prev = pair[0].close.to_f64()?;
            let cur = pair[1].close.to_f64()?;
            if prev <= 0.0 {
                return None;
            }
            returns.push((cur / prev - 1.0) * 10_000.0);
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        Some(var.sqrt())
    }

    /// Close-to-close change factor over roughly `minutes` of 1m bars:
    /// `close_now / close_then`. None until enough history is present.
    pub fn change_factor(&self, symbol: &Symbol, timeframe: &str, minutes: usize) -> Option<Decimal> {
        let bars = self.bars(symbol, timeframe, Some(minutes + 1));
        if bars.len() < minutes + 1 {
            return None;
        }
        let then = bars.first()?.close;
        let now = bars.last()?.close;
        if then <= Decimal::ZERO {
            return None;
        }
        Some(now / then)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(ts: i64, close: Decimal, volume: Decimal) -> Bar {
        Bar {
            timestamp_ms: ts,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume,
        }
    }

    #[test]
    fn test_dedup_by_timestamp_newest_wins() {
        let mut h = OhlcvHistory::new(100);
        let sym = Symbol::from("BTC/USDT");
        h.add_bars(&sym, "1m", &[bar(60_000, dec!(100), dec!(5))]);
        h.add_bars(&sym, "1m", &[bar(60_000, dec!(101), dec!(7))]);

        assert_eq!(h.len(&sym, "1m"), 1);
        assert_eq!(h.latest_bar(&sym, "1m").unwrap().close, dec!(101));
    }

    #[test]
    fn test_bounded() {
        let mut h = OhlcvHistory::new(3);
        let sym = Symbol::from("BTC/USDT");
        for i in 0..5 {
            h.add_bars(&sym, "1m", &[bar(i * 60_000, Decimal::from(100 + i), dec!(1))]);
        }
        assert_eq!(h.len(&sym, "1m"), 3);
        // Oldest two evicted
        let bars = h.bars(&sym, "1m", None);
        assert_eq!(bars[0].close, dec!(102));
    }

    #[test]
    fn test_sma_and_mean_volume() {
        let mut h = OhlcvHistory::new(100);
        let sym = Symbol::from("BTC/USDT");
        for (i, close) in [dec!(100), dec!(102), dec!(104)].iter().enumerate() {
            h.add_bars(&sym, "1m", &[bar(i as i64 * 60_000, *close, dec!(10))]);
        }
        assert_eq!(h.sma(&sym, "1m", 3).unwrap(), dec!(102));
        assert_eq!(h.mean_volume(&sym, "1m", 3).unwrap(), dec!(10));
        assert!(h.sma(&sym, "1m", 4).is_none());
    }

    #[test]
    fn test_change_factor() {
        let mut h = OhlcvHistory::new(100);
        let sym = Symbol::from("BTC/USDT");
        for i in 0..61 {
            let close = if i == 0 { dec!(100) } else { dec!(95) };
            h.add_bars(&sym, "1m", &[bar(i * 60_000, close, dec!(1))]);
        }
        assert_eq!(h.change_factor(&sym, "1m", 60).unwrap(), dec!(0.95));
    }

    #[test]
    fn test_returns_sigma() {
        let mut h = OhlcvHistory::new(100);
        let sym = Symbol::from("BTC/USDT");
        for (i, close) in [dec!(100), dec!(101), dec!(100)].iter().enumerate() {
            h.add_bars(&sym, "1m", &[bar(i as i64 * 60_000, *close, dec!(1))]);
        }
        // Returns: +100bp, then -99.0099bp; population sigma ~= 99.505
        let sigma = h.returns_sigma_bps(&sym, "1m", 2).unwrap();
        approx::assert_relative_eq!(sigma, 99.505, epsilon = 0.01);
        // Flat series has zero volatility
        let mut flat = OhlcvHistory::new(100);
        for i in 0..3 {
            flat.add_bars(&sym, "1m", &[bar(i * 60_000, dec!(50), dec!(1))]);
        }
        approx::assert_relative_eq!(flat.returns_sigma_bps(&sym, "1m", 2).unwrap(), 0.0);
    }

    #[test]
    fn test_price_range_and_atr() {
        let mut h = OhlcvHistory::new(100);
        let sym = Symbol::from("BTC/USDT");
        for (i, close) in [dec!(100), dec!(105), dec!(95)].iter().enumerate() {
            h.add_bars(&sym, "1m", &[bar(i as i64 * 60_000, *close, dec!(1))]);
        }
        let (low, high) = h.price_range(&sym, "1m", 3).unwrap();
        assert_eq!(low, dec!(94));
        assert_eq!(high, dec!(106));
        assert!(h.atr(&sym, "1m", 2).unwrap() > Decimal::ZERO);
    }
}
