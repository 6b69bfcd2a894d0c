//! Ticker cache with TTL and LRU eviction
//!
//! Fresh tickers are served from cache inside the TTL. A stale-tolerant
//! sidecar keeps the last good ticker beyond expiry for the degraded
//! fallback path.

use crate::core::types::{Symbol, Ticker};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    ticker: Ticker,
    expires_at: Instant,
    last_access: u64,
}

pub struct TickerCache {
    entries: HashMap<Symbol, CacheEntry>,
    /// Last good ticker per symbol regardless of TTL, with its store time.
    sidecar: HashMap<Symbol, (Ticker, Instant)>,
    default_ttl: Duration,
    max_size: usize,
    access_seq: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl TickerCache {
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            sidecar: HashMap::new(),
            default_ttl,
            max_size: max_size.max(1),
            access_seq: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Fresh ticker, or None when absent/expired.
    pub fn get(&mut self, symbol: &Symbol) -> Option<Ticker> {
        self.access_seq += 1;
        let seq = self.access_seq;
        let now = Instant::now();
        match self.entries.get_mut(symbol) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = seq;
                self.hits += 1;
                Some(entry.ticker.clone())
            }
            Some(_) => {
                self.entries.remove(symbol);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Last good ticker within `tolerance` of its store time, TTL ignored.
    pub fn get_stale(&self, symbol: &Symbol, tolerance: Duration) -> Option<Ticker> {
        self.sidecar.get(symbol).and_then(|(ticker, stored_at)| {
            (stored_at.elapsed() <= tolerance).then(|| ticker.clone())
        })
    }

    pub fn store(&mut self, ticker: Ticker) {
        self.store_with_ttl(ticker, self.default_ttl);
    }

    pub fn store_with_ttl(&mut self, ticker: Ticker, ttl: Duration) {
        self.access_seq += 1;
        let symbol = ticker.symbol.clone();
        self.sidecar
            .insert(symbol.clone(), (ticker.clone(), Instant::now()));
        self.entries.insert(
            symbol,
            CacheEntry {
                ticker,
                expires_at: Instant::now() + ttl,
                last_access: self.access_seq,
            },
        );
        if self.entries.len() > self.max_size {
            self.evict_lru();
        }
    }

    fn evict_lru(&mut self) {
        if let Some(symbol) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(s, _)| s.clone())
        {
            self.entries.remove(&symbol);
        }
    }

    /// Drop expired entries, returning the count removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sidecar.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str) -> Ticker {
        Ticker {
            symbol: Symbol::from(symbol),
            last: dec!(100),
            bid: dec!(99.9),
            ask: dec!(100.1),
            volume: dec!(10),
            timestamp_ms: 0,
            high_24h: None,
            low_24h: None,
            change_pct_24h: None,
            degraded: false,
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let mut cache = TickerCache::new(Duration::from_secs(5), 10);
        cache.store(ticker("BTC/USDT"));
        assert!(cache.get(&Symbol::from("BTC/USDT")).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_expired_entry_misses_but_sidecar_serves() {
        let mut cache = TickerCache::new(Duration::from_secs(5), 10);
        cache.store_with_ttl(ticker("BTC/USDT"), Duration::ZERO);
        let sym = Symbol::from("BTC/USDT");
        assert!(cache.get(&sym).is_none());
        assert!(cache.get_stale(&sym, Duration::from_secs(30)).is_some());
        assert!(cache.get_stale(&sym, Duration::ZERO).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = TickerCache::new(Duration::from_secs(60), 2);
        cache.store(ticker("A/USDT"));
        cache.store(ticker("B/USDT"));
        // Touch A so B becomes the least recently used
        assert!(cache.get(&Symbol::from("A/USDT")).is_some());
        cache.store(ticker("C/USDT"));

        assert!(cache.get(&Symbol::from("A/USDT")).is_some());
        assert!(cache.get(&Symbol::from("B/USDT")).is_none());
        assert!(cache.get(&Symbol::from("C/USDT")).is_some());
    }

    #[test]
    fn test_cleanup_expired() {
        let mut cache = TickerCache::new(Duration::from_secs(60), 10);
        cache.store_with_ttl(ticker("A/USDT"), Duration::ZERO);
        cache.store(ticker("B/USDT"));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.stats().size, 1);
    }
}
