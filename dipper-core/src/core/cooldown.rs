//! Per-symbol cooldowns
//!
//! After a fill or a failed order a symbol is benched for a while so the
//! engine does not immediately re-enter. Entries auto-expire on query; a
//! periodic cleanup drops the leftovers.

use crate::core::clock::now_s;
use crate::core::types::Symbol;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    release_ts: i64,
}

#[derive(Default)]
pub struct CooldownManager {
    entries: DashMap<Symbol, CooldownEntry>,
    total_set: AtomicU64,
}

/// Aggregate counters for the periodic maintenance log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownStats {
    pub active: usize,
    pub total_set: u64,
}

impl CooldownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bench `symbol` for `duration_s` seconds from now. A shorter new
    /// cooldown never truncates a longer active one.
    pub fn set(&self, symbol: &Symbol, duration_s: i64) {
        self.set_at(symbol, duration_s, now_s());
    }

    pub fn set_at(&self, symbol: &Symbol, duration_s: i64, now: i64) {
        self.total_set.fetch_add(1, Ordering::Relaxed);
        let release_ts = now + duration_s.max(0);
        let mut extended = true;
        self.entries
            .entry(symbol.clone())
            .and_modify(|e| {
                if release_ts > e.release_ts {
                    e.release_ts = release_ts;
                } else {
                    extended = false;
                }
            })
            .or_insert(CooldownEntry { release_ts });
        if extended {
            debug!(%symbol, duration_s, "cooldown set");
        }
    }

    /// Whether the symbol is still benched; expired entries are removed.
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.is_active_at(symbol, now_s())
    }

    pub fn is_active_at(&self, symbol: &Symbol, now: i64) -> bool {
        match self.entries.get(symbol).map(|e| e.release_ts) {
            Some(release) if release > now => true,
            Some(_) => {
                self.entries.remove(symbol);
                false
            }
            None => false,
        }
    }

    /// Seconds until release, zero when not benched.
    pub fn remaining_s(&self, symbol: &Symbol, now: i64) -> i64 {
        self.entries
            .get(symbol)
            .map(|e| (e.release_ts - now).max(0))
            .unwrap_or(0)
    }

    pub fn clear(&self, symbol: &Symbol) -> bool {
        self.entries.remove(symbol).is_some()
    }

    pub fn clear_all(&self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Drop all expired entries, returning the count removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(now_s())
    }

    pub fn cleanup_expired_at(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.release_ts > now);
        before - self.entries.len()
    }

    pub fn active_symbols(&self) -> Vec<Symbol> {
        let now = now_s();
        self.entries
            .iter()
            .filter(|e| e.release_ts > now)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn stats(&self) -> CooldownStats {
        CooldownStats {
            active: self.active_symbols().len(),
            total_set: self.total_set.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_expiry() {
        let mgr = CooldownManager::new();
        let sym = Symbol::from("BTC/USDT");

        mgr.set_at(&sym, 60, 1000);
        assert!(mgr.is_active_at(&sym, 1030));
        assert_eq!(mgr.remaining_s(&sym, 1030), 30);

        // Expired entry is removed on query
        assert!(!mgr.is_active_at(&sym, 1061));
        assert_eq!(mgr.remaining_s(&sym, 1061), 0);
    }

    #[test]
    fn test_shorter_cooldown_never_truncates() {
        let mgr = CooldownManager::new();
        let sym = Symbol::from("ETH/USDT");

        mgr.set_at(&sym, 120, 1000);
        mgr.set_at(&sym, 10, 1000);
        assert_eq!(mgr.remaining_s(&sym, 1000), 120);

        mgr.set_at(&sym, 300, 1000);
        assert_eq!(mgr.remaining_s(&sym, 1000), 300);
    }

    #[test]
    fn test_cleanup_expired() {
        let mgr = CooldownManager::new();
        mgr.set_at(&Symbol::from("A/USDT"), 10, 1000);
        mgr.set_at(&Symbol::from("B/USDT"), 100, 1000);

        assert_eq!(mgr.cleanup_expired_at(1050), 1);
        assert!(mgr.is_active_at(&Symbol::from("B/USDT"), 1050));
    }

    #[test]
    fn test_clear_all() {
        let mgr = CooldownManager::new();
        mgr.set_at(&Symbol::from("A/USDT"), 100, 1000);
        mgr.set_at(&Symbol::from("B/USDT"), 100, 1000);
        assert_eq!(mgr.clear_all(), 2);
        assert!(!mgr.is_active_at(&Symbol::from("A/USDT"), 1000));
    }
}
