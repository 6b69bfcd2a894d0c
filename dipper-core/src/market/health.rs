//! Per-symbol fetch health and circuit breaking
//!
//! Consecutive fetch failures open a breaker; while open, all fetches for
//! the symbol short-circuit to the degraded fallback. After the open timeout
//! one probe is allowed (half-open); success closes the breaker, failure
//! re-opens it.

use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, fetches pass through
    Closed,
    /// Tripped, fetches short-circuit to fallback
    Open,
    /// Probing recovery with a single live fetch
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing
    pub open_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct SymbolHealth {
    config: HealthConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl SymbolHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a live fetch may proceed. Transitions Open -> HalfOpen when
    /// the open timeout has elapsed.
    pub fn fetch_permitted(&mut self, symbol_label: &str) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_timeout {
                    info!(symbol = symbol_label, "breaker half-open, probing");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, symbol_label: &str) {
        if self.state != CircuitState::Closed {
            info!(symbol = symbol_label, "breaker closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, symbol_label: &str) {
        match self.state {
            CircuitState::HalfOpen => {
                warn!(symbol = symbol_label, "probe failed, breaker re-opened");
                self.open();
            }
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        symbol = symbol_label,
                        failures = self.consecutive_failures,
                        "breaker opened"
                    );
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(threshold: u32, timeout: Duration) -> SymbolHealth {
        SymbolHealth::new(HealthConfig {
            failure_threshold: threshold,
            open_timeout: timeout,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut h = health(3, Duration::from_secs(60));
        h.record_failure("X");
        h.record_failure("X");
        assert_eq!(h.state(), CircuitState::Closed);
        h.record_failure("X");
        assert_eq!(h.state(), CircuitState::Open);
        assert!(!h.fetch_permitted("X"));
    }

    #[test]
    fn test_success_resets_count() {
        let mut h = health(3, Duration::from_secs(60));
        h.record_failure("X");
        h.record_failure("X");
        h.record_success("X");
        assert_eq!(h.consecutive_failures(), 0);
        h.record_failure("X");
        assert_eq!(h.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let mut h = health(1, Duration::ZERO);
        h.record_failure("X");
        assert_eq!(h.state(), CircuitState::Open);

        // Timeout elapsed immediately: probe permitted
        assert!(h.fetch_permitted("X"));
        assert_eq!(h.state(), CircuitState::HalfOpen);

        // Probe failure re-opens
        h.record_failure("X");
        assert_eq!(h.state(), CircuitState::Open);

        // Next probe succeeds and closes
        assert!(h.fetch_permitted("X"));
        h.record_success("X");
        assert_eq!(h.state(), CircuitState::Closed);
    }
}
