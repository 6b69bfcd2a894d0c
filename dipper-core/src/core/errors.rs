//! Error taxonomy
//!
//! Each venue condition gets its own variant so callers can branch on kind
//! instead of substring-matching error messages. The retry decorator keys its
//! policy off `ExchangeError::is_retryable`.

use thiserror::Error;

/// Errors surfaced by any [`crate::exchange::ExchangeClient`] operation.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Connection, timeout, DNS, TLS, generic 5xx. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Explicit 429 or venue-specific throttle indicator. Retryable,
    /// honoring `retry_after` when the venue provides one.
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Venue-side rejection that is not a filter violation.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Price-tick, step-size, min-notional, disallowed TIF. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Lookup or cancel on an id the venue does not know.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// The venue already accepted an order with this client order id.
    #[error("duplicate client order id: {0}")]
    DuplicateOrder(String),

    /// recvWindow / timestamp-outside errors. Resync server time and retry
    /// once before surfacing.
    #[error("clock skew: {0}")]
    ClockSkew(String),
}

impl ExchangeError {
    /// Transient failures the retry wrapper may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::RateLimited { .. }
        )
    }

    /// Short kind tag for telemetry counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Network(_) => "network",
            ExchangeError::RateLimited { .. } => "rate_limited",
            ExchangeError::Exchange(_) => "exchange",
            ExchangeError::InvalidRequest(_) => "invalid_request",
            ExchangeError::OrderNotFound(_) => "order_not_found",
            ExchangeError::DuplicateOrder(_) => "duplicate_order",
            ExchangeError::ClockSkew(_) => "clock_skew",
        }
    }
}

/// Order state machine violations. These are programming errors at runtime;
/// the caller logs loudly and aborts the current operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("order {order_id}: cannot transition from terminal state {state}")]
    TerminalState { order_id: String, state: String },

    #[error("order {order_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: String,
        to: String,
    },
}

/// State-file I/O failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}
