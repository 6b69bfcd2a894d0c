//! Structured event log
//!
//! Newline-delimited JSON, one record per line:
//! `{"ts": "...", "event_type": "...", ...payload}`. These records are the
//! observability contract; dashboards and notifiers tail this file instead
//! of scraping free-form logs.

use crate::core::clock::rfc3339_now;
use crate::core::types::{MarketInfo, Side, Symbol, TimeInForce};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Event payloads. The serde tag becomes the `event_type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    #[serde(rename = "ORDER_SENT")]
    OrderSent {
        symbol: Symbol,
        side: Side,
        price: Option<Decimal>,
        qty: Decimal,
        notional: Decimal,
        tif: TimeInForce,
        post_only: bool,
        client_order_id: String,
        filters: MarketInfo,
        audit: String,
    },

    #[serde(rename = "ORDER_UPDATE")]
    OrderUpdate {
        client_order_id: String,
        order_id: String,
        status: String,
        filled: Decimal,
        remaining: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        average_price: Option<Decimal>,
    },

    #[serde(rename = "ORDER_FILLED")]
    OrderFilled {
        symbol: Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
        fee_quote: Decimal,
    },

    #[serde(rename = "TRADE_FILL")]
    TradeFill {
        symbol: Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
        fee_quote: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        slippage_bp: Option<Decimal>,
        ts: i64,
    },

    #[serde(rename = "DECISION_START")]
    DecisionStart { decision: String, symbol: Symbol },

    #[serde(rename = "DECISION_END")]
    DecisionEnd {
        decision: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_guards: Option<Vec<String>>,
    },

    #[serde(rename = "GUARD_BLOCK_SUMMARY")]
    GuardBlockSummary {
        symbol: Symbol,
        failed_guards: Vec<String>,
    },

    #[serde(rename = "EXIT_FILLED")]
    ExitFilled {
        symbol: Symbol,
        fill_price: Decimal,
        fill_qty: Decimal,
        reason: String,
    },

    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        #[serde(skip_serializing_if = "Option::is_none")]
        cycle: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        positions: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbols: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    #[serde(rename = "SHUTDOWN_HEARTBEAT")]
    ShutdownHeartbeat {
        registered_components: usize,
        registered_threads: Vec<String>,
        recent_heartbeats: Vec<String>,
        stats: serde_json::Value,
    },

    #[serde(rename = "CONFIG_SNAPSHOT")]
    ConfigSnapshot {
        config: serde_json::Value,
        engine_version: String,
        snapshot_reason: String,
    },

    #[serde(rename = "CONFIG_CHANGE")]
    ConfigChange {
        parameter: String,
        old: String,
        new: String,
        reason: String,
    },
}

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    #[serde(flatten)]
    pub event: Event,
}

/// Append-only JSONL sink. Write failures are logged and swallowed: losing
/// an observability record must never take down the engine.
pub struct EventLog {
    writer: Mutex<BufWriter<File>>,
    path: String,
}

impl EventLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.display().to_string(),
        })
    }

    pub fn emit(&self, event: Event) {
        let record = EventRecord {
            ts: rfc3339_now(),
            event,
        };
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "event serialization failed");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(path = %self.path, error = %e, "event log write failed");
        }
    }

    pub fn flush(&self) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.flush() {
            warn!(path = %self.path, error = %e, "event log flush failed");
        }
    }
}
