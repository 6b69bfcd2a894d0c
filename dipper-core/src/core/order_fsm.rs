//! Order lifecycle state machine
//!
//! Explicit runtime FSM for every submitted order:
//!
//! ```text
//!   PENDING ──► PARTIAL ──► FILLED
//!      │           │           (terminal)
//!      │           ├──► CANCELED
//!      │           └──► EXPIRED
//!      ├──► FILLED / CANCELED / EXPIRED / FAILED
//!      (FAILED only from PENDING)
//! ```
//!
//! Terminal states never transition again; attempting to is a programming
//! error surfaced as [`FsmError::TerminalState`]. Every transition is
//! appended to the order's history so post-mortems can replay the lifecycle.

use crate::core::clock::now_s;
use crate::core::errors::FsmError;
use crate::core::types::{Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Fraction of total quantity that may remain unfilled while the order still
/// counts as fully filled (dust from venue-side rounding). The same tolerance
/// bounds overfill: anything past `total_qty * (1 + tolerance)` is logged,
/// never rejected, because the venue's accounting wins.
pub const FILL_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Submitted, no fills yet
    Pending,
    /// Partially filled
    Partial,
    /// Fully filled (terminal)
    Filled,
    /// Canceled by user or system (terminal)
    Canceled,
    /// Expired, e.g. IOC timeout (terminal)
    Expired,
    /// Failed to submit (terminal)
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Expired | OrderState::Failed
        )
    }

    /// Whether a transition to `next` is permitted from this state.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            OrderState::Pending => matches!(
                next,
                OrderState::Partial
                    | OrderState::Filled
                    | OrderState::Canceled
                    | OrderState::Expired
                    | OrderState::Failed
            ),
            OrderState::Partial => matches!(
                next,
                OrderState::Filled | OrderState::Canceled | OrderState::Expired
            ),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Partial => "partial",
            OrderState::Filled => "filled",
            OrderState::Canceled => "canceled",
            OrderState::Expired => "expired",
            OrderState::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: OrderState,
    pub to: OrderState,
    pub timestamp_s: i64,
    pub reason: String,
}

/// Order lifecycle tracker.
///
/// Serializing and deserializing preserves state, history, and fill metrics
/// (crash recovery reloads these from `open_buy_orders.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFsm {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,

    pub state: OrderState,

    pub total_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub total_fees: Decimal,

    pub created_ts: i64,
    #[serde(default)]
    pub first_fill_ts: Option<i64>,
    #[serde(default)]
    pub completed_ts: Option<i64>,

    pub state_history: Vec<StateTransition>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl OrderFsm {
    pub fn new(
        order_id: impl Into<String>,
        client_order_id: impl Into<String>,
        symbol: Symbol,
        side: Side,
        total_qty: Decimal,
        limit_price: Option<Decimal>,
    ) -> Self {
        let created_ts = now_s();
        Self {
            order_id: order_id.into(),
            client_order_id: client_order_id.into(),
            symbol,
            side,
            state: OrderState::Pending,
            total_qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            limit_price,
            total_fees: Decimal::ZERO,
            created_ts,
            first_fill_ts: None,
            completed_ts: None,
            state_history: vec![StateTransition {
                from: OrderState::Pending,
                to: OrderState::Pending,
                timestamp_s: created_ts,
                reason: "order created".to_string(),
            }],
            metadata: HashMap::new(),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Transition to `next`, recording the step in history.
    ///
    /// Terminal-state violations return [`FsmError::TerminalState`]; the FSM
    /// is left untouched and the caller must abort the current operation.
    pub fn transition(&mut self, next: OrderState, reason: &str) -> Result<(), FsmError> {
        if self.state.is_terminal() {
            error!(
                order_id = %self.order_id,
                state = %self.state,
                attempted = %next,
                "transition from terminal state refused"
            );
            return Err(FsmError::TerminalState {
                order_id: self.order_id.clone(),
                state: self.state.to_string(),
            });
        }
        if !self.state.can_transition_to(next) {
            warn!(
                order_id = %self.order_id,
                from = %self.state,
                to = %next,
                "invalid transition refused"
            );
            return Err(FsmError::InvalidTransition {
                order_id: self.order_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        let ts = now_s();
        self.state_history.push(StateTransition {
            from: self.state,
            to: next,
            timestamp_s: ts,
            reason: reason.to_string(),
        });
        let old = self.state;
        self.state = next;
        if next.is_terminal() {
            self.completed_ts = Some(ts);
        }
        info!(
            order_id = %self.order_id,
            symbol = %self.symbol,
            side = %self.side,
            "{} -> {} | {}", old, next, reason
        );
        Ok(())
    }

    /// Record a fill and (optionally) auto-transition.
    ///
    /// Maintains the cumulative weighted average:
    /// `new_avg = (prev_qty * prev_avg + fill_qty * px) / (prev_qty + fill_qty)`
    pub fn record_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
        fee: Decimal,
        auto_transition: bool,
    ) -> Result<(), FsmError> {
        if self.state.is_terminal() {
            return Err(FsmError::TerminalState {
                order_id: self.order_id.clone(),
                state: self.state.to_string(),
            });
        }
        if fill_qty <= Decimal::ZERO {
            debug!(order_id = %self.order_id, "ignoring non-positive fill quantity");
            return Ok(());
        }

        if self.first_fill_ts.is_none() {
            self.first_fill_ts = Some(now_s());
        }

        let prev_qty = self.filled_qty;
        let new_qty = prev_qty + fill_qty;
        self.avg_fill_price = if prev_qty > Decimal::ZERO {
            (prev_qty * self.avg_fill_price + fill_qty * fill_price) / new_qty
        } else {
            fill_price
        };
        self.filled_qty = new_qty;
        self.total_fees += fee;

        if self.total_qty > Decimal::ZERO
            && self.filled_qty > self.total_qty * (Decimal::ONE + FILL_TOLERANCE)
        {
            warn!(
                order_id = %self.order_id,
                filled = %self.filled_qty,
                total = %self.total_qty,
                "overfill recorded"
            );
        }

        if auto_transition {
            if self.is_fully_filled() {
                self.transition(
                    OrderState::Filled,
                    &format!("fully filled: {}/{}", self.filled_qty, self.total_qty),
                )?;
            } else if self.state == OrderState::Pending {
                self.transition(
                    OrderState::Partial,
                    &format!("partial fill: {}/{}", self.filled_qty, self.total_qty),
                )?;
            }
        }
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), FsmError> {
        self.transition(OrderState::Canceled, reason)
    }

    pub fn expire(&mut self, reason: &str) -> Result<(), FsmError> {
        self.transition(OrderState::Expired, reason)
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), FsmError> {
        self.transition(OrderState::Failed, reason)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `filled / total`; zero-quantity orders report a zero fill rate.
    pub fn fill_rate(&self) -> Decimal {
        if self.total_qty <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.filled_qty / self.total_qty
        }
    }

    /// Filled within tolerance. Zero-quantity orders are never fully filled.
    pub fn is_fully_filled(&self) -> bool {
        if self.total_qty <= Decimal::ZERO {
            return false;
        }
        self.filled_qty >= self.total_qty * (Decimal::ONE - FILL_TOLERANCE)
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.total_qty - self.filled_qty).max(Decimal::ZERO)
    }
}

/// Thread-safe registry of order FSMs.
///
/// Writers are the engine thread and the exit manager; telemetry readers take
/// cloned snapshots and never observe a mid-transition state.
#[derive(Default)]
pub struct FsmRegistry {
    orders: dashmap::DashMap<String, OrderFsm>,
}

impl FsmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fsm: OrderFsm) {
        self.orders.insert(fsm.order_id.clone(), fsm);
    }

    pub fn get(&self, order_id: &str) -> Option<OrderFsm> {
        self.orders.get(order_id).map(|r| r.clone())
    }

    /// Mutate one order under the registry lock.
    pub fn with_order<T>(
        &self,
        order_id: &str,
        f: impl FnOnce(&mut OrderFsm) -> T,
    ) -> Option<T> {
        self.orders.get_mut(order_id).map(|mut r| f(r.value_mut()))
    }

    pub fn remove(&self, order_id: &str) -> Option<OrderFsm> {
        self.orders.remove(order_id).map(|(_, fsm)| fsm)
    }

    pub fn open_orders(&self) -> Vec<OrderFsm> {
        self.orders
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.clone())
            .collect()
    }

    pub fn open_order_for_symbol(&self, symbol: &Symbol, side: Side) -> Option<OrderFsm> {
        self.orders
            .iter()
            .find(|r| !r.state.is_terminal() && &r.symbol == symbol && r.side == side)
            .map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Drop terminal orders older than `max_age_s`, returning the count.
    pub fn prune_terminal(&self, max_age_s: i64) -> usize {
        let cutoff = now_s() - max_age_s;
        let stale: Vec<String> = self
            .orders
            .iter()
            .filter(|r| {
                r.state.is_terminal() && r.completed_ts.map(|ts| ts < cutoff).unwrap_or(false)
            })
            .map(|r| r.order_id.clone())
            .collect();
        for id in &stale {
            self.orders.remove(id);
        }
        stale.len()
    }
}
