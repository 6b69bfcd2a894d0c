//! Order gateway
//!
//! The single path from a sized decision to a tracked order: loads market
//! filters, applies directional rounding, derives the deterministic client
//! order id, submits, and recovers from duplicate rejections by fetching the
//! already-accepted order. Every submitted order gets an FSM in the shared
//! registry; `sync_order` reconciles venue state into it and reports the
//! fill delta.

use crate::core::coid::client_order_id;
use crate::core::errors::{ExchangeError, FsmError};
use crate::core::order_fsm::{FsmRegistry, OrderFsm, OrderState};
use crate::core::types::{
    floor_to_step, round_price_to_tick, MarketInfo, OrderType, Side, SizingError, Symbol,
    TimeInForce,
};
use crate::exchange::client::{ExchangeClient, ExchangeOrder, OrderRequest, WireOrderStatus};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PlaceError {
    #[error("sizing rejected: {}", .0.reason())]
    Sizing(SizingError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
}

/// Quantity/price/fee delta observed by one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillDelta {
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

pub struct OrderGateway<X> {
    client: Arc<X>,
    registry: Arc<FsmRegistry>,
    markets: RwLock<HashMap<Symbol, MarketInfo>>,
}

impl<X: ExchangeClient> OrderGateway<X> {
    pub fn new(client: Arc<X>, registry: Arc<FsmRegistry>) -> Self {
        Self {
            client,
            registry,
            markets: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<FsmRegistry> {
        &self.registry
    }

    /// Load (or refresh) the market filter table.
    pub fn load_markets(&self, reload: bool) -> Result<usize, ExchangeError> {
        let markets = self.client.load_markets(reload)?;
        let count = markets.len();
        *self.markets.write() = markets;
        Ok(count)
    }

    /// Filters for a symbol; unrestricted when the venue reported none.
    pub fn market(&self, symbol: &Symbol) -> MarketInfo {
        self.markets
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(MarketInfo::unrestricted)
    }

    /// Open orders at the venue for one symbol (crash recovery scan).
    pub fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.client.fetch_open_orders(symbol)
    }

    /// Current best bid, for ladder escalation price references.
    pub fn ticker_bid(&self, symbol: &Symbol) -> Option<Decimal> {
        self.client
            .fetch_ticker(symbol)
            .ok()
            .filter(|t| t.bid > Decimal::ZERO)
            .map(|t| t.bid)
    }

    /// Place an order with precision rounding and duplicate recovery.
    ///
    /// BUY quantities are expected to be pre-sized (`size_buy_from_quote`);
    /// SELL quantities are floored to the step here, because selling more
    /// than inventory is never acceptable.
    pub fn place_order(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
        tif: TimeInForce,
        post_only: bool,
    ) -> Result<OrderFsm, PlaceError> {
        let market = self.market(symbol);

        let rounded_qty = match side {
            Side::Sell => floor_to_step(qty, market.quantity_step),
            Side::Buy => qty,
        };
        if rounded_qty <= Decimal::ZERO {
            return Err(PlaceError::Sizing(SizingError::QtyRoundedToZero));
        }
        let rounded_price = match price {
            Some(px) if px <= Decimal::ZERO => {
                return Err(PlaceError::Sizing(SizingError::PriceZeroOrNegative))
            }
            Some(px) => Some(round_price_to_tick(px, market.price_tick)),
            None => None,
        };

        let coid = client_order_id(symbol, side, rounded_qty, rounded_price, order_type);
        let request = OrderRequest {
            symbol: symbol.clone(),
            order_type,
            side,
            qty: rounded_qty,
            price: rounded_price,
            tif,
            post_only,
            client_order_id: coid.clone(),
        };

        let order = match self.client.create_order(&request) {
            Ok(order) => order,
            Err(ExchangeError::DuplicateOrder(_)) => {
                // The venue already holds this order; adopt it instead of
                // double-submitting.
                info!(%symbol, client_order_id = %coid, "duplicate order recovered by fetch");
                self.client.fetch_order_by_client_id(&coid, symbol)?
            }
            Err(e) => {
                let mut fsm = OrderFsm::new(
                    format!("local-{coid}"),
                    coid.clone(),
                    symbol.clone(),
                    side,
                    rounded_qty,
                    rounded_price,
                );
                // Submit failures land as FAILED so the audit trail is complete.
                let _ = fsm.fail(&format!("submit failed: {e}"));
                self.registry.insert(fsm);
                return Err(e.into());
            }
        };

        let mut fsm = OrderFsm::new(
            order.order_id.clone(),
            order.client_order_id.clone(),
            symbol.clone(),
            side,
            order.qty,
            order.price,
        );
        Self::apply_exchange_state(&mut fsm, &order)?;
        self.registry.insert(fsm.clone());
        Ok(fsm)
    }

    /// Pull venue state for one order into its FSM. Returns the updated FSM
    /// and the fill delta observed by this reconciliation, if any.
    pub fn sync_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<(OrderFsm, Option<FillDelta>), ExchangeError> {
        let order = self.client.fetch_order(order_id, symbol)?;

        let existing = self.registry.get(order_id);
        let mut fsm = match existing {
            Some(f) => f,
            None => OrderFsm::new(
                order.order_id.clone(),
                order.client_order_id.clone(),
                symbol.clone(),
                order.side,
                order.qty,
                order.price,
            ),
        };

        let delta = Self::fill_delta(&fsm, &order);
        if let Err(e) = Self::apply_exchange_state(&mut fsm, &order) {
            warn!(order_id, error = %e, "fsm refused exchange state");
        }
        self.registry.insert(fsm.clone());
        Ok((fsm, delta))
    }

    /// Cancel and reconcile. Not-found already maps to success inside the
    /// retry decorator.
    pub fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<(OrderFsm, Option<FillDelta>), ExchangeError> {
        let order = self.client.cancel_order(order_id, symbol)?;
        let mut fsm = self
            .registry
            .get(order_id)
            .unwrap_or_else(|| {
                OrderFsm::new(
                    order.order_id.clone(),
                    order.client_order_id.clone(),
                    symbol.clone(),
                    order.side,
                    order.qty,
                    order.price,
                )
            });
        let delta = Self::fill_delta(&fsm, &order);
        if let Err(e) = Self::apply_exchange_state(&mut fsm, &order) {
            warn!(order_id, error = %e, "fsm refused cancel state");
        }
        self.registry.insert(fsm.clone());
        Ok((fsm, delta))
    }

    /// Difference between the venue's cumulative fill and what the FSM has
    /// already recorded, priced so the deltas recompose the venue average.
    fn fill_delta(fsm: &OrderFsm, order: &ExchangeOrder) -> Option<FillDelta> {
        let delta_qty = order.filled - fsm.filled_qty;
        if delta_qty <= Decimal::ZERO {
            return None;
        }
        let venue_avg = order.average_price.unwrap_or(fsm.avg_fill_price);
        let prev_notional = fsm.filled_qty * fsm.avg_fill_price;
        let delta_notional = order.filled * venue_avg - prev_notional;
        let mut price = delta_notional / delta_qty;
        if price <= Decimal::ZERO {
            // Inconsistent venue bookkeeping; fall back to the running average
            price = venue_avg;
        }
        let fee = (order.fee_quote - fsm.total_fees).max(Decimal::ZERO);
        Some(FillDelta {
            qty: delta_qty,
            price,
            fee,
        })
    }

    fn apply_exchange_state(fsm: &mut OrderFsm, order: &ExchangeOrder) -> Result<(), FsmError> {
        if let Some(delta) = Self::fill_delta(fsm, order) {
            fsm.record_fill(delta.qty, delta.price, delta.fee, true)?;
        }
        match order.status {
            WireOrderStatus::Open => {}
            WireOrderStatus::Closed => {
                if !fsm.state.is_terminal() {
                    fsm.transition(OrderState::Filled, "venue reports closed")?;
                }
            }
            WireOrderStatus::Canceled => {
                if !fsm.state.is_terminal() {
                    fsm.cancel("venue reports canceled")?;
                }
            }
            WireOrderStatus::Expired => {
                if !fsm.state.is_terminal() {
                    fsm.expire("venue reports expired")?;
                }
            }
            WireOrderStatus::Rejected => {
                if !fsm.state.is_terminal() {
                    fsm.fail("venue rejected")?;
                }
            }
        }
        Ok(())
    }
}
