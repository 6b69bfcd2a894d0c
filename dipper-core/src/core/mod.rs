//! Core domain types: symbols, tickers, bars, order lifecycle, cooldowns.

pub mod clock;
pub mod coid;
pub mod cooldown;
pub mod errors;
pub mod order_fsm;
pub mod types;

pub use coid::client_order_id;
pub use cooldown::{CooldownManager, CooldownStats};
pub use errors::{ExchangeError, FsmError, PersistError};
pub use order_fsm::{FsmRegistry, OrderFsm, OrderState, StateTransition};
pub use types::{
    ceil_to_step, floor_to_step, round_price_to_tick, size_buy_from_quote, Bar, MarketInfo,
    OrderBook, OrderType, Side, SizingError, Symbol, Ticker, TimeInForce,
};
