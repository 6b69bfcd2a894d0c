//! Exchange boundary: the client capability, its decorators, and the mock.

pub mod client;
pub mod mock;
pub mod retrying;
pub mod traced;

pub use client::{
    AssetBalance, Balance, ExchangeClient, ExchangeOrder, OrderRequest, TradeRecord,
    WireOrderStatus,
};
pub use mock::{FillMode, MockExchange};
pub use retrying::{RetryConfig, RetryingClient};
pub use traced::{OpStats, TracedClient};
