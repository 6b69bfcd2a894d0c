//! Dipper Core - drop-trigger spot trading engine
//!
//! Dipper watches a curated symbol universe, measures drops against dynamic
//! reference anchors, opens a bounded number of long positions when the
//! entry guards agree, and manages every position to a deterministic exit
//! (take-profit, stop-loss, trailing, time-to-live).
//!
//! ## Architecture
//! - One engine thread drives the control loop on a fixed cadence
//! - All venue access goes through a single `ExchangeClient` capability with
//!   retry, timeout, and tracing decorators
//! - Order-affecting arithmetic is decimal end to end; floats exist only in
//!   telemetry
//! - State files are replaced atomically; the event log and PnL ledger are
//!   append-only JSONL
//!
//! ## Core Modules
//! - `core`: symbols, tickers, order FSM, cooldowns, client order ids
//! - `exchange`: the client capability, decorators, and the scriptable mock
//! - `market`: ticker cache, OHLCV history, anchors, degraded fallback
//! - `engine`: orchestrator, buy path, exits, positions, PnL
//! - `runtime`: shutdown coordination, event bus
//! - `telemetry`: prometheus families, rolling stats, intent latency
//! - `persist`: session directory, atomic state files, structured events

pub mod config;
pub mod core;
pub mod engine;
pub mod exchange;
pub mod market;
pub mod persist;
pub mod runtime;
pub mod telemetry;

pub use config::Config;
pub use core::{ExchangeError, FsmError, OrderFsm, OrderState, PersistError, Symbol};
pub use engine::{BuySignal, Engine, EntryGuards, EngineStats};
pub use exchange::{ExchangeClient, MockExchange, RetryConfig, RetryingClient, TracedClient};
pub use market::{AnchorManager, AnchorMode, MarketDataProvider};
pub use persist::SessionDirs;
pub use runtime::{EventBus, ShutdownCoordinator, ShutdownRequest};
