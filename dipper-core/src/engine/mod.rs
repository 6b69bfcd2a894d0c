//! Trading engine: orchestrator, order gateway, exits, positions, PnL.

pub mod engine;
pub mod exits;
pub mod orders;
pub mod pnl;
pub mod positions;
pub mod traits;

pub use engine::{market_data_config, Engine, EngineStats, ENGINE_VERSION};
pub use exits::{
    evaluate_exit, EnqueueResult, ExitConfig, ExitDecision, ExitFill, ExitManager, ExitQueue,
    ExitReason, ExitRules, ExitSignal,
};
pub use orders::{FillDelta, OrderGateway, PlaceError};
pub use pnl::{FillEvent, PnlPosition, PnlService, PnlSummary};
pub use positions::{Position, PositionBook};
pub use traits::{
    BuySignal, EntryGuards, GuardCounter, GuardVerdict, SignalSnapshot, TriggerEval, TriggerReason,
};
