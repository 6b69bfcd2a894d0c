//! Dipper Signals - drop-trigger pipeline and entry guards
//!
//! Implementations of the `BuySignal` and `EntryGuards` seams from
//! `dipper-core`:
//! - `DropPipeline`: anchors + rolling window + hysteresis/debounce trigger
//!   + confirmation stabilizer
//! - `GuardStack`: spread, SMA, volume, volatility, BTC, and falling-coins
//!   filters with per-guard counters

pub mod drop_trigger;
pub mod guards;
pub mod pipeline;
pub mod rolling_window;
pub mod stabilizer;

pub use drop_trigger::{DropTrigger, DropTriggerConfig};
pub use guards::GuardStack;
pub use pipeline::{DropPipeline, DropPipelineConfig};
pub use rolling_window::{RollingWindow, WindowSet};
pub use stabilizer::Stabilizer;
