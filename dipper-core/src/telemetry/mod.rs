//! Telemetry: prometheus families, rolling stats, intent latency.

pub mod metrics;
pub mod stats;

pub use metrics::Metrics;
pub use stats::{Intent, IntentTracker, RollingWindowStats};
