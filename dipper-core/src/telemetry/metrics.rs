//! Prometheus metric families
//!
//! Counters, gauges, and histograms for trading activity, latency, and
//! equity. There is no HTTP endpoint; the periodic performance summary
//! text-encodes the registry into the structured log.

use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::info;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Orders submitted, by side and type
    pub orders_total: IntCounterVec,
    /// Fills observed, by side
    pub fills_total: IntCounterVec,
    /// Order placement failures, by error kind
    pub order_failures_total: IntCounterVec,
    /// Guard blocks, by guard name
    pub guard_blocks_total: IntCounterVec,
    /// Buy decisions, by outcome reason
    pub decisions_total: IntCounterVec,
    /// Exit signals, by reason
    pub exit_signals_total: IntCounterVec,

    /// Engine cycle wall time (seconds)
    pub cycle_latency: Histogram,
    /// Market-data batch refresh wall time (seconds)
    pub md_refresh_latency: Histogram,
    /// Intent creation to first fill (seconds)
    pub decision_latency: Histogram,

    pub equity: Gauge,
    pub realized_pnl: Gauge,
    pub unrealized_pnl: Gauge,
    pub open_positions: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_total = IntCounterVec::new(
            Opts::new("trading_orders_total", "Orders submitted").namespace("dipper"),
            &["side", "type"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let fills_total = IntCounterVec::new(
            Opts::new("trading_fills_total", "Fills observed").namespace("dipper"),
            &["side"],
        )?;
        registry.register(Box::new(fills_total.clone()))?;

        let order_failures_total = IntCounterVec::new(
            Opts::new("trading_order_failures_total", "Order placement failures")
                .namespace("dipper"),
            &["kind"],
        )?;
        registry.register(Box::new(order_failures_total.clone()))?;

        let guard_blocks_total = IntCounterVec::new(
            Opts::new("guards_blocks_total", "Entry guard blocks").namespace("dipper"),
            &["guard"],
        )?;
        registry.register(Box::new(guard_blocks_total.clone()))?;

        let decisions_total = IntCounterVec::new(
            Opts::new("engine_decisions_total", "Buy decisions by outcome").namespace("dipper"),
            &["outcome"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let exit_signals_total = IntCounterVec::new(
            Opts::new("engine_exit_signals_total", "Exit signals by reason").namespace("dipper"),
            &["reason"],
        )?;
        registry.register(Box::new(exit_signals_total.clone()))?;

        let cycle_latency = Histogram::with_opts(
            HistogramOpts::new("engine_cycle_seconds", "Engine cycle wall time")
                .namespace("dipper")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(cycle_latency.clone()))?;

        let md_refresh_latency = Histogram::with_opts(
            HistogramOpts::new("md_refresh_seconds", "Market-data batch refresh wall time")
                .namespace("dipper")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(md_refresh_latency.clone()))?;

        let decision_latency = Histogram::with_opts(
            HistogramOpts::new("decision_to_fill_seconds", "Intent creation to first fill")
                .namespace("dipper")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(decision_latency.clone()))?;

        let equity = Gauge::with_opts(
            Opts::new("account_equity_quote", "Account equity in quote units").namespace("dipper"),
        )?;
        registry.register(Box::new(equity.clone()))?;

        let realized_pnl = Gauge::with_opts(
            Opts::new("pnl_realized_net_quote", "Realized net PnL").namespace("dipper"),
        )?;
        registry.register(Box::new(realized_pnl.clone()))?;

        let unrealized_pnl = Gauge::with_opts(
            Opts::new("pnl_unrealized_quote", "Unrealized PnL").namespace("dipper"),
        )?;
        registry.register(Box::new(unrealized_pnl.clone()))?;

        let open_positions = IntGauge::with_opts(
            Opts::new("engine_open_positions", "Open position count").namespace("dipper"),
        )?;
        registry.register(Box::new(open_positions.clone()))?;

        info!("metrics registry initialized");
        Ok(Self {
            registry,
            orders_total,
            fills_total,
            order_failures_total,
            guard_blocks_total,
            decisions_total,
            exit_signals_total,
            cycle_latency,
            md_refresh_latency,
            decision_latency,
            equity,
            realized_pnl,
            unrealized_pnl,
            open_positions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition for the periodic performance summary.
    pub fn encode_text(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.orders_total.with_label_values(&["BUY", "LIMIT"]).inc();
        metrics.guard_blocks_total.with_label_values(&["spread_guard"]).inc();
        metrics.equity.set(1234.5);

        let text = metrics.encode_text();
        assert!(text.contains("dipper_trading_orders_total"));
        assert!(text.contains("dipper_guards_blocks_total"));
        assert!(text.contains("dipper_account_equity_quote"));
    }
}
