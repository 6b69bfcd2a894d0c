//! Configuration
//!
//! One statically-typed config struct: defaults in code, an optional JSON
//! overlay file, then environment-variable overrides for the recognized keys
//! (`MAX_POSITIONS`, `DROP_TRIGGER_MODE`, ...). Unknown env keys are ignored;
//! unknown overlay fields are rejected. Validation runs at startup and fails
//! with a precise reason.

use crate::market::anchor::AnchorMode;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub engine: EngineSettings,
    pub sizing: SizingSettings,
    pub trigger: TriggerSettings,
    pub anchors: AnchorSettings,
    pub guards: GuardSettings,
    pub exits: ExitSettings,
    pub market_data: MarketDataSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Cap on simultaneously open positions
    pub max_positions: usize,
    /// Symbols the engine watches for entries
    pub watchlist: Vec<String>,
    /// Market-wide reference symbol
    pub btc_symbol: String,
    pub quote_asset: String,
    /// Main loop sleep quantum (ms)
    pub cycle_quantum_ms: u64,
    pub md_update_interval_s: u64,
    pub exit_processing_interval_s: u64,
    pub position_check_interval_s: u64,
    /// Cooldown applied after fills and after failed orders (s)
    pub symbol_cooldown_after_failed_order_s: i64,
    /// Open buy orders older than this are canceled and expired (s)
    pub order_poll_timeout_s: i64,
    pub on_insufficient_budget: BudgetPolicy,
    /// Dashboard staleness marker for published snapshots (s)
    pub snapshot_stale_ttl_s: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_positions: 10,
            watchlist: Vec::new(),
            btc_symbol: "BTC/USDT".to_string(),
            quote_asset: "USDT".to_string(),
            cycle_quantum_ms: 500,
            md_update_interval_s: 5,
            exit_processing_interval_s: 1,
            position_check_interval_s: 2,
            symbol_cooldown_after_failed_order_s: 60,
            order_poll_timeout_s: 10,
            on_insufficient_budget: BudgetPolicy::Wait,
            snapshot_stale_ttl_s: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPolicy {
    /// Block at startup until the quote budget covers one slot
    Wait,
    /// Run without placing buys
    Observe,
}

impl FromStr for BudgetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(BudgetPolicy::Wait),
            "observe" => Ok(BudgetPolicy::Observe),
            other => Err(format!("on_insufficient_budget must be wait|observe, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingSettings {
    /// Quote budget per buy attempt
    pub position_size_usdt: Decimal,
    /// Skip buys below this budget
    pub min_slot_usdt: Decimal,
    pub max_slippage_bps_entry: i64,
    pub max_slippage_bps_exit: i64,
    pub max_spread_bps_entry: i64,
}

impl Default for SizingSettings {
    fn default() -> Self {
        Self {
            position_size_usdt: Decimal::from(50),
            min_slot_usdt: Decimal::from(10),
            max_slippage_bps_entry: 30,
            max_slippage_bps_exit: 50,
            max_spread_bps_entry: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Price factor; `1 - x` is the drop percentage that triggers
    pub drop_trigger_value: Decimal,
    /// Anchor computation mode 1..=4
    pub drop_trigger_mode: u8,
    /// Rolling window length (minutes)
    pub lookback_min: u64,
    pub hysteresis_bps: i64,
    pub debounce_s: i64,
    pub confirm_ticks: u32,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            drop_trigger_value: Decimal::new(98, 2), // 0.98
            drop_trigger_mode: 4,
            lookback_min: 15,
            hysteresis_bps: 20,
            debounce_s: 15,
            confirm_ticks: 1,
        }
    }
}

impl TriggerSettings {
    /// Nominal trigger threshold in basis points.
    pub fn threshold_bp(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        let bp = (Decimal::ONE - self.drop_trigger_value) * Decimal::from(10_000);
        bp.to_i64().unwrap_or(0)
    }

    pub fn mode(&self) -> Result<AnchorMode> {
        AnchorMode::try_from(self.drop_trigger_mode).map_err(anyhow::Error::msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSettings {
    pub clamp_max_above_peak_pct: Decimal,
    pub max_start_drop_pct: Decimal,
    pub stale_minutes: i64,
    pub max_age_hours: i64,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            clamp_max_above_peak_pct: Decimal::new(5, 1), // 0.5
            max_start_drop_pct: Decimal::from(8),
            stale_minutes: 60,
            max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    pub use_spread_guard: bool,
    pub max_spread_bps: Decimal,
    pub use_sma_guard: bool,
    pub sma_window: usize,
    pub sma_min_ratio: Decimal,
    pub use_volume_guard: bool,
    pub volume_window: usize,
    pub volume_factor: Decimal,
    pub use_volatility_guard: bool,
    pub volatility_window: usize,
    pub require_vol_sigma_bps_min: f64,
    pub use_btc_filter: bool,
    pub btc_change_threshold: Decimal,
    pub use_falling_coins_filter: bool,
    pub falling_threshold: Decimal,
    /// Seconds between guard block summary emissions
    pub summary_window_s: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            use_spread_guard: true,
            max_spread_bps: Decimal::from(50),
            use_sma_guard: false,
            sma_window: 20,
            sma_min_ratio: Decimal::new(97, 2), // 0.97
            use_volume_guard: false,
            volume_window: 20,
            volume_factor: Decimal::new(5, 1), // 0.5
            use_volatility_guard: false,
            volatility_window: 30,
            require_vol_sigma_bps_min: 2.0,
            use_btc_filter: true,
            btc_change_threshold: Decimal::new(99, 2), // 0.99
            use_falling_coins_filter: true,
            falling_threshold: Decimal::new(6, 1), // 0.6
            summary_window_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSettings {
    pub take_profit_threshold: Decimal,
    pub stop_loss_threshold: Decimal,
    pub use_trailing_stop: bool,
    pub trailing_activation_pct: Decimal,
    pub trailing_distance_pct: Decimal,
    /// Time-based exit threshold (minutes); 0 disables
    pub trade_ttl_min: i64,
    pub never_market_sells: bool,
    /// Allow a market fallback when the TIME rule fires (conflicts with
    /// `never_market_sells`)
    pub time_exit_market_fallback: bool,
    pub exit_ladder_bps: Vec<i64>,
    pub exit_step_ttl_s: i64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            take_profit_threshold: Decimal::new(105, 2), // 1.05
            stop_loss_threshold: Decimal::new(95, 2),    // 0.95
            use_trailing_stop: false,
            trailing_activation_pct: Decimal::ONE,
            trailing_distance_pct: Decimal::from(2),
            trade_ttl_min: 60,
            never_market_sells: false,
            time_exit_market_fallback: false,
            exit_ladder_bps: vec![50, 100, 200, 500],
            exit_step_ttl_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    pub ticker_ttl_s: u64,
    pub cache_max_size: usize,
    pub fallback_tolerance_s: u64,
    pub timeframe: String,
    pub history_max_bars: usize,
    pub backfill_minutes: usize,
    pub circuit_failure_threshold: u32,
    pub circuit_timeout_s: u64,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            ticker_ttl_s: 5,
            cache_max_size: 1000,
            fallback_tolerance_s: 30,
            timeframe: "1m".to_string(),
            history_max_bars: 1000,
            backfill_minutes: 120,
            circuit_failure_threshold: 5,
            circuit_timeout_s: 60,
        }
    }
}

impl Config {
    /// Defaults -> optional JSON overlay -> environment overrides -> validate.
    pub fn load(overlay: Option<&Path>) -> Result<Self> {
        let mut config = match overlay {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading config overlay {}", path.display()))?;
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing config overlay {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply recognized environment variables over the current values.
    pub fn apply_env(&mut self) {
        env_set(&mut self.engine.max_positions, "MAX_POSITIONS");
        env_set(&mut self.sizing.position_size_usdt, "POSITION_SIZE_USDT");
        env_set(&mut self.sizing.min_slot_usdt, "MIN_SLOT_USDT");
        env_set(&mut self.exits.trade_ttl_min, "TRADE_TTL_MIN");
        env_set(&mut self.trigger.drop_trigger_value, "DROP_TRIGGER_VALUE");
        env_set(&mut self.trigger.drop_trigger_mode, "DROP_TRIGGER_MODE");
        env_set(&mut self.trigger.lookback_min, "DROP_TRIGGER_LOOKBACK_MIN");
        env_set(&mut self.exits.take_profit_threshold, "TAKE_PROFIT_THRESHOLD");
        env_set(&mut self.exits.stop_loss_threshold, "STOP_LOSS_THRESHOLD");
        env_set_bool(&mut self.exits.use_trailing_stop, "USE_TRAILING_STOP");
        env_set(&mut self.exits.trailing_activation_pct, "TRAILING_ACTIVATION_PCT");
        env_set(&mut self.exits.trailing_distance_pct, "TRAILING_DISTANCE_PCT");
        env_set(&mut self.trigger.hysteresis_bps, "HYSTERESIS_BPS");
        env_set(&mut self.trigger.debounce_s, "DEBOUNCE_S");
        env_set(&mut self.trigger.confirm_ticks, "CONFIRM_TICKS");
        env_set(&mut self.sizing.max_slippage_bps_entry, "MAX_SLIPPAGE_BPS_ENTRY");
        env_set(&mut self.sizing.max_slippage_bps_exit, "MAX_SLIPPAGE_BPS_EXIT");
        env_set(&mut self.sizing.max_spread_bps_entry, "MAX_SPREAD_BPS_ENTRY");
        env_set_bool(&mut self.exits.never_market_sells, "NEVER_MARKET_SELLS");
        env_set_list(&mut self.exits.exit_ladder_bps, "EXIT_LADDER_BPS");
        env_set_list(&mut self.exits.exit_ladder_bps, "EXIT_ESCALATION_BPS");
        env_set(
            &mut self.engine.symbol_cooldown_after_failed_order_s,
            "SYMBOL_COOLDOWN_AFTER_FAILED_ORDER_S",
        );
        env_set(
            &mut self.anchors.clamp_max_above_peak_pct,
            "ANCHOR_CLAMP_MAX_ABOVE_PEAK_PCT",
        );
        env_set(&mut self.anchors.max_start_drop_pct, "ANCHOR_MAX_START_DROP_PCT");
        env_set(&mut self.anchors.stale_minutes, "ANCHOR_STALE_MINUTES");
        env_set(&mut self.anchors.max_age_hours, "ANCHOR_MAX_AGE_HOURS");
        env_set(&mut self.engine.snapshot_stale_ttl_s, "SNAPSHOT_STALE_TTL_S");
        env_set_bool(&mut self.guards.use_spread_guard, "USE_SPREAD_GUARD");
        env_set(&mut self.guards.max_spread_bps, "GUARD_MAX_SPREAD_BPS");
        env_set_bool(&mut self.guards.use_sma_guard, "USE_SMA_GUARD");
        env_set(&mut self.guards.sma_min_ratio, "SMA_GUARD_MIN_RATIO");
        env_set_bool(&mut self.guards.use_volume_guard, "USE_VOLUME_GUARD");
        env_set(&mut self.guards.volume_factor, "VOLUME_GUARD_FACTOR");
        env_set_bool(&mut self.guards.use_volatility_guard, "USE_VOLATILITY_GUARD");
        env_set(
            &mut self.guards.require_vol_sigma_bps_min,
            "REQUIRE_VOL_SIGMA_BPS_MIN",
        );
        env_set_bool(&mut self.guards.use_btc_filter, "USE_BTC_FILTER");
        env_set(&mut self.guards.btc_change_threshold, "BTC_CHANGE_THRESHOLD");
        env_set_bool(
            &mut self.guards.use_falling_coins_filter,
            "USE_FALLING_COINS_FILTER",
        );
        env_set(&mut self.guards.falling_threshold, "FALLING_THRESHOLD");
        if let Ok(value) = std::env::var("ON_INSUFFICIENT_BUDGET") {
            if let Ok(policy) = value.parse() {
                self.engine.on_insufficient_budget = policy;
            }
        }
        if let Ok(value) = std::env::var("TOPCOINS") {
            let list: Vec<String> = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                self.engine.watchlist = list;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.trigger.mode()?;

        if self.engine.max_positions == 0 {
            bail!("MAX_POSITIONS must be at least 1");
        }
        if self.trigger.drop_trigger_value <= Decimal::ZERO
            || self.trigger.drop_trigger_value >= Decimal::ONE
        {
            bail!(
                "DROP_TRIGGER_VALUE must be inside (0, 1), got {}",
                self.trigger.drop_trigger_value
            );
        }
        if self.trigger.lookback_min == 0 {
            bail!("DROP_TRIGGER_LOOKBACK_MIN must be positive");
        }
        if self.trigger.confirm_ticks == 0 {
            bail!("CONFIRM_TICKS must be at least 1");
        }
        if self.sizing.position_size_usdt <= Decimal::ZERO {
            bail!("POSITION_SIZE_USDT must be positive");
        }
        if self.sizing.min_slot_usdt <= Decimal::ZERO {
            bail!("MIN_SLOT_USDT must be positive");
        }
        if self.exits.take_profit_threshold <= Decimal::ONE {
            bail!(
                "TAKE_PROFIT_THRESHOLD must exceed 1.0, got {}",
                self.exits.take_profit_threshold
            );
        }
        if self.exits.stop_loss_threshold >= Decimal::ONE
            || self.exits.stop_loss_threshold <= Decimal::ZERO
        {
            bail!(
                "STOP_LOSS_THRESHOLD must be inside (0, 1), got {}",
                self.exits.stop_loss_threshold
            );
        }
        if self.exits.trade_ttl_min < 0 {
            bail!("TRADE_TTL_MIN must not be negative");
        }
        if self.exits.never_market_sells && self.exits.time_exit_market_fallback {
            bail!(
                "NEVER_MARKET_SELLS=true conflicts with time_exit_market_fallback=true: \
                 a TIME exit could never fall back to a market order"
            );
        }
        let mut prev = 0;
        for bps in &self.exits.exit_ladder_bps {
            if *bps <= prev {
                bail!("EXIT_LADDER_BPS must be strictly increasing positive values");
            }
            prev = *bps;
        }
        if self.guards.falling_threshold < Decimal::ZERO
            || self.guards.falling_threshold > Decimal::ONE
        {
            bail!("FALLING_THRESHOLD must be inside [0, 1]");
        }
        Ok(())
    }
}

fn env_set<T: FromStr>(target: &mut T, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_set_bool(target: &mut bool, key: &str) {
    if let Ok(value) = std::env::var(key) {
        *target = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
}

fn env_set_list(target: &mut Vec<i64>, key: &str) {
    if let Ok(value) = std::env::var(key) {
        let parsed: Vec<i64> = value
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if !parsed.is_empty() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_threshold_bp_from_factor() {
        let trigger = TriggerSettings {
            drop_trigger_value: dec!(0.98),
            ..TriggerSettings::default()
        };
        assert_eq!(trigger.threshold_bp(), 200);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut config = Config::default();
        config.trigger.drop_trigger_mode = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_market_sell_conflict_rejected() {
        let mut config = Config::default();
        config.exits.never_market_sells = true;
        config.exits.time_exit_market_fallback = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("NEVER_MARKET_SELLS"));
    }

    #[test]
    fn test_ladder_must_increase() {
        let mut config = Config::default();
        config.exits.exit_ladder_bps = vec![50, 50];
        assert!(config.validate().is_err());
        config.exits.exit_ladder_bps = vec![50, 100, 200];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(&path, br#"{"engine": {"max_positions": 3}, "nope": 1}"#).unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_overlay_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(
            &path,
            br#"{"engine": {"max_positions": 3}, "sizing": {"position_size_usdt": "25"}}"#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.engine.max_positions, 3);
        assert_eq!(config.sizing.position_size_usdt, dec!(25));
    }
}
