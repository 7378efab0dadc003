// =============================================================================
// Runtime Configuration — engine settings with atomic save and env overrides
// =============================================================================
//
// Central configuration hub for the Meridian agent. Persistence goes
// through the shared durable-write primitive (tmp + fsync + locked rename)
// to prevent corruption on crash. All fields carry serde defaults so that
// adding new fields never breaks loading an older config file.
//
// Environment variables recognized at startup (applied after file load):
//   PAPER_TRADING, MIN_CAPITAL_PER_TRADE, MAX_CAPITAL_PER_TRADE,
//   MAX_TOTAL_POSITIONS, STOP_LOSS_PCT, TAKE_PROFIT_PCT,
//   SCAN_INTERVAL_SECONDS, DAILY_LOSS_LIMIT
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_ignored_bases() -> Vec<String> {
    Vec::new()
}

fn default_stablecoin_bases() -> Vec<String> {
    ["USDC", "FDUSD", "TUSD", "DAI", "BUSD", "USDP", "EUR"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_capital_per_trade() -> f64 {
    11.0
}

fn default_max_capital_per_trade() -> f64 {
    30.0
}

fn default_base_position_pct() -> f64 {
    2.0
}

fn default_max_total_positions() -> u32 {
    8
}

fn default_daily_loss_limit() -> f64 {
    5.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_min_cycle_interval_secs() -> u64 {
    3
}

fn default_max_cycle_interval_secs() -> u64 {
    30
}

fn default_phase_budget_secs() -> u64 {
    60
}

fn default_scan_workers() -> usize {
    8
}

fn default_top_k() -> usize {
    25
}

fn default_regime_sample_size() -> usize {
    50
}

fn default_signal_ttl_secs() -> u64 {
    60
}

fn default_pending_ttl_secs() -> u64 {
    120
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_rule_refresh_interval_secs() -> u64 {
    3600
}

fn default_decay_timeout_secs() -> u64 {
    7200
}

fn default_decay_max_gain_pct() -> f64 {
    0.5
}

fn default_recycle_min_gain_pct() -> f64 {
    0.5
}

fn default_recycle_max_gain_pct() -> f64 {
    1.0
}

fn default_recycle_quality_drop() -> f64 {
    15.0
}

fn default_min_profit_buffer() -> f64 {
    0.10
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_stop_loss_floor_pct() -> f64 {
    0.5
}

fn default_stop_loss_cap_pct() -> f64 {
    5.0
}

fn default_state_path() -> String {
    "meridian_state.json".to_string()
}

fn default_ledger_path() -> String {
    "meridian_trades.jsonl".to_string()
}

fn default_learning_path() -> String {
    "meridian_learning.json".to_string()
}

fn default_rules_cache_path() -> String {
    "meridian_rules.json".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian agent.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational mode ----------------------------------------------------
    /// When true, orders are recorded and filled locally and never reach the
    /// exchange.
    #[serde(default = "default_true")]
    pub paper_trading: bool,

    // --- Universe ------------------------------------------------------------
    /// Quote currency every tradable pair must settle in.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Bases the operator never wants traded regardless of score.
    #[serde(default = "default_ignored_bases")]
    pub ignored_bases: Vec<String>,

    /// Stablecoin bases excluded from the universe (no edge in quote/stable).
    #[serde(default = "default_stablecoin_bases")]
    pub stablecoin_bases: Vec<String>,

    // --- Capital & limits ----------------------------------------------------
    /// Minimum quote notional per entry.
    #[serde(default = "default_min_capital_per_trade")]
    pub min_capital_per_trade: f64,

    /// Maximum quote notional per entry.
    #[serde(default = "default_max_capital_per_trade")]
    pub max_capital_per_trade: f64,

    /// Base position size as a percentage of available capital, before tier
    /// and regime multipliers.
    #[serde(default = "default_base_position_pct")]
    pub base_position_pct: f64,

    /// Maximum number of concurrently open positions.
    #[serde(default = "default_max_total_positions")]
    pub max_total_positions: u32,

    /// Daily realized-loss limit in quote currency; breaching it trips the
    /// circuit breaker.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    /// Consecutive losing trades before the circuit breaker trips.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    // --- Cycle cadence -------------------------------------------------------
    /// Nominal cycle interval in seconds.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Cycle floor, used in STRONG_BULL.
    #[serde(default = "default_min_cycle_interval_secs")]
    pub min_cycle_interval_secs: u64,

    /// Cycle ceiling, used in FLAT / STRONG_BEAR.
    #[serde(default = "default_max_cycle_interval_secs")]
    pub max_cycle_interval_secs: u64,

    /// Hard budget per IO-bound phase; overruns are cancelled.
    #[serde(default = "default_phase_budget_secs")]
    pub phase_budget_secs: u64,

    /// Bounded fan-out width for ScanPhase / AwarenessPhase exchange IO.
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,

    // --- Scoring -------------------------------------------------------------
    /// Opportunities returned per cycle (top-K by composite).
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Top-N symbols by volume sampled by the regime detector.
    #[serde(default = "default_regime_sample_size")]
    pub regime_sample_size: usize,

    /// Signals older than this are rejected by the scorer.
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,

    // --- Execution -----------------------------------------------------------
    /// Pending buys older than this are cancelled.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,

    /// Seconds between reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Seconds between symbol-rule refreshes.
    #[serde(default = "default_rule_refresh_interval_secs")]
    pub rule_refresh_interval_secs: u64,

    // --- Exits ---------------------------------------------------------------
    /// Age after which a position with < `decay_max_gain_pct` unrealized gain
    /// is closed as alpha decay.
    #[serde(default = "default_decay_timeout_secs")]
    pub decay_timeout_secs: u64,

    /// Unrealized-gain ceiling (percent) below which the decay timeout fires.
    #[serde(default = "default_decay_max_gain_pct")]
    pub decay_max_gain_pct: f64,

    /// Recycle-profit window: unrealized gain must be inside
    /// [recycle_min_gain_pct, recycle_max_gain_pct] percent...
    #[serde(default = "default_recycle_min_gain_pct")]
    pub recycle_min_gain_pct: f64,

    #[serde(default = "default_recycle_max_gain_pct")]
    pub recycle_max_gain_pct: f64,

    /// ...and the symbol's opportunity quality must have dropped at least this
    /// many composite points since entry.
    #[serde(default = "default_recycle_quality_drop")]
    pub recycle_quality_drop: f64,

    /// Minimum net profit (quote currency) a take-profit must clear after
    /// fees, otherwise the opportunity is rejected.
    #[serde(default = "default_min_profit_buffer")]
    pub min_profit_buffer: f64,

    /// Per-side fee rate assumed for fee-aware profit checks.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    // --- Stop loss -----------------------------------------------------------
    /// ATR-derived stop-loss percent is clamped to
    /// [stop_loss_floor_pct, stop_loss_cap_pct].
    #[serde(default = "default_stop_loss_floor_pct")]
    pub stop_loss_floor_pct: f64,

    #[serde(default = "default_stop_loss_cap_pct")]
    pub stop_loss_cap_pct: f64,

    /// Fixed stop-loss percent override. When set (e.g. via STOP_LOSS_PCT)
    /// the ATR derivation is bypassed entirely.
    #[serde(default)]
    pub stop_loss_pct_override: Option<f64>,

    /// Fixed take-profit percent override applied to every tier when set.
    #[serde(default)]
    pub take_profit_pct_override: Option<f64>,

    // --- Paths & network -----------------------------------------------------
    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    #[serde(default = "default_learning_path")]
    pub learning_path: String,

    #[serde(default = "default_rules_cache_path")]
    pub rules_cache_path: String,

    /// Bind address for the status probe.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            paper_trading = config.paper_trading,
            quote_asset = %config.quote_asset,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` through the durable-write
    /// primitive (tmp + fsync + locked rename, with a `.bak` snapshot).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        crate::state::durable::durable_write_json(path, self)
            .with_context(|| format!("failed to save runtime config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply recognized environment-variable overrides on top of the loaded
    /// file. Unparseable values are logged and skipped rather than fatal.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PAPER_TRADING") {
            match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => self.paper_trading = true,
                "false" | "0" | "no" => self.paper_trading = false,
                other => warn!(value = other, "unrecognized PAPER_TRADING value, ignoring"),
            }
        }

        Self::override_f64("MIN_CAPITAL_PER_TRADE", &mut self.min_capital_per_trade);
        Self::override_f64("MAX_CAPITAL_PER_TRADE", &mut self.max_capital_per_trade);
        Self::override_f64("DAILY_LOSS_LIMIT", &mut self.daily_loss_limit);

        if let Ok(v) = std::env::var("MAX_TOTAL_POSITIONS") {
            match v.trim().parse::<u32>() {
                Ok(n) => self.max_total_positions = n,
                Err(_) => warn!(value = %v, "unparseable MAX_TOTAL_POSITIONS, ignoring"),
            }
        }

        if let Ok(v) = std::env::var("SCAN_INTERVAL_SECONDS") {
            match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => self.scan_interval_secs = n,
                _ => warn!(value = %v, "unparseable SCAN_INTERVAL_SECONDS, ignoring"),
            }
        }

        if let Ok(v) = std::env::var("STOP_LOSS_PCT") {
            match v.trim().parse::<f64>() {
                Ok(p) if p > 0.0 => self.stop_loss_pct_override = Some(p),
                _ => warn!(value = %v, "unparseable STOP_LOSS_PCT, ignoring"),
            }
        }

        if let Ok(v) = std::env::var("TAKE_PROFIT_PCT") {
            match v.trim().parse::<f64>() {
                Ok(p) if p > 0.0 => self.take_profit_pct_override = Some(p),
                _ => warn!(value = %v, "unparseable TAKE_PROFIT_PCT, ignoring"),
            }
        }
    }

    fn override_f64(name: &str, slot: &mut f64) {
        if let Ok(v) = std::env::var(name) {
            match v.trim().parse::<f64>() {
                Ok(p) if p.is_finite() => *slot = p,
                _ => warn!(var = name, value = %v, "unparseable numeric override, ignoring"),
            }
        }
    }

    /// Startup sanity check. Returns an error for configurations the agent
    /// cannot safely run with (exit code 1 territory).
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_capital_per_trade > 0.0,
            "min_capital_per_trade must be positive"
        );
        anyhow::ensure!(
            self.max_capital_per_trade >= self.min_capital_per_trade,
            "max_capital_per_trade must be >= min_capital_per_trade"
        );
        anyhow::ensure!(self.fee_rate >= 0.0, "fee_rate must be non-negative");
        anyhow::ensure!(
            self.stop_loss_floor_pct > 0.0 && self.stop_loss_cap_pct >= self.stop_loss_floor_pct,
            "stop-loss clamp range is inverted"
        );
        anyhow::ensure!(
            self.min_cycle_interval_secs <= self.scan_interval_secs
                && self.scan_interval_secs <= self.max_cycle_interval_secs,
            "cycle interval must sit between its floor and ceiling"
        );
        anyhow::ensure!(!self.quote_asset.is_empty(), "quote_asset must be set");
        Ok(())
    }
}
