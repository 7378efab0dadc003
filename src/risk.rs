// =============================================================================
// Risk & Sizing — notional, TP/SL derivation, trailing schedule, breakers
// =============================================================================
//
// Sizing: notional = base_pct · tier multiplier · regime multiplier ·
// available capital, clamped to the configured per-trade band, then
// normalized to the symbol's tick/lot. Opportunities whose take-profit
// cannot clear fees plus the minimum profit buffer are rejected outright:
// micro-profit trades are worse than no trade.
//
// The circuit breaker gates DecidePhase: daily loss limit, consecutive
// losses, or a CRITICAL reconciliation report put the agent into
// close-only Observing mode.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exchange::SymbolRule;
use crate::regime::Regime;
use crate::runtime_config::RuntimeConfig;
use crate::scoring::{ScoredOpportunity, Tier};
use crate::state::DailyCounters;

// ---------------------------------------------------------------------------
// Plan & rejection
// ---------------------------------------------------------------------------

/// A sized, normalized entry ready for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    pub symbol: String,
    pub tier: Tier,
    pub regime: Regime,
    pub entry_price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub entry_score: f64,
    pub rationale: String,
}

/// Why an opportunity did not become a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanReject {
    #[error("regime multiplier is zero, no new entries")]
    RegimeBlocked,

    #[error("available capital below the per-trade minimum")]
    CapitalExhausted,

    #[error("size below exchange minimum after rounding")]
    BelowMinimum,

    #[error("projected profit does not clear fees plus buffer")]
    MicroProfit,

    #[error("symbol rules missing tick or lot")]
    RulesIncomplete,
}

// ---------------------------------------------------------------------------
// Multipliers & percentages
// ---------------------------------------------------------------------------

/// Regime sizing multiplier. STRONG_BEAR blocks new entries entirely.
pub fn regime_multiplier(regime: Regime) -> f64 {
    match regime {
        Regime::StrongBull => 1.25,
        Regime::Bull => 1.10,
        Regime::Normal => 1.0,
        Regime::Volatile => 0.75,
        Regime::Bear => 0.50,
        Regime::StrongBear => 0.0,
        Regime::Flat => 0.75,
        Regime::Unknown => 0.50,
    }
}

/// ATR multiplier by volatility band: 1.0 low, 1.5 normal, 2.0 high.
fn atr_band_multiplier(atr_pct: f64) -> f64 {
    if atr_pct < 1.0 {
        1.0
    } else if atr_pct <= 3.0 {
        1.5
    } else {
        2.0
    }
}

/// Stop-loss percent: fixed override when configured, otherwise the ATR
/// derivation clamped into [floor, cap]. Falls back to the cap when ATR is
/// unavailable.
pub fn stop_loss_pct(atr_pct: Option<f64>, cfg: &RuntimeConfig) -> f64 {
    if let Some(fixed) = cfg.stop_loss_pct_override {
        return fixed.clamp(cfg.stop_loss_floor_pct, cfg.stop_loss_cap_pct);
    }
    match atr_pct {
        Some(atr) if atr > 0.0 => {
            (atr * atr_band_multiplier(atr)).clamp(cfg.stop_loss_floor_pct, cfg.stop_loss_cap_pct)
        }
        _ => cfg.stop_loss_cap_pct,
    }
}

/// Take-profit percent for a tier, honoring the global override.
pub fn take_profit_pct(tier: Tier, cfg: &RuntimeConfig) -> f64 {
    cfg.take_profit_pct_override.unwrap_or_else(|| tier.take_profit_pct())
}

// ---------------------------------------------------------------------------
// Tick / lot normalization
// ---------------------------------------------------------------------------

/// Round `price` down to the tick grid. The epsilon guards against float
/// division landing a hair under the grid point.
pub fn round_price_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    ((price / tick) + 1e-9).floor() * tick
}

/// Round `quantity` down to the lot grid.
pub fn round_qty_to_lot(quantity: f64, lot: f64) -> f64 {
    if lot <= 0.0 {
        return quantity;
    }
    ((quantity / lot) + 1e-9).floor() * lot
}

/// Round-trip fee estimate for an entry at `entry` and exit at `exit`.
pub fn expected_fees(entry: f64, exit: f64, quantity: f64, fee_rate: f64) -> f64 {
    (entry * quantity + exit * quantity) * fee_rate
}

// ---------------------------------------------------------------------------
// Plan construction
// ---------------------------------------------------------------------------

/// Build a sized plan from a scored opportunity, or explain the rejection.
pub fn build_plan(
    opp: &ScoredOpportunity,
    rules: &SymbolRule,
    capital_available: f64,
    cfg: &RuntimeConfig,
) -> Result<TradePlan, PlanReject> {
    if rules.tick_size <= 0.0 || rules.lot_size <= 0.0 {
        return Err(PlanReject::RulesIncomplete);
    }

    let regime_mult = regime_multiplier(opp.regime);
    if regime_mult <= 0.0 {
        return Err(PlanReject::RegimeBlocked);
    }

    if capital_available < cfg.min_capital_per_trade {
        return Err(PlanReject::CapitalExhausted);
    }

    // Raw notional, clamped to the configured per-trade band and to what the
    // account can actually afford.
    let raw = cfg.base_position_pct / 100.0
        * opp.tier.multiplier()
        * regime_mult
        * capital_available;
    let notional = raw
        .clamp(cfg.min_capital_per_trade, cfg.max_capital_per_trade)
        .min(capital_available);

    // Normalize to exchange rules.
    let entry_price = round_price_to_tick(opp.price, rules.tick_size);
    if entry_price <= 0.0 {
        return Err(PlanReject::BelowMinimum);
    }

    let mut quantity = round_qty_to_lot(notional / entry_price, rules.lot_size);
    if quantity <= 0.0 {
        return Err(PlanReject::BelowMinimum);
    }

    // If rounding dropped the order under the exchange minimum, bump by one
    // lot increment.
    if quantity * entry_price < rules.min_notional {
        quantity += rules.lot_size;
    }
    let final_notional = quantity * entry_price;
    if final_notional < rules.min_notional || final_notional > capital_available {
        return Err(PlanReject::BelowMinimum);
    }

    // Take profit with the fee-aware micro-profit guard.
    let tp_pct = take_profit_pct(opp.tier, cfg);
    let take_profit = round_price_to_tick(entry_price * (1.0 + tp_pct / 100.0), rules.tick_size);
    let projected = quantity * (take_profit - entry_price);
    let fees = expected_fees(entry_price, take_profit, quantity, cfg.fee_rate);
    if projected < cfg.min_profit_buffer + fees {
        return Err(PlanReject::MicroProfit);
    }

    // Stop loss.
    let sl_pct = stop_loss_pct(opp.atr_pct, cfg);
    let stop_loss = round_price_to_tick(entry_price * (1.0 - sl_pct / 100.0), rules.tick_size);

    debug!(
        symbol = %opp.symbol,
        tier = %opp.tier,
        entry = entry_price,
        quantity,
        notional = final_notional,
        take_profit,
        stop_loss,
        "plan built"
    );

    Ok(TradePlan {
        symbol: opp.symbol.clone(),
        tier: opp.tier,
        regime: opp.regime,
        entry_price,
        quantity,
        notional: final_notional,
        take_profit,
        stop_loss,
        entry_score: opp.composite,
        rationale: opp.rationale.clone(),
    })
}

// ---------------------------------------------------------------------------
// Trailing stop
// ---------------------------------------------------------------------------

/// Trailing schedule: activates at +1% (stop to breakeven), locks 50% of the
/// gain beyond +2%, 70% beyond +3%. Returns the new stop only when it is
/// strictly above `current_stop`; the stop never ratchets downward.
pub fn trailing_stop(entry: f64, high_water: f64, current_stop: f64) -> Option<f64> {
    if entry <= 0.0 {
        return None;
    }
    let gain_pct = (high_water - entry) / entry * 100.0;
    if gain_pct < 1.0 {
        return None;
    }

    let locked_fraction = if gain_pct >= 3.0 {
        0.70
    } else if gain_pct >= 2.0 {
        0.50
    } else {
        0.0 // activation: breakeven
    };

    let target = entry + (high_water - entry) * locked_fraction;
    (target > current_stop).then_some(target)
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Why admission control is refusing new entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerTrip {
    DailyLossLimit,
    ConsecutiveLosses,
    ReconcileCritical,
}

impl std::fmt::Display for BreakerTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLossLimit => write!(f, "daily loss limit breached"),
            Self::ConsecutiveLosses => write!(f, "consecutive-loss limit reached"),
            Self::ReconcileCritical => write!(f, "last reconciliation was CRITICAL"),
        }
    }
}

/// Evaluate admission control for this cycle.
pub fn circuit_breaker(
    daily: &DailyCounters,
    cfg: &RuntimeConfig,
    reconcile_critical: bool,
) -> Option<BreakerTrip> {
    if reconcile_critical {
        return Some(BreakerTrip::ReconcileCritical);
    }
    if daily.realized_pnl <= -cfg.daily_loss_limit {
        return Some(BreakerTrip::DailyLossLimit);
    }
    if daily.consecutive_losses >= cfg.max_consecutive_losses {
        return Some(BreakerTrip::ConsecutiveLosses);
    }
    None
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ComponentScores;

    fn opportunity(symbol: &str, tier: Tier, price: f64, atr_pct: Option<f64>) -> ScoredOpportunity {
        ScoredOpportunity {
            symbol: symbol.to_string(),
            composite: 75.0,
            components: ComponentScores {
                technical: 75.0,
                intelligence: 75.0,
                multi_timeframe: 75.0,
                volume: 75.0,
                sentiment: 75.0,
            },
            tier,
            price,
            volume_24h: 1_000_000.0,
            atr_pct,
            rationale: String::new(),
            regime: Regime::Normal,
        }
    }

    fn rules(tick: f64, lot: f64, min_notional: f64) -> SymbolRule {
        SymbolRule {
            symbol: "XUSDT".to_string(),
            base_asset: "X".to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: tick,
            lot_size: lot,
            min_notional,
            active: true,
        }
    }

    #[test]
    fn seed_scenario_standard_tier() {
        // Entry $10.000, tick 0.001, lot 0.1, min-notional $11, STANDARD tier
        // in NORMAL regime with plenty of capital: TP 10.150, SL 9.500.
        let cfg = RuntimeConfig::default();
        let opp = opportunity("XUSDT", Tier::Standard, 10.0, None);
        let plan = build_plan(&opp, &rules(0.001, 0.1, 11.0), 1500.0, &cfg).unwrap();

        assert!((plan.entry_price - 10.0).abs() < 1e-9);
        assert!((plan.take_profit - 10.150).abs() < 1e-9);
        assert!((plan.stop_loss - 9.500).abs() < 1e-9);
        assert!((plan.quantity - 3.0).abs() < 1e-9);
        assert!((plan.notional - 30.0).abs() < 1e-9);
    }

    #[test]
    fn strong_bear_blocks_entries() {
        let cfg = RuntimeConfig::default();
        let mut opp = opportunity("XUSDT", Tier::GodTier, 10.0, None);
        opp.regime = Regime::StrongBear;
        let err = build_plan(&opp, &rules(0.001, 0.1, 11.0), 1000.0, &cfg).unwrap_err();
        assert_eq!(err, PlanReject::RegimeBlocked);
    }

    #[test]
    fn exhausted_capital_is_rejected() {
        let cfg = RuntimeConfig::default();
        let opp = opportunity("XUSDT", Tier::Standard, 10.0, None);
        let err = build_plan(&opp, &rules(0.001, 0.1, 11.0), 5.0, &cfg).unwrap_err();
        assert_eq!(err, PlanReject::CapitalExhausted);
    }

    #[test]
    fn sizing_at_exactly_min_notional_is_accepted() {
        let mut cfg = RuntimeConfig::default();
        cfg.min_capital_per_trade = 11.0;
        cfg.max_capital_per_trade = 11.0;
        // price 1.10, lot 1.0: 11.0 / 1.10 = 10 lots exactly = $11.00.
        let opp = opportunity("XUSDT", Tier::Standard, 1.10, None);
        let plan = build_plan(&opp, &rules(0.001, 1.0, 11.0), 1000.0, &cfg).unwrap();
        assert!((plan.notional - 11.0).abs() < 1e-9);
    }

    #[test]
    fn below_minimum_after_rounding_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.min_capital_per_trade = 11.0;
        cfg.max_capital_per_trade = 11.0;
        // Lot of 20 units at $1.10: one lot is $22 > capital bump allowed?
        // 11.0/1.10 = 10 units, floors to lot 0 -> BelowMinimum.
        let opp = opportunity("XUSDT", Tier::Standard, 1.10, None);
        let err = build_plan(&opp, &rules(0.01, 20.0, 11.0), 15.0, &cfg).unwrap_err();
        assert_eq!(err, PlanReject::BelowMinimum);
    }

    #[test]
    fn notional_bumped_one_lot_when_under_minimum() {
        let mut cfg = RuntimeConfig::default();
        cfg.min_capital_per_trade = 11.0;
        cfg.max_capital_per_trade = 11.0;
        // price 1.2, lot 1: 11/1.2 = 9.16 -> 9 units = $10.80 < $11 minimum.
        // One-lot bump: 10 units = $12.00 >= $11.
        let opp = opportunity("XUSDT", Tier::Standard, 1.2, None);
        let plan = build_plan(&opp, &rules(0.001, 1.0, 11.0), 1000.0, &cfg).unwrap();
        assert!((plan.quantity - 10.0).abs() < 1e-9);
        assert!((plan.notional - 12.0).abs() < 1e-9);
    }

    #[test]
    fn micro_profit_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.min_profit_buffer = 1.0; // $1 buffer a $30 trade at 1.5% cannot clear
        let opp = opportunity("XUSDT", Tier::Standard, 10.0, None);
        let err = build_plan(&opp, &rules(0.001, 0.1, 11.0), 1500.0, &cfg).unwrap_err();
        assert_eq!(err, PlanReject::MicroProfit);
    }

    #[test]
    fn missing_rules_are_rejected() {
        let cfg = RuntimeConfig::default();
        let opp = opportunity("XUSDT", Tier::Standard, 10.0, None);
        let err = build_plan(&opp, &rules(0.0, 0.1, 11.0), 1000.0, &cfg).unwrap_err();
        assert_eq!(err, PlanReject::RulesIncomplete);
    }

    #[test]
    fn stop_loss_clamps_and_overrides() {
        let mut cfg = RuntimeConfig::default();
        // ATR derivation: 2.0% ATR in the normal band -> 3.0%, inside clamp.
        assert!((stop_loss_pct(Some(2.0), &cfg) - 3.0).abs() < 1e-9);
        // Tiny ATR clamps to the floor.
        assert!((stop_loss_pct(Some(0.1), &cfg) - 0.5).abs() < 1e-9);
        // Huge ATR clamps to the cap.
        assert!((stop_loss_pct(Some(10.0), &cfg) - 5.0).abs() < 1e-9);
        // No ATR falls back to the cap.
        assert!((stop_loss_pct(None, &cfg) - 5.0).abs() < 1e-9);
        // Fixed override wins.
        cfg.stop_loss_pct_override = Some(1.2);
        assert!((stop_loss_pct(Some(2.0), &cfg) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn regime_multipliers_match_table() {
        assert!((regime_multiplier(Regime::StrongBull) - 1.25).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Bull) - 1.10).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Normal) - 1.0).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Volatile) - 0.75).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Bear) - 0.50).abs() < 1e-12);
        assert!(regime_multiplier(Regime::StrongBear).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Flat) - 0.75).abs() < 1e-12);
        assert!((regime_multiplier(Regime::Unknown) - 0.50).abs() < 1e-12);
    }

    // ---- trailing --------------------------------------------------------

    #[test]
    fn trailing_inactive_below_one_percent() {
        assert!(trailing_stop(100.0, 100.5, 95.0).is_none());
    }

    #[test]
    fn trailing_activates_at_breakeven() {
        let stop = trailing_stop(100.0, 101.0, 95.0).unwrap();
        assert!((stop - 100.0).abs() < 1e-9);
    }

    #[test]
    fn trailing_locks_half_beyond_two_percent() {
        let stop = trailing_stop(100.0, 102.0, 95.0).unwrap();
        assert!((stop - 101.0).abs() < 1e-9);
    }

    #[test]
    fn trailing_locks_seventy_beyond_three_percent() {
        let stop = trailing_stop(100.0, 104.0, 95.0).unwrap();
        assert!((stop - 102.8).abs() < 1e-9);
    }

    #[test]
    fn trailing_never_ratchets_downward() {
        // Stop already above the schedule target: no change.
        assert!(trailing_stop(100.0, 102.0, 101.5).is_none());
    }

    // ---- circuit breaker -------------------------------------------------

    fn daily(pnl: f64, consecutive: u32) -> DailyCounters {
        DailyCounters {
            date: "2026-08-01".to_string(),
            trades: 5,
            wins: 0,
            losses: 5,
            consecutive_losses: consecutive,
            realized_pnl: pnl,
            fees_paid: 0.2,
        }
    }

    #[test]
    fn breaker_trips_on_daily_loss() {
        let cfg = RuntimeConfig::default(); // limit $5
        assert_eq!(
            circuit_breaker(&daily(-6.0, 2), &cfg, false),
            Some(BreakerTrip::DailyLossLimit)
        );
        assert_eq!(circuit_breaker(&daily(-4.0, 2), &cfg, false), None);
    }

    #[test]
    fn breaker_trips_on_consecutive_losses() {
        let cfg = RuntimeConfig::default(); // limit 5
        assert_eq!(
            circuit_breaker(&daily(-1.0, 5), &cfg, false),
            Some(BreakerTrip::ConsecutiveLosses)
        );
    }

    #[test]
    fn breaker_trips_on_reconcile_critical() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            circuit_breaker(&daily(0.0, 0), &cfg, true),
            Some(BreakerTrip::ReconcileCritical)
        );
    }
}
