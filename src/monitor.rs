// =============================================================================
// Position Monitor — per-cycle exit evaluation for every open position
// =============================================================================
//
// Rule order per position (first hit wins):
//   1. price <= stop            -> StopLoss
//   2. price >= take-profit AND net projected profit clears the buffer
//                               -> TakeProfit
//   3. trailing schedule        -> raise the stop (no close)
//   4. small gain + opportunity quality collapsed since entry
//                               -> RecycleProfit
//   5. age past the decay timeout with nothing to show
//                               -> AlphaDecay
//
// Evaluation is pure (collect intents first); closes execute sequentially
// afterwards in deterministic order: symbol, then rule priority StopLoss >
// TakeProfit > RecycleProfit > AlphaDecay. No lock is held across a close.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::execution::ExecutionEngine;
use crate::risk::{expected_fees, trailing_stop};
use crate::runtime_config::RuntimeConfig;
use crate::state::ledger::TradeRecord;
use crate::state::{Position, StateStore};
use crate::types::TradeReason;

/// A close decision waiting for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseIntent {
    pub symbol: String,
    pub reason: TradeReason,
}

/// A stop-raise decision (trailing advance).
#[derive(Debug, Clone, PartialEq)]
pub struct StopRaise {
    pub symbol: String,
    pub new_stop: f64,
}

/// What one monitor pass decided.
#[derive(Debug, Default)]
pub struct MonitorPlan {
    pub closes: Vec<CloseIntent>,
    pub stop_raises: Vec<StopRaise>,
    /// Symbols whose positions violate a structural invariant; they are
    /// quarantined and a reconciliation pass requested instead of trading.
    pub quarantines: Vec<String>,
}

/// Evaluate every open position against the exit rules.
///
/// `quality` maps symbols to their current cycle's composite score; absent
/// entries mean the symbol was not scored this cycle (recycle rule skips).
pub fn evaluate(
    positions: &[Position],
    quality: &HashMap<String, f64>,
    cfg: &RuntimeConfig,
    now: DateTime<Utc>,
) -> MonitorPlan {
    let mut plan = MonitorPlan::default();

    for pos in positions {
        if pos.current_price <= 0.0 {
            warn!(symbol = %pos.symbol, "no mark price, skipping exit evaluation");
            continue;
        }

        // Structural invariants: TP above entry, SL below it. A violated
        // position is quarantined, never traded on.
        if pos.take_profit <= pos.entry_price || pos.stop_loss >= pos.entry_price {
            warn!(
                symbol = %pos.symbol,
                entry = pos.entry_price,
                take_profit = pos.take_profit,
                stop_loss = pos.stop_loss,
                "LOGIC INVARIANT VIOLATION: exit levels inverted"
            );
            plan.quarantines.push(pos.symbol.clone());
            continue;
        }

        // 1. Stop loss.
        if pos.current_price <= pos.stop_loss {
            plan.closes.push(CloseIntent {
                symbol: pos.symbol.clone(),
                reason: TradeReason::StopLoss,
            });
            continue;
        }

        // 2. Take profit, only when the net clears the buffer.
        if pos.current_price >= pos.take_profit {
            let gross = (pos.current_price - pos.entry_price) * pos.quantity;
            let fees = expected_fees(
                pos.entry_price,
                pos.current_price,
                pos.quantity,
                cfg.fee_rate,
            );
            if gross - fees >= cfg.min_profit_buffer {
                plan.closes.push(CloseIntent {
                    symbol: pos.symbol.clone(),
                    reason: TradeReason::TakeProfit,
                });
                continue;
            }
            debug!(symbol = %pos.symbol, gross, fees, "TP touched but net under buffer");
        }

        // 3. Trailing stop advance.
        if let Some(new_stop) = trailing_stop(pos.entry_price, pos.high_water, pos.stop_loss) {
            plan.stop_raises.push(StopRaise {
                symbol: pos.symbol.clone(),
                new_stop,
            });
            // A raised stop does not preclude the softer exits below.
        }

        let gain = pos.gain_pct();

        // 4. Recycle profit: small gain and the thesis has deteriorated.
        if gain >= cfg.recycle_min_gain_pct && gain <= cfg.recycle_max_gain_pct {
            if let Some(current_quality) = quality.get(&pos.symbol) {
                let drop = pos.entry_score - current_quality;
                if drop >= cfg.recycle_quality_drop {
                    plan.closes.push(CloseIntent {
                        symbol: pos.symbol.clone(),
                        reason: TradeReason::RecycleProfit,
                    });
                    continue;
                }
            }
        }

        // 5. Alpha decay: stale position with nothing to show.
        if pos.age_secs(now) > cfg.decay_timeout_secs as i64 && gain < cfg.decay_max_gain_pct {
            plan.closes.push(CloseIntent {
                symbol: pos.symbol.clone(),
                reason: TradeReason::AlphaDecay,
            });
        }
    }

    // Deterministic execution order: symbol, then rule priority.
    plan.closes
        .sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.reason.priority().cmp(&b.reason.priority())));
    plan
}

/// Result of one executed monitor pass.
#[derive(Debug, Default)]
pub struct MonitorOutcome {
    pub closed: Vec<TradeRecord>,
    pub stops_raised: u32,
}

/// Apply a monitor plan: raise stops, then execute closes sequentially.
pub async fn apply(
    plan: MonitorPlan,
    engine: &ExecutionEngine,
    state: &StateStore,
) -> MonitorOutcome {
    let mut outcome = MonitorOutcome::default();

    for symbol in &plan.quarantines {
        state.quarantine(symbol);
        state.request_reconcile();
    }

    for raise in &plan.stop_raises {
        if state.raise_stop(&raise.symbol, raise.new_stop) {
            info!(symbol = %raise.symbol, new_stop = raise.new_stop, "trailing stop advanced");
            outcome.stops_raised += 1;
        }
    }

    for intent in &plan.closes {
        // Re-read: an earlier close or a raise may have changed things.
        let Some(position) = state.position(&intent.symbol) else {
            continue;
        };
        match engine.close(&position, intent.reason).await {
            Ok(record) => outcome.closed.push(record),
            Err(e) => {
                warn!(symbol = %intent.symbol, reason = %intent.reason, error = %e,
                    "close failed, position retained");
            }
        }
    }

    outcome
}
