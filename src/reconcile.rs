// =============================================================================
// Reconciler — converge memory, durable state, ledger, and the live exchange
// =============================================================================
//
// Runs at startup and on a fixed interval (plus on demand after an
// InsufficientBalance). One pass:
//
//   1. Fetch live balances, open orders, and tickers.
//   2. Positions the exchange no longer backs (live base value under the
//      dust threshold) are cleaned up; a sell the ledger never saw gets a
//      HistorySync record first.
//   3. Live holdings with no tracked position are adopted, entry price from
//      the ledger's most recent buy (FIFO) or the current mark.
//   4. Pending buys with no matching live order are dropped.
//   5. Untracked live buy orders are adopted as pending buys.
//   6. Capital awareness is recomputed from authoritative numbers.
//
// The pass returns a structured report (OK | WARN | CRITICAL). The agent
// loop exits with code 2 after two consecutive CRITICAL reports.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::scoring::Tier;
use crate::state::ledger::{FillSource, TradeLedger, TradeRecord};
use crate::state::{CapitalAwareness, PendingBuy, Position, StateStore};
use crate::types::{OrderSide, TradeReason};
use crate::universe::SymbolUniverse;

/// Holdings below this quote value are dust, not positions.
const DUST_VALUE: f64 = 1.0;

/// Severity of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportLevel {
    Ok,
    Warn,
    Critical,
}

impl std::fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Structured result of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub level: ReportLevel,
    pub findings: Vec<String>,
    pub positions_cleaned: u32,
    pub positions_adopted: u32,
    pub pendings_dropped: u32,
    pub pendings_adopted: u32,
    pub timestamp: String,
}

impl ReconcileReport {
    fn critical(finding: String) -> Self {
        Self {
            level: ReportLevel::Critical,
            findings: vec![finding],
            positions_cleaned: 0,
            positions_adopted: 0,
            pendings_dropped: 0,
            pendings_adopted: 0,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Run one reconciliation pass.
pub async fn reconcile_once(
    client: &Arc<dyn ExchangeClient>,
    state: &StateStore,
    ledger: &TradeLedger,
    universe: &SymbolUniverse,
    quote_asset: &str,
) -> ReconcileReport {
    let started = Utc::now();
    info!("reconciliation pass started");

    // ── 1. Fetch ground truth ───────────────────────────────────────────
    let balances = match client.get_balances().await {
        Ok(b) => b,
        Err(e) => return ReconcileReport::critical(format!("balance fetch failed: {e}")),
    };
    let open_orders = match client.get_open_orders().await {
        Ok(o) => o,
        Err(e) => return ReconcileReport::critical(format!("open-order fetch failed: {e}")),
    };
    let tickers = match client.get_tickers().await {
        Ok(t) => t,
        Err(e) => return ReconcileReport::critical(format!("ticker fetch failed: {e}")),
    };
    let prices: HashMap<String, f64> = tickers.iter().map(|t| (t.symbol.clone(), t.price)).collect();

    let mut findings = Vec::new();
    let mut cleaned = 0u32;
    let mut adopted = 0u32;
    let mut pendings_dropped = 0u32;
    let mut pendings_adopted = 0u32;

    let snapshot = state.snapshot();

    // ── 2. Stored positions vs live balances ────────────────────────────
    for pos in &snapshot.positions {
        let base = universe
            .rules(&pos.symbol)
            .map(|r| r.base_asset)
            .unwrap_or_else(|_| pos.symbol.trim_end_matches(quote_asset).to_string());

        let live_qty = balances.get(&base).map(|b| b.total()).unwrap_or(0.0);
        let price = prices.get(&pos.symbol).copied().unwrap_or(pos.current_price);

        if live_qty < pos.quantity && live_qty * price < DUST_VALUE {
            // Exchange no longer backs this position. If the ledger still
            // thinks we hold it, record the external sale first.
            let net = ledger.net_quantity(&pos.symbol).unwrap_or(0.0);
            if net * price >= DUST_VALUE {
                let record = TradeRecord {
                    source: FillSource::HistorySync,
                    ..TradeRecord::exit(
                        &pos.symbol,
                        net,
                        price,
                        0.0,
                        TradeReason::HistorySync,
                        (price - pos.entry_price) * net,
                        pos.entry_regime,
                    )
                };
                if let Err(e) = ledger.append(&record) {
                    warn!(symbol = %pos.symbol, error = %e, "failed to append history-sync record");
                }
            }

            findings.push(format!(
                "position {} removed: live {} {:.8} worth under dust threshold",
                pos.symbol, base, live_qty
            ));
            state.remove_position(&pos.symbol);
            cleaned += 1;
        }
    }

    // ── 3. Live holdings with no tracked position ───────────────────────
    for symbol in universe.all() {
        if state.has_position(&symbol) || state.has_pending(&symbol) {
            continue;
        }
        let Ok(rule) = universe.rules(&symbol) else {
            continue;
        };
        let live_qty = balances.get(&rule.base_asset).map(|b| b.total()).unwrap_or(0.0);
        let Some(&price) = prices.get(&symbol) else {
            continue;
        };
        if live_qty * price < DUST_VALUE {
            continue;
        }

        // Entry from the ledger's most recent matching buy, else the mark.
        let entry_price = ledger
            .last_buy(&symbol)
            .ok()
            .flatten()
            .map(|r| r.price)
            .unwrap_or(price);

        findings.push(format!(
            "adopted live holding {symbol}: qty {live_qty:.8} entry {entry_price}"
        ));
        state.upsert_position(Position {
            symbol: symbol.clone(),
            quantity: live_qty,
            entry_price,
            entry_fee: 0.0,
            current_price: price,
            take_profit: entry_price * (1.0 + Tier::Standard.take_profit_pct() / 100.0),
            stop_loss: entry_price * 0.95,
            high_water: price.max(entry_price),
            opened_at: Utc::now(),
            entry_regime: snapshot.last_regime,
            tier: Tier::Standard,
            entry_score: 70.0,
            entry_order_id: String::new(),
        });
        adopted += 1;
    }

    // ── 4. Pending buys with no live order ──────────────────────────────
    for pending in &snapshot.pending_buys {
        let backed = pending
            .order_id
            .as_ref()
            .map(|id| open_orders.iter().any(|o| &o.order_id == id))
            .unwrap_or(false);
        if !backed {
            findings.push(format!(
                "pending buy {} dropped: no matching live order, {} reserved returned",
                pending.symbol, pending.notional
            ));
            state.remove_pending(&pending.symbol);
            pendings_dropped += 1;
        }
    }

    // ── 5. Untracked live buy orders ────────────────────────────────────
    for order in &open_orders {
        if order.side != OrderSide::Buy {
            findings.push(format!(
                "untracked live sell order {} on {}",
                order.order_id, order.symbol
            ));
            continue;
        }
        if state.has_pending(&order.symbol) || state.has_position(&order.symbol) {
            continue;
        }

        findings.push(format!(
            "adopted untracked live buy order {} on {}",
            order.order_id, order.symbol
        ));
        state.add_pending(PendingBuy {
            symbol: order.symbol.clone(),
            order_id: Some(order.order_id.clone()),
            notional: order.price * order.quantity,
            price: order.price,
            quantity: order.quantity,
            take_profit: order.price * (1.0 + Tier::Standard.take_profit_pct() / 100.0),
            stop_loss: order.price * 0.95,
            tier: Tier::Standard,
            entry_regime: snapshot.last_regime,
            entry_score: 70.0,
            placed_at: Utc::now(),
        });
        pendings_adopted += 1;
    }

    // ── 6. Recompute capital awareness ──────────────────────────────────
    let quote = balances.get(quote_asset).copied().unwrap_or_default();
    let refreshed = state.snapshot();
    let holdings_value: f64 = refreshed
        .positions
        .iter()
        .map(|p| {
            let price = prices.get(&p.symbol).copied().unwrap_or(p.current_price);
            p.quantity * price
        })
        .sum();
    state.set_capital(CapitalAwareness::compute(
        quote.free,
        quote.locked,
        holdings_value,
    ));

    let level = if findings.is_empty() {
        ReportLevel::Ok
    } else {
        ReportLevel::Warn
    };

    let report = ReconcileReport {
        level,
        findings,
        positions_cleaned: cleaned,
        positions_adopted: adopted,
        pendings_dropped,
        pendings_adopted,
        timestamp: started.to_rfc3339(),
    };

    info!(
        level = %report.level,
        cleaned,
        adopted,
        pendings_dropped,
        pendings_adopted,
        "reconciliation pass completed"
    );
    report
}
