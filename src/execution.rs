// =============================================================================
// Execution Engine — order placement, fill promotion, position closure
// =============================================================================
//
// Entry discipline:
//   - The PendingBuy is recorded in the state store BEFORE the network call;
//     on a network failure the entry is removed and the error returned. The
//     add-pending step doubles as duplicate suppression: a symbol with a
//     position or an in-flight buy is rejected with DuplicateInFlight.
//   - resolve_pending() promotes filled entries into positions (ledger entry
//     record appended first) and drops entries whose orders vanished.
//
// Exit discipline:
//   - TakeProfit closes are LIMIT maker orders at the TP price;
//     RecycleProfit closes are LIMIT at the current mark; StopLoss,
//     AlphaDecay and emergency closes go MARKET.
//   - The exit TradeRecord is appended to the ledger BEFORE the position
//     leaves the state store (crash-safe ordering; the reconciler completes
//     cleanup after a crash between the two).
//   - An InsufficientBalance from the exchange requests a reconciliation
//     pass instead of retrying blindly: the held quantity may have been
//     reduced by dust or fills outside the agent.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::exchange::{
    CancelOutcome, ExchangeClient, ExchangeError, OrderRequest, OrderType,
};
use crate::risk::{round_qty_to_lot, TradePlan};
use crate::state::ledger::{TradeLedger, TradeRecord};
use crate::state::{PendingBuy, Position, StateStore};
use crate::types::{OrderSide, TradeReason};
use crate::universe::SymbolUniverse;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("symbol {0} already has a position or in-flight buy")]
    DuplicateInFlight(String),

    #[error("order size below exchange minimum")]
    BelowMinimum,

    #[error("price increment invalid; rule refresh requested")]
    PriceIncrementInvalid,

    #[error("rate limited")]
    RateLimited,

    #[error("insufficient balance; reconciliation requested")]
    InsufficientBalance,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("ledger append failed: {0}")]
    Ledger(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    client: Arc<dyn ExchangeClient>,
    state: Arc<StateStore>,
    ledger: Arc<TradeLedger>,
    universe: Arc<SymbolUniverse>,
    /// Per-side fee rate used when the venue does not report the fee.
    fee_rate: f64,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        state: Arc<StateStore>,
        ledger: Arc<TradeLedger>,
        universe: Arc<SymbolUniverse>,
        fee_rate: f64,
    ) -> Self {
        Self {
            client,
            state,
            ledger,
            universe,
            fee_rate,
        }
    }

    /// Map an exchange error into the execution taxonomy, firing the
    /// recovery side effects as it goes.
    fn map_error(&self, symbol: &str, err: ExchangeError) -> ExecutionError {
        match err {
            ExchangeError::RateLimited => ExecutionError::RateLimited,
            ExchangeError::InsufficientBalance => {
                self.state.request_reconcile();
                ExecutionError::InsufficientBalance
            }
            ExchangeError::PriceIncrementInvalid => {
                self.universe.request_refresh();
                ExecutionError::PriceIncrementInvalid
            }
            ExchangeError::UnknownSymbol(s) => {
                self.universe.remove(&s);
                ExecutionError::UnknownSymbol(s)
            }
            ExchangeError::Transport(m) => ExecutionError::Transport(m),
            ExchangeError::ExchangeUnavailable(m) => {
                warn!(symbol, message = %m, "exchange unavailable during execution");
                ExecutionError::ExchangeUnavailable(m)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Place the entry order for a sized plan and record the pending buy.
    pub async fn open(&self, plan: &TradePlan) -> Result<PendingBuy, ExecutionError> {
        if plan.quantity <= 0.0 {
            return Err(ExecutionError::BelowMinimum);
        }

        let pending = PendingBuy {
            symbol: plan.symbol.clone(),
            order_id: None,
            notional: plan.notional,
            price: plan.entry_price,
            quantity: plan.quantity,
            take_profit: plan.take_profit,
            stop_loss: plan.stop_loss,
            tier: plan.tier,
            entry_regime: plan.regime,
            entry_score: plan.entry_score,
            placed_at: Utc::now(),
        };

        // Recorded before the network call; rejection here IS the duplicate
        // suppression.
        if !self.state.add_pending(pending.clone()) {
            return Err(ExecutionError::DuplicateInFlight(plan.symbol.clone()));
        }

        let request = OrderRequest {
            symbol: plan.symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: plan.quantity,
            price: Some(plan.entry_price),
        };

        match self.client.place_order(&request).await {
            Ok(order_id) => {
                self.state.set_pending_order_id(&plan.symbol, &order_id);
                info!(
                    symbol = %plan.symbol,
                    order_id = %order_id,
                    price = plan.entry_price,
                    quantity = plan.quantity,
                    notional = plan.notional,
                    tier = %plan.tier,
                    "entry order placed"
                );
                let mut placed = pending;
                placed.order_id = Some(order_id);
                Ok(placed)
            }
            Err(e) => {
                // Roll the reservation back; next cycle may retry.
                self.state.remove_pending(&plan.symbol);
                Err(self.map_error(&plan.symbol, e))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pending resolution
    // -------------------------------------------------------------------------

    /// Promote filled pending buys into positions and drop dead entries.
    /// Returns the number of promotions.
    pub async fn resolve_pending(&self) -> Result<usize, ExecutionError> {
        let snapshot = self.state.snapshot();
        if snapshot.pending_buys.is_empty() {
            return Ok(0);
        }

        let open_orders = self
            .client
            .get_open_orders()
            .await
            .map_err(|e| self.map_error("*", e))?;

        let earliest = snapshot
            .pending_buys
            .iter()
            .map(|p| p.placed_at.timestamp_millis())
            .min()
            .unwrap_or(0);
        let fills = self
            .client
            .get_closed_orders(earliest)
            .await
            .map_err(|e| self.map_error("*", e))?;

        let mut promoted = 0;
        for pending in &snapshot.pending_buys {
            let order_id = match &pending.order_id {
                Some(id) => id.clone(),
                None => {
                    // The network call never completed; the reservation is
                    // orphaned.
                    warn!(symbol = %pending.symbol, "dropping pending buy with no order id");
                    self.state.remove_pending(&pending.symbol);
                    continue;
                }
            };

            if open_orders.iter().any(|o| o.order_id == order_id) {
                continue; // still resting
            }

            match fills
                .iter()
                .find(|f| f.order_id == order_id && f.side == OrderSide::Buy)
            {
                Some(fill) => {
                    let record = TradeRecord::entry(
                        &pending.symbol,
                        fill.quantity,
                        fill.price,
                        fill.fee,
                        pending.entry_regime,
                    );
                    self.ledger
                        .append(&record)
                        .map_err(|e| ExecutionError::Ledger(e.to_string()))?;

                    // The planned TP/SL hold: a buy fills at or under its
                    // limit, which sits strictly between SL and TP.
                    let position = Position {
                        symbol: pending.symbol.clone(),
                        quantity: fill.quantity,
                        entry_price: fill.price,
                        entry_fee: fill.fee,
                        current_price: fill.price,
                        take_profit: pending.take_profit,
                        stop_loss: pending.stop_loss,
                        high_water: fill.price,
                        opened_at: Utc::now(),
                        entry_regime: pending.entry_regime,
                        tier: pending.tier,
                        entry_score: pending.entry_score,
                        entry_order_id: order_id.clone(),
                    };

                    info!(
                        symbol = %pending.symbol,
                        order_id = %order_id,
                        fill_price = fill.price,
                        quantity = fill.quantity,
                        "pending buy filled, position opened"
                    );
                    self.state.promote_pending(&pending.symbol, position);
                    promoted += 1;
                }
                None => {
                    // Not resting, not filled: cancelled externally or
                    // rejected after placement.
                    warn!(symbol = %pending.symbol, order_id = %order_id,
                        "pending buy vanished without a fill, dropping");
                    self.state.remove_pending(&pending.symbol);
                }
            }
        }

        Ok(promoted)
    }

    /// Cancel pending buys older than `ttl_secs`. Returns how many were
    /// cancelled.
    pub async fn cancel_stale_pending(&self, ttl_secs: u64) -> usize {
        let now = Utc::now();
        let snapshot = self.state.snapshot();
        let mut cancelled = 0;

        for pending in &snapshot.pending_buys {
            if pending.age_secs(now) < ttl_secs as i64 {
                continue;
            }
            let Some(order_id) = &pending.order_id else {
                self.state.remove_pending(&pending.symbol);
                continue;
            };

            match self.client.cancel_order(&pending.symbol, order_id).await {
                Ok(CancelOutcome::Cancelled) => {
                    info!(symbol = %pending.symbol, order_id = %order_id, "stale pending buy cancelled");
                    self.state.remove_pending(&pending.symbol);
                    cancelled += 1;
                }
                Ok(CancelOutcome::NotFound) => {
                    // Probably filled in the meantime; resolve_pending will
                    // promote it next pass.
                    warn!(symbol = %pending.symbol, order_id = %order_id,
                        "stale pending already gone on the exchange");
                }
                Err(e) => {
                    warn!(symbol = %pending.symbol, error = %e, "failed to cancel stale pending");
                }
            }
        }
        cancelled
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Close a position. The ledger record is committed before the position
    /// is removed from state.
    pub async fn close(
        &self,
        position: &Position,
        reason: TradeReason,
    ) -> Result<TradeRecord, ExecutionError> {
        let lot = self
            .universe
            .rules(&position.symbol)
            .map(|r| r.lot_size)
            .unwrap_or(0.0);
        let quantity = round_qty_to_lot(position.quantity, lot);
        if quantity <= 0.0 {
            return Err(ExecutionError::BelowMinimum);
        }

        // Maker exits for profit-taking, market exits for protection.
        let (order_type, price) = match reason {
            TradeReason::TakeProfit => (OrderType::Limit, Some(position.take_profit)),
            TradeReason::RecycleProfit => (OrderType::Limit, Some(position.current_price)),
            _ => (OrderType::Market, None),
        };

        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: OrderSide::Sell,
            order_type,
            quantity,
            price,
        };

        let placed_at_ms = Utc::now().timestamp_millis();
        let order_id = self
            .client
            .place_order(&request)
            .await
            .map_err(|e| self.map_error(&position.symbol, e))?;

        // Prefer the venue's actual fill; fall back to the requested price.
        let (fill_price, exit_fee) = match self.client.get_closed_orders(placed_at_ms - 1).await {
            Ok(fills) => fills
                .iter()
                .find(|f| f.order_id == order_id && f.side == OrderSide::Sell)
                .map(|f| (f.price, f.fee))
                .unwrap_or_else(|| {
                    let p = price.unwrap_or(position.current_price);
                    (p, p * quantity * self.fee_rate)
                }),
            Err(_) => {
                let p = price.unwrap_or(position.current_price);
                (p, p * quantity * self.fee_rate)
            }
        };

        let realized_pnl =
            (fill_price - position.entry_price) * quantity - position.entry_fee - exit_fee;

        let record = TradeRecord::exit(
            &position.symbol,
            quantity,
            fill_price,
            exit_fee,
            reason,
            realized_pnl,
            position.entry_regime,
        );

        // Crash-safe ordering: ledger first, then state.
        self.ledger
            .append(&record)
            .map_err(|e| ExecutionError::Ledger(e.to_string()))?;
        self.state.remove_position(&position.symbol);
        self.state.record_close(realized_pnl, exit_fee + position.entry_fee);

        info!(
            symbol = %position.symbol,
            %reason,
            order_id = %order_id,
            entry = position.entry_price,
            exit = fill_price,
            quantity,
            realized_pnl,
            "position closed"
        );

        Ok(record)
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("client", &"<ExchangeClient>")
            .field("state", &self.state)
            .finish()
    }
}
