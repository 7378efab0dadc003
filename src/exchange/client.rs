// =============================================================================
// Exchange Client Contract — the narrow seam between the agent and the venue
// =============================================================================
//
// Everything above this trait (scoring, execution, reconciliation) is venue
// agnostic. Two implementations ship: the signed REST client in
// `exchange::binance` and the local simulator in `exchange::paper`.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::{Candle, Timeframe};
use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Typed errors every exchange call can surface. The agent loop is the only
/// layer that converts these into degraded-mode flags.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited by the exchange")]
    RateLimited,

    #[error("insufficient balance for order")]
    InsufficientBalance,

    #[error("price does not respect the symbol's tick size")]
    PriceIncrementInvalid,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Trading rules for one symbol as enforced by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRule {
    pub symbol: String,
    /// Base asset (e.g. "BTC" for BTCUSDT).
    pub base_asset: String,
    /// Quote asset (e.g. "USDT").
    pub quote_asset: String,
    /// Price increment. Zero means the refresh payload omitted it.
    pub tick_size: f64,
    /// Quantity increment. Zero means the refresh payload omitted it.
    pub lot_size: f64,
    /// Minimum order value in quote currency.
    pub min_notional: f64,
    /// Whether the symbol is currently tradable.
    pub active: bool,
}

/// 24 h ticker snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h_pct: f64,
}

/// Free / locked balance for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Order type; exits pick between the two by close reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
        }
    }
}

/// A new-order request, already normalized to the symbol's tick/lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Required for limit orders; ignored for market orders.
    pub price: Option<f64>,
}

/// An order resting on the exchange book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// A filled order from the account history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Fee paid, in quote currency.
    pub fee: f64,
    /// Epoch milliseconds.
    pub filled_at: i64,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The order was already gone (filled or previously cancelled).
    NotFound,
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// Typed exchange client. Implementations must be safe to share across tasks
/// and internally rate-limited.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Full symbol list with trading rules.
    async fn get_symbols(&self) -> Result<Vec<SymbolRule>, ExchangeError>;

    /// Batched 24 h tickers for every symbol.
    async fn get_tickers(&self) -> Result<Vec<Ticker>, ExchangeError>;

    /// Ticker for a single symbol.
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    /// Most recent `limit` candles, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Account balances keyed by asset.
    async fn get_balances(&self) -> Result<HashMap<String, Balance>, ExchangeError>;

    /// All resting orders for the account.
    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Filled orders since the given epoch-millisecond timestamp.
    async fn get_closed_orders(&self, since: i64) -> Result<Vec<FilledOrder>, ExchangeError>;

    /// Submit an order; returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    /// Cancel a resting order.
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError>;
}
