// =============================================================================
// Paper Exchange — local order simulation behind the exchange trait
// =============================================================================
//
// Backs PAPER_TRADING mode and every integration test. Orders are recorded
// and filled locally; nothing ever touches the network. Market orders fill
// at the current mark price; limit orders either fill immediately at their
// limit (the default, matching maker fills in a liquid book) or rest until
// the mark price crosses them when `FillMode::Resting` is selected.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::exchange::client::{
    Balance, CancelOutcome, ExchangeClient, ExchangeError, FilledOrder, OpenOrder, OrderRequest,
    OrderType, SymbolRule, Ticker,
};
use crate::market_data::{Candle, CandleKey, Timeframe};
use crate::types::OrderSide;

/// How limit orders behave in the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Limit orders fill instantly at their limit price.
    Immediate,
    /// Limit orders rest until the mark price crosses them.
    Resting,
}

struct PaperInner {
    rules: HashMap<String, SymbolRule>,
    prices: HashMap<String, Ticker>,
    candles: HashMap<CandleKey, Vec<Candle>>,
    balances: HashMap<String, Balance>,
    open_orders: Vec<OpenOrder>,
    fills: Vec<FilledOrder>,
    next_order_id: u64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// In-memory simulated exchange.
pub struct PaperExchange {
    inner: Mutex<PaperInner>,
    fill_mode: FillMode,
    /// Per-side fee rate charged on simulated fills, in quote currency.
    fee_rate: f64,
    /// When set, every call fails with this error (fault injection).
    fault: Mutex<Option<ExchangeError>>,
}

impl PaperExchange {
    /// Create a simulator holding `quote_balance` of `quote_asset`.
    pub fn new(quote_asset: &str, quote_balance: f64, fee_rate: f64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            quote_asset.to_string(),
            Balance {
                free: quote_balance,
                locked: 0.0,
            },
        );

        info!(quote_asset, quote_balance, "paper exchange initialised");

        Self {
            inner: Mutex::new(PaperInner {
                rules: HashMap::new(),
                prices: HashMap::new(),
                candles: HashMap::new(),
                balances,
                open_orders: Vec::new(),
                fills: Vec::new(),
                next_order_id: 1,
            }),
            fill_mode: FillMode::Immediate,
            fee_rate,
            fault: Mutex::new(None),
        }
    }

    pub fn with_fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    // -------------------------------------------------------------------------
    // Seeding / test controls
    // -------------------------------------------------------------------------

    pub fn seed_rule(&self, rule: SymbolRule) {
        self.inner.lock().rules.insert(rule.symbol.clone(), rule);
    }

    pub fn seed_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.inner
            .lock()
            .candles
            .insert(CandleKey::new(symbol, timeframe), candles);
    }

    pub fn seed_balance(&self, asset: &str, balance: Balance) {
        self.inner.lock().balances.insert(asset.to_string(), balance);
    }

    /// Update the mark price (and optionally volume) for a symbol, then fill
    /// any resting limit orders the new price crosses.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .prices
            .entry(symbol.to_string())
            .or_insert_with(|| Ticker {
                symbol: symbol.to_string(),
                price,
                volume_24h: 1_000_000.0,
                change_24h_pct: 0.0,
            });
        entry.price = price;

        Self::cross_resting_orders(&mut inner, symbol, price, self.fee_rate);
    }

    pub fn set_ticker(&self, ticker: Ticker) {
        let price = ticker.price;
        let symbol = ticker.symbol.clone();
        let mut inner = self.inner.lock();
        inner.prices.insert(symbol.clone(), ticker);
        Self::cross_resting_orders(&mut inner, &symbol, price, self.fee_rate);
    }

    /// Inject a fault: every subsequent call fails with `error` until cleared.
    pub fn inject_fault(&self, error: ExchangeError) {
        *self.fault.lock() = Some(error);
    }

    pub fn clear_fault(&self) {
        *self.fault.lock() = None;
    }

    /// Fills recorded so far (test inspection).
    pub fn fills(&self) -> Vec<FilledOrder> {
        self.inner.lock().fills.clone()
    }

    /// Directly mutate a base balance, simulating activity outside the agent
    /// (dust sweeps, manual sells). Used by reconciliation tests.
    pub fn override_balance(&self, asset: &str, balance: Balance) {
        self.inner.lock().balances.insert(asset.to_string(), balance);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_fault(&self) -> Result<(), ExchangeError> {
        match &*self.fault.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn base_asset(inner: &PaperInner, symbol: &str) -> String {
        inner
            .rules
            .get(symbol)
            .map(|r| r.base_asset.clone())
            .unwrap_or_else(|| symbol.trim_end_matches("USDT").to_string())
    }

    /// Execute a fill: move balances, charge the fee, record the trade.
    fn settle_fill(
        inner: &mut PaperInner,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
        fee_rate: f64,
    ) {
        let base = Self::base_asset(inner, symbol);
        let quote_asset = inner
            .rules
            .get(symbol)
            .map(|r| r.quote_asset.clone())
            .unwrap_or_else(|| "USDT".to_string());

        let notional = price * quantity;
        let fee = notional * fee_rate;

        match side {
            OrderSide::Buy => {
                let quote = inner.balances.entry(quote_asset).or_default();
                quote.free -= notional + fee;
                let base_bal = inner.balances.entry(base).or_default();
                base_bal.free += quantity;
            }
            OrderSide::Sell => {
                let base_bal = inner.balances.entry(base).or_default();
                base_bal.free -= quantity;
                let quote = inner.balances.entry(quote_asset).or_default();
                quote.free += notional - fee;
            }
        }

        inner.fills.push(FilledOrder {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            fee,
            filled_at: now_ms(),
        });

        debug!(order_id, symbol, %side, price, quantity, fee, "paper fill settled");
    }

    fn cross_resting_orders(inner: &mut PaperInner, symbol: &str, price: f64, fee_rate: f64) {
        let crossed: Vec<OpenOrder> = inner
            .open_orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && match o.side {
                        OrderSide::Buy => price <= o.price,
                        OrderSide::Sell => price >= o.price,
                    }
            })
            .cloned()
            .collect();

        for order in crossed {
            inner.open_orders.retain(|o| o.order_id != order.order_id);

            // Release the resting reservation; settle_fill spends from free.
            match order.side {
                OrderSide::Buy => {
                    let quote_asset = inner
                        .rules
                        .get(symbol)
                        .map(|r| r.quote_asset.clone())
                        .unwrap_or_else(|| "USDT".to_string());
                    let notional = order.price * order.quantity;
                    if let Some(b) = inner.balances.get_mut(&quote_asset) {
                        b.locked -= notional;
                        b.free += notional;
                    }
                }
                OrderSide::Sell => {
                    let base = Self::base_asset(inner, symbol);
                    if let Some(b) = inner.balances.get_mut(&base) {
                        b.locked -= order.quantity;
                        b.free += order.quantity;
                    }
                }
            }

            Self::settle_fill(
                inner,
                &order.order_id,
                symbol,
                order.side,
                order.price,
                order.quantity,
                fee_rate,
            );
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_symbols(&self) -> Result<Vec<SymbolRule>, ExchangeError> {
        self.check_fault()?;
        Ok(self.inner.lock().rules.values().cloned().collect())
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        self.check_fault()?;
        Ok(self.inner.lock().prices.values().cloned().collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.check_fault()?;
        self.inner
            .lock()
            .prices
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.check_fault()?;
        let inner = self.inner.lock();
        let series = inner
            .candles
            .get(&CandleKey::new(symbol, timeframe))
            .cloned()
            .unwrap_or_default();
        let start = series.len().saturating_sub(limit as usize);
        Ok(series[start..].to_vec())
    }

    async fn get_balances(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        self.check_fault()?;
        Ok(self.inner.lock().balances.clone())
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.check_fault()?;
        Ok(self.inner.lock().open_orders.clone())
    }

    async fn get_closed_orders(&self, since: i64) -> Result<Vec<FilledOrder>, ExchangeError> {
        self.check_fault()?;
        Ok(self
            .inner
            .lock()
            .fills
            .iter()
            .filter(|f| f.filled_at >= since)
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.check_fault()?;
        let mut inner = self.inner.lock();

        let mark_price = inner
            .prices
            .get(&request.symbol)
            .map(|t| t.price)
            .ok_or_else(|| ExchangeError::UnknownSymbol(request.symbol.clone()))?;

        let exec_price = match request.order_type {
            OrderType::Limit => request.price.ok_or(ExchangeError::PriceIncrementInvalid)?,
            OrderType::Market => mark_price,
        };

        // Balance pre-check mirrors the venue's -2010 behaviour.
        let quote_asset = inner
            .rules
            .get(&request.symbol)
            .map(|r| r.quote_asset.clone())
            .unwrap_or_else(|| "USDT".to_string());
        match request.side {
            OrderSide::Buy => {
                let needed = exec_price * request.quantity * (1.0 + self.fee_rate);
                let free = inner
                    .balances
                    .get(&quote_asset)
                    .map(|b| b.free)
                    .unwrap_or(0.0);
                if free < needed {
                    return Err(ExchangeError::InsufficientBalance);
                }
            }
            OrderSide::Sell => {
                let base = Self::base_asset(&inner, &request.symbol);
                let free = inner.balances.get(&base).map(|b| b.free).unwrap_or(0.0);
                if free < request.quantity {
                    return Err(ExchangeError::InsufficientBalance);
                }
            }
        }

        let order_id = inner.next_order_id.to_string();
        inner.next_order_id += 1;

        let fill_now = match request.order_type {
            OrderType::Market => true,
            OrderType::Limit => self.fill_mode == FillMode::Immediate,
        };

        if fill_now {
            Self::settle_fill(
                &mut inner,
                &order_id,
                &request.symbol,
                request.side,
                exec_price,
                request.quantity,
                self.fee_rate,
            );
        } else {
            // Lock the reserved funds while the order rests.
            match request.side {
                OrderSide::Buy => {
                    let notional = exec_price * request.quantity;
                    if let Some(b) = inner.balances.get_mut(&quote_asset) {
                        b.free -= notional;
                        b.locked += notional;
                    }
                }
                OrderSide::Sell => {
                    let base = Self::base_asset(&inner, &request.symbol);
                    if let Some(b) = inner.balances.get_mut(&base) {
                        b.free -= request.quantity;
                        b.locked += request.quantity;
                    }
                }
            }
            let created_at = now_ms();
            inner.open_orders.push(OpenOrder {
                order_id: order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                price: exec_price,
                quantity: request.quantity,
                created_at,
            });
        }

        Ok(order_id)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        self.check_fault()?;
        let mut inner = self.inner.lock();

        let idx = inner
            .open_orders
            .iter()
            .position(|o| o.symbol == symbol && o.order_id == order_id);

        match idx {
            Some(i) => {
                let order = inner.open_orders.remove(i);
                // Return the reserved funds.
                match order.side {
                    OrderSide::Buy => {
                        let quote_asset = inner
                            .rules
                            .get(symbol)
                            .map(|r| r.quote_asset.clone())
                            .unwrap_or_else(|| "USDT".to_string());
                        let notional = order.price * order.quantity;
                        if let Some(b) = inner.balances.get_mut(&quote_asset) {
                            b.locked -= notional;
                            b.free += notional;
                        }
                    }
                    OrderSide::Sell => {
                        let base = Self::base_asset(&inner, symbol);
                        if let Some(b) = inner.balances.get_mut(&base) {
                            b.locked -= order.quantity;
                            b.free += order.quantity;
                        }
                    }
                }
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::NotFound),
        }
    }
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PaperExchange")
            .field("open_orders", &inner.open_orders.len())
            .field("fills", &inner.fills.len())
            .field("fill_mode", &self.fill_mode)
            .finish()
    }
}
