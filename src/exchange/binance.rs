// =============================================================================
// Binance REST Client — HMAC-SHA256 signed requests behind the exchange trait
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the agent and the exchange servers.
//
// Exchange error codes are mapped into the typed taxonomy:
//   HTTP 429 / -1003            -> RateLimited
//   -2010                       -> InsufficientBalance
//   -1013 / -1111               -> PriceIncrementInvalid
//   -1121                       -> UnknownSymbol
//   HTTP 5xx                    -> ExchangeUnavailable
//   anything network-shaped     -> Transport
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::client::{
    Balance, CancelOutcome, ExchangeClient, ExchangeError, FilledOrder, OpenOrder, OrderRequest,
    OrderType, SymbolRule, Ticker,
};
use crate::exchange::rate_limit::{EndpointFamily, RateLimiter};
use crate::market_data::{Candle, Timeframe};
use crate::types::OrderSide;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// The full-market 24 h ticker payload is large; it gets a wider budget
/// than the 10 s default applied to every other REST call.
const BATCHED_TICKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Binance REST client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    /// Symbols this process has traded; used to scope fill-history queries,
    /// since the venue only exposes fills per symbol.
    traded_symbols: RwLock<HashSet<String>>,
}

impl BinanceClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            http,
            limiter: RateLimiter::new(),
            traded_symbols: RwLock::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport + error mapping
    // -------------------------------------------------------------------------

    async fn execute(
        &self,
        family: EndpointFamily,
        req: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire(family).await;

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("malformed response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        if status.as_u16() == 429 || status.as_u16() == 418 {
            self.limiter
                .penalize(family, std::time::Duration::from_secs(10));
            return Err(ExchangeError::RateLimited);
        }

        if status.is_server_error() {
            return Err(ExchangeError::ExchangeUnavailable(format!(
                "HTTP {status}: {body}"
            )));
        }

        Err(Self::map_api_error(&body))
    }

    /// Map an exchange error payload (`{"code": -2010, "msg": "..."}`) into
    /// the typed taxonomy.
    fn map_api_error(body: &serde_json::Value) -> ExchangeError {
        let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown exchange error")
            .to_string();

        match code {
            -1003 => ExchangeError::RateLimited,
            -2010 | -2019 => ExchangeError::InsufficientBalance,
            -1013 | -1111 => ExchangeError::PriceIncrementInvalid,
            -1121 => ExchangeError::UnknownSymbol(msg),
            _ => ExchangeError::ExchangeUnavailable(format!("code {code}: {msg}")),
        }
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, ExchangeError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| ExchangeError::Transport(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(ExchangeError::Transport(format!(
                "expected string or number, got: {val}"
            )))
        }
    }

    fn parse_side(s: &str) -> OrderSide {
        if s.eq_ignore_ascii_case("SELL") {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    /// Extract tick/lot/min-notional from an exchangeInfo symbol entry. A
    /// missing filter yields zero so the rule cache can apply its
    /// merge-with-preserve policy.
    fn parse_symbol_rule(entry: &serde_json::Value) -> Option<SymbolRule> {
        let symbol = entry.get("symbol")?.as_str()?.to_string();
        let base_asset = entry.get("baseAsset")?.as_str()?.to_string();
        let quote_asset = entry.get("quoteAsset")?.as_str()?.to_string();
        let active = entry.get("status").and_then(|s| s.as_str()) == Some("TRADING");

        let mut tick_size = 0.0;
        let mut lot_size = 0.0;
        let mut min_notional = 0.0;

        if let Some(filters) = entry.get("filters").and_then(|f| f.as_array()) {
            for filter in filters {
                match filter.get("filterType").and_then(|t| t.as_str()) {
                    Some("PRICE_FILTER") => {
                        if let Some(v) = filter.get("tickSize") {
                            tick_size = Self::parse_str_f64(v).unwrap_or(0.0);
                        }
                    }
                    Some("LOT_SIZE") => {
                        if let Some(v) = filter.get("stepSize") {
                            lot_size = Self::parse_str_f64(v).unwrap_or(0.0);
                        }
                    }
                    Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                        if let Some(v) = filter.get("minNotional") {
                            min_notional = Self::parse_str_f64(v).unwrap_or(0.0);
                        }
                    }
                    _ => {}
                }
            }
        }

        Some(SymbolRule {
            symbol,
            base_asset,
            quote_asset,
            tick_size,
            lot_size,
            min_notional,
            active,
        })
    }

    fn parse_ticker(entry: &serde_json::Value) -> Option<Ticker> {
        Some(Ticker {
            symbol: entry.get("symbol")?.as_str()?.to_string(),
            price: Self::parse_str_f64(entry.get("lastPrice")?).ok()?,
            volume_24h: Self::parse_str_f64(entry.get("quoteVolume")?).ok()?,
            change_24h_pct: Self::parse_str_f64(entry.get("priceChangePercent")?).ok()?,
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self), name = "binance::get_symbols")]
    async fn get_symbols(&self) -> Result<Vec<SymbolRule>, ExchangeError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let body = self
            .execute(EndpointFamily::MarketData, self.http.get(&url))
            .await?;

        let entries = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .ok_or_else(|| {
                ExchangeError::Transport("exchangeInfo response missing 'symbols'".into())
            })?;

        let rules: Vec<SymbolRule> = entries.iter().filter_map(Self::parse_symbol_rule).collect();
        debug!(count = rules.len(), "symbol rules fetched");
        Ok(rules)
    }

    #[instrument(skip(self), name = "binance::get_tickers")]
    async fn get_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let body = self
            .execute(
                EndpointFamily::MarketData,
                self.http.get(&url).timeout(BATCHED_TICKER_TIMEOUT),
            )
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("ticker response is not an array".into()))?;

        let tickers: Vec<Ticker> = entries.iter().filter_map(Self::parse_ticker).collect();
        debug!(count = tickers.len(), "24h tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), name = "binance::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        let body = self
            .execute(EndpointFamily::MarketData, self.http.get(&url))
            .await?;

        Self::parse_ticker(&body)
            .ok_or_else(|| ExchangeError::Transport("malformed ticker payload".into()))
    }

    #[instrument(skip(self), name = "binance::get_candles")]
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );
        let body = self
            .execute(EndpointFamily::MarketData, self.http.get(&url))
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };

            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                Self::parse_str_f64(&arr[1])?,
                Self::parse_str_f64(&arr[2])?,
                Self::parse_str_f64(&arr[3])?,
                Self::parse_str_f64(&arr[4])?,
                Self::parse_str_f64(&arr[5])?,
                arr[6].as_i64().unwrap_or(0),
            ));
        }

        debug!(symbol, timeframe = %timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "binance::get_balances")]
    async fn get_balances(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let body = self
            .execute(EndpointFamily::Account, self.http.get(&url))
            .await?;

        let raw = body
            .get("balances")
            .and_then(|b| b.as_array())
            .ok_or_else(|| ExchangeError::Transport("account response missing 'balances'".into()))?;

        let mut balances = HashMap::new();
        for entry in raw {
            let asset = entry.get("asset").and_then(|a| a.as_str()).unwrap_or("");
            if asset.is_empty() {
                continue;
            }
            let free = entry
                .get("free")
                .map(Self::parse_str_f64)
                .transpose()?
                .unwrap_or(0.0);
            let locked = entry
                .get("locked")
                .map(Self::parse_str_f64)
                .transpose()?
                .unwrap_or(0.0);
            if free > 0.0 || locked > 0.0 {
                balances.insert(asset.to_string(), Balance { free, locked });
            }
        }

        debug!(count = balances.len(), "balances fetched");
        Ok(balances)
    }

    #[instrument(skip(self), name = "binance::get_open_orders")]
    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);
        let body = self
            .execute(EndpointFamily::Account, self.http.get(&url))
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("openOrders response is not an array".into()))?;

        let mut orders = Vec::with_capacity(raw.len());
        for entry in raw {
            let order_id = entry
                .get("orderId")
                .map(|v| v.to_string().trim_matches('"').to_string())
                .unwrap_or_default();
            let symbol = entry
                .get("symbol")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .to_string();
            if order_id.is_empty() || symbol.is_empty() {
                continue;
            }
            orders.push(OpenOrder {
                order_id,
                symbol,
                side: Self::parse_side(entry.get("side").and_then(|s| s.as_str()).unwrap_or("BUY")),
                price: entry
                    .get("price")
                    .map(Self::parse_str_f64)
                    .transpose()?
                    .unwrap_or(0.0),
                quantity: entry
                    .get("origQty")
                    .map(Self::parse_str_f64)
                    .transpose()?
                    .unwrap_or(0.0),
                created_at: entry.get("time").and_then(|t| t.as_i64()).unwrap_or(0),
            });
        }

        debug!(count = orders.len(), "open orders fetched");
        Ok(orders)
    }

    #[instrument(skip(self), name = "binance::get_closed_orders")]
    async fn get_closed_orders(&self, since: i64) -> Result<Vec<FilledOrder>, ExchangeError> {
        // Fill history is only exposed per symbol, so the query is scoped to
        // symbols this process has traded.
        let symbols: Vec<String> = self.traded_symbols.read().iter().cloned().collect();

        let mut fills = Vec::new();
        for symbol in symbols {
            let qs = self.signed_query(&format!("symbol={symbol}&startTime={since}"));
            let url = format!("{}/api/v3/myTrades?{}", self.base_url, qs);
            let body = self
                .execute(EndpointFamily::Account, self.http.get(&url))
                .await?;

            let raw = match body.as_array() {
                Some(a) => a,
                None => continue,
            };

            for entry in raw {
                let is_buyer = entry.get("isBuyer").and_then(|b| b.as_bool()).unwrap_or(false);
                fills.push(FilledOrder {
                    order_id: entry
                        .get("orderId")
                        .map(|v| v.to_string().trim_matches('"').to_string())
                        .unwrap_or_default(),
                    symbol: symbol.clone(),
                    side: if is_buyer { OrderSide::Buy } else { OrderSide::Sell },
                    price: entry
                        .get("price")
                        .map(Self::parse_str_f64)
                        .transpose()?
                        .unwrap_or(0.0),
                    quantity: entry
                        .get("qty")
                        .map(Self::parse_str_f64)
                        .transpose()?
                        .unwrap_or(0.0),
                    fee: entry
                        .get("commission")
                        .map(Self::parse_str_f64)
                        .transpose()?
                        .unwrap_or(0.0),
                    filled_at: entry.get("time").and_then(|t| t.as_i64()).unwrap_or(0),
                });
            }
        }

        fills.sort_by_key(|f| f.filled_at);
        debug!(count = fills.len(), since, "fill history fetched");
        Ok(fills)
    }

    #[instrument(skip(self, request), name = "binance::place_order", fields(symbol = %request.symbol, side = %request.side))]
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            request.symbol, request.side, request.order_type, request.quantity
        );
        if request.order_type == OrderType::Limit {
            let price = request.price.ok_or(ExchangeError::PriceIncrementInvalid)?;
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(order_type = %request.order_type, quantity = request.quantity, "placing order");

        let body = self
            .execute(EndpointFamily::Orders, self.http.post(&url))
            .await?;

        let order_id = body
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExchangeError::Transport("order response missing orderId".into()))?;

        self.traded_symbols.write().insert(request.symbol.clone());

        debug!(order_id = %order_id, "order placed");
        Ok(order_id)
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        let qs = self.signed_query(&format!("symbol={symbol}&orderId={order_id}"));
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        match self
            .execute(EndpointFamily::Orders, self.http.delete(&url))
            .await
        {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            // -2011 "Unknown order sent" means it was already filled/cancelled.
            Err(ExchangeError::ExchangeUnavailable(msg)) if msg.contains("code -2011") => {
                Ok(CancelOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
