pub mod binance;
pub mod client;
pub mod paper;
pub mod rate_limit;

pub use client::{
    Balance, CancelOutcome, ExchangeClient, ExchangeError, FilledOrder, OpenOrder, OrderRequest,
    OrderType, SymbolRule, Ticker,
};
