pub mod candles;

// Re-export for convenient access (e.g. `use crate::market_data::Candle`).
pub use candles::{Candle, CandleKey, CandleStore, Timeframe};
