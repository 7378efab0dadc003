pub mod atr;
pub mod bollinger;
pub mod ma;
pub mod macd;
pub mod obv;
pub mod rsi;
pub mod stochastic;
pub mod vwap;
