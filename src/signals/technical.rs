// =============================================================================
// Technical Signal — weighted blend of eight indicators plus volume
// =============================================================================
//
// Each indicator contributes a directional reading in [0, 100] (higher is
// bullish). The blend uses fixed weights:
//
//   RSI 0.10, MACD 0.15, Bollinger 0.10, MA 0.15, OBV 0.10, Stochastic 0.10,
//   VWAP 0.10, ATR 0.05, Volume 0.15
//
// Indicators that cannot produce a reading fall back to neutral 50 and
// reduce the signal confidence proportionally. All indicators run on the 5m
// series.
// =============================================================================

use crate::indicators::{atr, bollinger, ma, macd, obv, rsi, stochastic, vwap};
use crate::market_data::Candle;
use crate::signals::{MarketView, Signal, SignalSource};

const W_RSI: f64 = 0.10;
const W_MACD: f64 = 0.15;
const W_BB: f64 = 0.10;
const W_MA: f64 = 0.15;
const W_OBV: f64 = 0.10;
const W_STOCH: f64 = 0.10;
const W_VWAP: f64 = 0.10;
const W_ATR: f64 = 0.05;
const W_VOLUME: f64 = 0.15;

pub struct TechnicalSignal;

impl SignalSource for TechnicalSignal {
    fn id(&self) -> &'static str {
        "technical"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        let candles = view.candles_5m;
        if candles.len() < 30 {
            return Signal::neutral(self.id(), view.symbol);
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = match closes.last() {
            Some(&p) if p > 0.0 => p,
            _ => return Signal::neutral(self.id(), view.symbol),
        };

        let mut weighted = 0.0;
        let mut available = 0usize;
        let mut total = 0usize;

        let mut add = |contribution: Option<f64>, weight: f64| {
            total += 1;
            match contribution {
                Some(c) => {
                    weighted += c.clamp(0.0, 100.0) * weight;
                    available += 1;
                }
                None => weighted += 50.0 * weight,
            }
        };

        add(rsi::latest(&closes, 14).map(rsi_contribution), W_RSI);
        add(
            macd::macd(&closes, 12, 26, 9).map(|m| macd_contribution(&m, price)),
            W_MACD,
        );
        add(
            bollinger::bollinger(&closes, 20, 2.0).map(|b| bollinger_contribution(&b, price)),
            W_BB,
        );
        add(ma_contribution(&closes, price), W_MA);
        add(
            obv::obv_slope(candles, 20).map(|s| 50.0 + s * 50.0),
            W_OBV,
        );
        add(
            stochastic::stochastic(candles, 14, 3).map(|s| stoch_contribution(&s)),
            W_STOCH,
        );
        add(
            vwap::vwap(candles).map(|v| vwap_contribution(v, price)),
            W_VWAP,
        );
        add(atr::atr_pct(candles, 14).map(atr_contribution), W_ATR);
        add(relative_volume_contribution(candles), W_VOLUME);

        let confidence = available as f64 / total as f64;
        Signal::new(self.id(), view.symbol, weighted, confidence)
    }
}

// ---------------------------------------------------------------------------
// Per-indicator contributions
// ---------------------------------------------------------------------------

/// Oversold reads bullish for a long-only agent; overbought bearish.
fn rsi_contribution(rsi: f64) -> f64 {
    100.0 - rsi
}

fn macd_contribution(m: &macd::Macd, price: f64) -> f64 {
    let hist_pct = m.histogram / price * 100.0;
    50.0 + (hist_pct * 25.0).clamp(-50.0, 50.0)
}

/// Position inside the bands, inverted: at the lower band reads 100.
fn bollinger_contribution(b: &bollinger::Bands, price: f64) -> f64 {
    let span = b.upper - b.lower;
    if span <= f64::EPSILON {
        return 50.0;
    }
    let position = ((price - b.lower) / span).clamp(0.0, 1.0);
    (1.0 - position) * 100.0
}

/// Trend alignment across the 20/50 moving averages.
fn ma_contribution(closes: &[f64], price: f64) -> Option<f64> {
    let ma20 = ma::sma(closes, 20)?;
    let ma50 = ma::sma(closes, 50)?;

    Some(if price > ma20 && ma20 > ma50 {
        85.0
    } else if price > ma20 {
        65.0
    } else if ma20 > ma50 {
        55.0
    } else if price < ma20 && ma20 < ma50 {
        15.0
    } else {
        35.0
    })
}

fn stoch_contribution(s: &stochastic::Stochastic) -> f64 {
    // Same inversion as RSI, softened by %D agreement.
    let base = 100.0 - s.k;
    let confirm = 100.0 - s.d;
    base * 0.7 + confirm * 0.3
}

fn vwap_contribution(vwap_value: f64, price: f64) -> f64 {
    if vwap_value <= 0.0 {
        return 50.0;
    }
    let dev_pct = (price - vwap_value) / vwap_value * 100.0;
    50.0 + (dev_pct * 10.0).clamp(-50.0, 50.0)
}

/// Volatility sweet spot: enough range to clear fees, not enough to blow
/// through stops.
fn atr_contribution(atr_pct: f64) -> f64 {
    if (0.5..=3.0).contains(&atr_pct) {
        70.0
    } else if atr_pct < 0.5 {
        40.0
    } else if atr_pct <= 6.0 {
        45.0
    } else {
        25.0
    }
}

/// Last-candle volume relative to the 20-candle average.
pub fn relative_volume_contribution(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 21 {
        return None;
    }
    let last = candles.last()?.volume;
    let window = &candles[candles.len() - 21..candles.len() - 1];
    let avg: f64 = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
    if avg <= 0.0 {
        return None;
    }

    let ratio = last / avg;
    Some(if ratio >= 2.0 {
        90.0
    } else if ratio >= 1.5 {
        75.0
    } else if ratio >= 1.0 {
        60.0
    } else if ratio >= 0.5 {
        45.0
    } else {
        30.0
    })
}
