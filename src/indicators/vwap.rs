// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP over the candle window using typical price (H + L + C) / 3 weighted
// by volume. Price above VWAP reads bullish, below bearish.
// =============================================================================

use crate::market_data::Candle;

/// VWAP over the entire `candles` slice.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let mut pv = 0.0;
    let mut volume = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        volume += c.volume;
    }

    if volume <= 0.0 {
        return None;
    }
    let v = pv / volume;
    v.is_finite().then_some(v)
}
