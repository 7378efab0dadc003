// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// Running volume total that adds volume on up-closes and subtracts it on
// down-closes. The level itself is arbitrary; the slope is the signal.
// =============================================================================

use crate::market_data::Candle;

/// OBV series over `candles` (oldest first). One value per candle; the first
/// is zero.
pub fn obv(candles: &[Candle]) -> Vec<f64> {
    if candles.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(candles.len());
    out.push(0.0);
    let mut running = 0.0;

    for pair in candles.windows(2) {
        let prev = &pair[0];
        let curr = &pair[1];
        if curr.close > prev.close {
            running += curr.volume;
        } else if curr.close < prev.close {
            running -= curr.volume;
        }
        out.push(running);
    }
    out
}

/// Slope of OBV over the last `lookback` candles, normalized by total volume
/// in the window. Positive means accumulation, negative distribution; roughly
/// bounded to [-1, 1].
pub fn obv_slope(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback < 2 || candles.len() < lookback {
        return None;
    }
    let series = obv(candles);
    let window = &series[series.len() - lookback..];
    let delta = window.last()? - window.first()?;

    let total_volume: f64 = candles[candles.len() - lookback..]
        .iter()
        .map(|c| c.volume)
        .sum();
    if total_volume <= 0.0 {
        return Some(0.0);
    }
    Some((delta / total_volume).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new(0, close, close + 1.0, close - 1.0, close, volume, 0)
    }

    #[test]
    fn empty_input() {
        assert!(obv(&[]).is_empty());
        assert!(obv_slope(&[], 10).is_none());
    }

    #[test]
    fn rising_closes_accumulate() {
        let candles: Vec<Candle> = (1..=5).map(|i| candle(i as f64, 10.0)).collect();
        let series = obv(&candles);
        assert_eq!(series, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        let slope = obv_slope(&candles, 5).unwrap();
        assert!(slope > 0.0);
    }

    #[test]
    fn falling_closes_distribute() {
        let candles: Vec<Candle> = (1..=5).rev().map(|i| candle(i as f64, 10.0)).collect();
        let slope = obv_slope(&candles, 5).unwrap();
        assert!(slope < 0.0);
    }

    #[test]
    fn unchanged_closes_are_ignored() {
        let candles = vec![candle(5.0, 10.0), candle(5.0, 50.0), candle(5.0, 99.0)];
        let series = obv(&candles);
        assert_eq!(series, vec![0.0, 0.0, 0.0]);
    }
}
