// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
// %K = 100 * (close - lowest_low(k_period)) / (highest_high - lowest_low)
// %D = SMA(%K, d_period)
//
// Standard parameterization: 14 / 3.
// =============================================================================

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Latest stochastic reading over `candles` (oldest first).
///
/// Needs at least `k_period + d_period - 1` candles to produce a smoothed %D.
pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Option<Stochastic> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period - 1 {
        return None;
    }

    let k_at = |end: usize| -> Option<f64> {
        let window = &candles[end + 1 - k_period..=end];
        let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let close = candles[end].close;

        if !low.is_finite() || !high.is_finite() {
            return None;
        }
        if (high - low).abs() < f64::EPSILON {
            // No range at all; treat as mid-scale.
            return Some(50.0);
        }
        Some(((close - low) / (high - low) * 100.0).clamp(0.0, 100.0))
    };

    let last = candles.len() - 1;
    let mut k_values = Vec::with_capacity(d_period);
    for end in (last + 1 - d_period)..=last {
        k_values.push(k_at(end)?);
    }

    let k = *k_values.last()?;
    let d = k_values.iter().sum::<f64>() / d_period as f64;
    Some(Stochastic { k, d })
}
