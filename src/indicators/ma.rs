// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    let avg = sum / period as f64;
    avg.is_finite().then_some(avg)
}

/// Exponential moving average series over `values`.
///
/// Seeded with the SMA of the first `period` values; one output per input
/// from index `period - 1` onward. Smoothing factor `k = 2 / (period + 1)`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        prev = v * k + prev * (1.0 - k);
        if !prev.is_finite() {
            break;
        }
        out.push(prev);
    }
    out
}

/// Most recent EMA value.
pub fn ema_latest(values: &[f64], period: usize) -> Option<f64> {
    ema(values, period).last().copied()
}
