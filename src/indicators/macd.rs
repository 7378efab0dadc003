// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)
// Signal     = EMA(signal_period) of the MACD line
// Histogram  = MACD - Signal
//
// Standard parameterization: 12 / 26 / 9.
// =============================================================================

use crate::indicators::ma::ema;

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD values.
///
/// Returns `None` when there are not enough closes to produce at least
/// `signal_period` MACD points (i.e. fewer than `slow + signal_period - 1`).
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow <= fast || signal_period == 0 {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let fast_series = ema(closes, fast);
    let slow_series = ema(closes, slow);

    // Align the two series on their tails; the slow EMA starts later.
    let offset = fast_series.len() - slow_series.len();
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd_val = *macd_line.last()?;

    let out = Macd {
        macd: macd_val,
        signal,
        histogram: macd_val - signal,
    };
    (out.macd.is_finite() && out.signal.is_finite()).then_some(out)
}
