// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Step 1 — price deltas from consecutive closes.
// Step 2 — seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder smoothing:
//            avg = (prev_avg * (period - 1) + current) / period
// Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
//
// Thresholds: RSI > 70 overbought, RSI < 30 oversold.
// =============================================================================

/// Most recent RSI value for `closes` over `period`.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// closes, or the computation goes non-finite.
pub fn latest(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
    let period_f = period as f64;
    avg_gain /= period_f;
    avg_loss /= period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    from_averages(avg_gain, avg_loss)
}

/// Convert smoothed averages into an RSI value in [0, 100].
///
/// Flat input (both averages zero) is neutral 50; all-gain input saturates
/// at 100.
fn from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(latest(&[], 14).is_none());
    }

    #[test]
    fn period_zero() {
        assert!(latest(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn insufficient_data() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(latest(&closes, 14).is_none());
    }

    #[test]
    fn all_gains_saturate_at_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let rsi = latest(&closes, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-10);
    }

    #[test]
    fn all_losses_hit_zero() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let rsi = latest(&closes, 14).unwrap();
        assert!(rsi.abs() < 1e-10);
    }

    #[test]
    fn flat_market_is_neutral() {
        let closes = vec![100.0; 30];
        let rsi = latest(&closes, 14).unwrap();
        assert!((rsi - 50.0).abs() < 1e-10);
    }

    #[test]
    fn stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let rsi = latest(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }
}
