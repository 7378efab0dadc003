// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle = SMA(period), bands at +/- k standard deviations. Width is the
// band spread as a percentage of the middle, the volatility metric used by
// the technical signal.
// =============================================================================

use crate::indicators::ma::sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100.
    pub width_pct: f64,
}

/// Bollinger bands over the last `period` closes with `k` standard deviations.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bands> {
    if period < 2 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = sma(window, period)?;

    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    if !std_dev.is_finite() {
        return None;
    }

    let upper = middle + k * std_dev;
    let lower = middle - k * std_dev;
    let width_pct = if middle != 0.0 {
        (upper - lower) / middle * 100.0
    } else {
        0.0
    };

    Some(Bands {
        upper,
        middle,
        lower,
        width_pct,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(bollinger(&[1.0], 20, 2.0).is_none());
        assert!(bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn constant_series_collapses_bands() {
        let closes = vec![100.0; 25];
        let b = bollinger(&closes, 20, 2.0).unwrap();
        assert!((b.upper - 100.0).abs() < 1e-9);
        assert!((b.lower - 100.0).abs() < 1e-9);
        assert!(b.width_pct.abs() < 1e-9);
    }

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let b = bollinger(&closes, 20, 2.0).unwrap();
        assert!(b.lower < b.middle);
        assert!(b.middle < b.upper);
        assert!(b.width_pct > 0.0);
    }

    #[test]
    fn wider_k_widens_bands() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64).sin() * 3.0).collect();
        let narrow = bollinger(&closes, 20, 1.0).unwrap();
        let wide = bollinger(&closes, 20, 3.0).unwrap();
        assert!(wide.width_pct > narrow.width_pct);
    }
}
