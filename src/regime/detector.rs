// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the market into one of eight regimes from the rolling
// distribution of 24 h returns across a representative sample of symbols
// (top-N by volume). Evaluated top-to-bottom; first match wins:
//
//   1. UNKNOWN      — sample too small to classify
//   2. STRONG_BULL  — median >= +5% AND consistency >= 0.70
//   3. BULL         — median >= +1% AND consistency >= 0.55
//   4. FLAT         — |median| < 1% AND realized vol < 2%
//   5. VOLATILE     — realized vol > 8% OR dispersion > 10%
//   6. STRONG_BEAR  — median <= -5% AND consistency >= 0.70
//   7. BEAR         — median <= -1%
//   8. NORMAL       — everything else
//
// Transitions are smoothed: a new regime must be observed on two consecutive
// cycles before it is adopted, except transitions INTO STRONG_BEAR or
// VOLATILE, which take effect immediately.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Minimum sample size for a meaningful classification.
const MIN_SAMPLE: usize = 5;

/// Realized-vol and dispersion thresholds (percent).
const FLAT_VOL_MAX: f64 = 2.0;
const VOLATILE_VOL_MIN: f64 = 8.0;
const VOLATILE_DISPERSION_MIN: f64 = 10.0;

/// High-level market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    StrongBull,
    Bull,
    Normal,
    Volatile,
    Flat,
    Bear,
    StrongBear,
    Unknown,
}

impl Regime {
    /// Regimes that bypass the two-cycle hysteresis on entry.
    fn is_immediate(self) -> bool {
        matches!(self, Self::StrongBear | Self::Volatile)
    }
}

impl Default for Regime {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBull => "STRONG_BULL",
            Self::Bull => "BULL",
            Self::Normal => "NORMAL",
            Self::Volatile => "VOLATILE",
            Self::Flat => "FLAT",
            Self::Bear => "BEAR",
            Self::StrongBear => "STRONG_BEAR",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Adopted regime plus the diagnostic scalars that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: Regime,
    /// Median 24 h return across the sample (percent).
    pub momentum: f64,
    /// Standard deviation of returns (percent).
    pub volatility: f64,
    /// Fraction of symbols moving with the median's sign.
    pub consistency: f64,
}

impl RegimeReading {
    fn unknown() -> Self {
        Self {
            regime: Regime::Unknown,
            momentum: 0.0,
            volatility: 0.0,
            consistency: 0.0,
        }
    }
}

/// Regime detector with two-cycle adoption hysteresis.
#[derive(Debug)]
pub struct RegimeDetector {
    current: Regime,
    last_reading: RegimeReading,
    /// Candidate regime seen last cycle but not yet adopted.
    pending: Option<Regime>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self {
            current: Regime::Unknown,
            last_reading: RegimeReading::unknown(),
            pending: None,
        }
    }

    /// Feed one cycle's 24 h return sample (percent, one entry per symbol)
    /// and get back the adopted reading.
    pub fn observe(&mut self, returns_24h_pct: &[f64]) -> RegimeReading {
        let raw = classify(returns_24h_pct);

        let adopted = self.apply_hysteresis(raw.regime);
        let reading = RegimeReading {
            regime: adopted,
            ..raw
        };

        if adopted != self.current {
            info!(from = %self.current, to = %adopted, momentum = raw.momentum,
                volatility = raw.volatility, consistency = raw.consistency,
                "regime transition adopted");
        } else {
            debug!(regime = %adopted, raw = %raw.regime, "regime observed");
        }

        self.current = adopted;
        self.last_reading = reading;
        reading
    }

    fn apply_hysteresis(&mut self, raw: Regime) -> Regime {
        if raw == self.current {
            self.pending = None;
            return self.current;
        }

        if raw.is_immediate() {
            self.pending = None;
            return raw;
        }

        match self.pending {
            Some(candidate) if candidate == raw => {
                // Second consecutive observation: adopt.
                self.pending = None;
                raw
            }
            _ => {
                self.pending = Some(raw);
                self.current
            }
        }
    }

    pub fn current(&self) -> Regime {
        self.current
    }

    pub fn last_reading(&self) -> RegimeReading {
        self.last_reading
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Classification logic
// =============================================================================

/// Classify one return sample without hysteresis.
fn classify(returns: &[f64]) -> RegimeReading {
    let finite: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
    if finite.len() < MIN_SAMPLE {
        return RegimeReading::unknown();
    }

    let momentum = median(&finite);
    let volatility = std_dev(&finite);
    let dispersion = interquartile_range(&finite);
    let consistency = sign_consistency(&finite, momentum);

    let regime = if momentum >= 5.0 && consistency >= 0.70 {
        Regime::StrongBull
    } else if momentum >= 1.0 && consistency >= 0.55 {
        Regime::Bull
    } else if momentum.abs() < 1.0 && volatility < FLAT_VOL_MAX {
        Regime::Flat
    } else if volatility > VOLATILE_VOL_MIN || dispersion > VOLATILE_DISPERSION_MIN {
        Regime::Volatile
    } else if momentum <= -5.0 && consistency >= 0.70 {
        Regime::StrongBear
    } else if momentum <= -1.0 {
        Regime::Bear
    } else {
        Regime::Normal
    };

    RegimeReading {
        regime,
        momentum,
        volatility,
        consistency,
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn std_dev(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn interquartile_range(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    let q = |p: f64| -> f64 {
        let idx = p * (sorted.len() - 1) as f64;
        let lo = idx.floor() as usize;
        let hi = idx.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            sorted[lo] + (sorted[hi] - sorted[lo]) * (idx - lo as f64)
        }
    };
    q(0.75) - q(0.25)
}

/// Fraction of the sample moving in the median's direction. A zero median
/// counts near-flat symbols as agreeing.
fn sign_consistency(values: &[f64], median: f64) -> f64 {
    let agreeing = values
        .iter()
        .filter(|&&v| {
            if median > 0.0 {
                v > 0.0
            } else if median < 0.0 {
                v < 0.0
            } else {
                v.abs() < 1.0
            }
        })
        .count();
    agreeing as f64 / values.len() as f64
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64, n: usize) -> Vec<f64> {
        vec![value; n]
    }

    #[test]
    fn insufficient_sample_is_unknown() {
        let r = classify(&[1.0, 2.0]);
        assert_eq!(r.regime, Regime::Unknown);
    }

    #[test]
    fn strong_bull() {
        let r = classify(&sample(6.0, 10));
        assert_eq!(r.regime, Regime::StrongBull);
        assert!(r.consistency >= 0.70);
    }

    #[test]
    fn bull() {
        let r = classify(&sample(2.0, 10));
        assert_eq!(r.regime, Regime::Bull);
    }

    #[test]
    fn flat() {
        let r = classify(&sample(0.2, 10));
        assert_eq!(r.regime, Regime::Flat);
    }

    #[test]
    fn volatile_by_wide_spread() {
        // Median near zero with a huge spread between winners and losers.
        let returns = vec![-20.0, -15.0, -3.0, -1.0, 1.0, 3.0, 15.0, 22.0];
        let r = classify(&returns);
        assert_eq!(r.regime, Regime::Volatile);
    }

    #[test]
    fn bull_outranks_volatile_when_both_match() {
        // First match wins: a consistent +1.5% median classifies BULL even
        // though the tails are wide.
        let returns = vec![-20.0, -15.0, -3.0, 1.0, 2.0, 3.0, 15.0, 22.0];
        let r = classify(&returns);
        assert_eq!(r.regime, Regime::Bull);
    }

    #[test]
    fn strong_bear() {
        let r = classify(&sample(-7.0, 10));
        assert_eq!(r.regime, Regime::StrongBear);
    }

    #[test]
    fn bear() {
        // Enough spread to dodge FLAT, not enough for VOLATILE.
        let returns = vec![-4.0, -3.5, -3.0, -2.5, -2.0, -1.5, 1.0, 2.0];
        let r = classify(&returns);
        assert_eq!(r.regime, Regime::Bear);
    }

    #[test]
    fn nan_entries_are_dropped() {
        let mut returns = sample(6.0, 10);
        returns.push(f64::NAN);
        let r = classify(&returns);
        assert_eq!(r.regime, Regime::StrongBull);
    }

    // ---- hysteresis ------------------------------------------------------

    #[test]
    fn adoption_requires_two_cycles() {
        let mut det = RegimeDetector::new();
        // Seed into NORMAL via two observations.
        let normal = vec![-4.0, -2.0, 0.5, 1.5, 2.5, 4.5];
        det.observe(&normal);
        det.observe(&normal);
        assert_eq!(det.current(), Regime::Normal);

        // One bull cycle does not flip it...
        let bull = sample(2.0, 10);
        let r = det.observe(&bull);
        assert_eq!(r.regime, Regime::Normal);

        // ...two do.
        let r = det.observe(&bull);
        assert_eq!(r.regime, Regime::Bull);
    }

    #[test]
    fn strong_bear_is_adopted_immediately() {
        let mut det = RegimeDetector::new();
        let normal = vec![-4.0, -2.0, 0.5, 1.5, 2.5, 4.5];
        det.observe(&normal);
        det.observe(&normal);
        assert_eq!(det.current(), Regime::Normal);

        let crash = sample(-8.0, 10);
        let r = det.observe(&crash);
        assert_eq!(r.regime, Regime::StrongBear);
    }

    #[test]
    fn volatile_is_adopted_immediately() {
        let mut det = RegimeDetector::new();
        let normal = vec![-4.0, -2.0, 0.5, 1.5, 2.5, 4.5];
        det.observe(&normal);
        det.observe(&normal);

        let wild = vec![-20.0, -15.0, -3.0, -1.0, 1.0, 3.0, 15.0, 22.0];
        let r = det.observe(&wild);
        assert_eq!(r.regime, Regime::Volatile);
    }

    #[test]
    fn interrupted_candidate_resets() {
        let mut det = RegimeDetector::new();
        let normal = vec![-4.0, -2.0, 0.5, 1.5, 2.5, 4.5];
        det.observe(&normal);
        det.observe(&normal);

        let bull = sample(2.0, 10);
        det.observe(&bull); // candidate BULL (1)
        det.observe(&normal); // back to NORMAL, candidate cleared
        let r = det.observe(&bull); // candidate BULL (1) again
        assert_eq!(r.regime, Regime::Normal);
    }
}
