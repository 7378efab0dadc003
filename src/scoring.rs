// =============================================================================
// Unified Scorer — regime-adaptive composite score and tier assignment
// =============================================================================
//
// Composite = 0.40·technical + 0.30·intelligence + 0.15·multi_timeframe
//           + 0.10·volume + 0.05·sentiment
//
// In VOLATILE and STRONG_BEAR the technical weight drops by 0.10, shifted
// into multi-timeframe (+0.05) and sentiment (+0.05). In STRONG_BULL the
// multi-timeframe weight gains 0.05 at sentiment's expense. Weights always
// sum to 1.
//
// Intelligence is the confidence-weighted blend of the on-chain and
// cross-exchange signals. Stale signals (older than the TTL) are replaced
// with neutral 50 before weighting.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::learning::LearningMemory;
use crate::regime::Regime;
use crate::signals::{Signal, SignalSet};

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Discrete quality band; drives position sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    GodTier,
    HighConfidence,
    StrongSetup,
    Good,
    Standard,
    Skip,
}

impl Tier {
    pub fn from_composite(composite: f64) -> Self {
        if composite >= 95.0 {
            Self::GodTier
        } else if composite >= 90.0 {
            Self::HighConfidence
        } else if composite >= 85.0 {
            Self::StrongSetup
        } else if composite >= 80.0 {
            Self::Good
        } else if composite >= 70.0 {
            Self::Standard
        } else {
            Self::Skip
        }
    }

    /// Base-size multiplier.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::GodTier => 4.0,
            Self::HighConfidence => 3.0,
            Self::StrongSetup => 2.0,
            Self::Good => 1.5,
            Self::Standard => 1.0,
            Self::Skip => 0.0,
        }
    }

    /// Take-profit percent for this tier.
    pub fn take_profit_pct(self) -> f64 {
        match self {
            Self::GodTier => 3.0,
            Self::HighConfidence => 2.5,
            Self::StrongSetup => 2.5,
            Self::Good => 2.0,
            Self::Standard => 1.5,
            Self::Skip => 0.0,
        }
    }

    /// One tier up, capped at GodTier. Skip never promotes.
    pub fn promoted(self) -> Self {
        match self {
            Self::GodTier | Self::HighConfidence => Self::GodTier,
            Self::StrongSetup => Self::HighConfidence,
            Self::Good => Self::StrongSetup,
            Self::Standard => Self::Good,
            Self::Skip => Self::Skip,
        }
    }

    /// One tier down; Standard demotes out of the admissible set.
    pub fn demoted(self) -> Self {
        match self {
            Self::GodTier => Self::HighConfidence,
            Self::HighConfidence => Self::StrongSetup,
            Self::StrongSetup => Self::Good,
            Self::Good => Self::Standard,
            Self::Standard | Self::Skip => Self::Skip,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GodTier => "GOD_TIER",
            Self::HighConfidence => "HIGH_CONFIDENCE",
            Self::StrongSetup => "STRONG_SETUP",
            Self::Good => "GOOD",
            Self::Standard => "STANDARD",
            Self::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Component scores & weights
// ---------------------------------------------------------------------------

/// The five composite components, each in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub technical: f64,
    pub intelligence: f64,
    pub multi_timeframe: f64,
    pub volume: f64,
    pub sentiment: f64,
}

/// Regime-adaptive component weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeWeights {
    pub technical: f64,
    pub intelligence: f64,
    pub multi_timeframe: f64,
    pub volume: f64,
    pub sentiment: f64,
}

impl CompositeWeights {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Volatile | Regime::StrongBear => Self {
                technical: 0.30,
                intelligence: 0.30,
                multi_timeframe: 0.20,
                volume: 0.10,
                sentiment: 0.10,
            },
            Regime::StrongBull => Self {
                technical: 0.40,
                intelligence: 0.30,
                multi_timeframe: 0.20,
                volume: 0.10,
                sentiment: 0.00,
            },
            _ => Self {
                technical: 0.40,
                intelligence: 0.30,
                multi_timeframe: 0.15,
                volume: 0.10,
                sentiment: 0.05,
            },
        }
    }

    pub fn sum(&self) -> f64 {
        self.technical + self.intelligence + self.multi_timeframe + self.volume + self.sentiment
    }
}

// ---------------------------------------------------------------------------
// Scored opportunity
// ---------------------------------------------------------------------------

/// A symbol scored in one cycle, before risk sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredOpportunity {
    pub symbol: String,
    pub composite: f64,
    pub components: ComponentScores,
    pub tier: Tier,
    /// Regime the composite was weighted under.
    pub regime: Regime,
    /// Last price at scoring time (suggested entry).
    pub price: f64,
    pub volume_24h: f64,
    /// ATR percent on the 5m series, when computable.
    pub atr_pct: Option<f64>,
    pub rationale: String,
}

// ---------------------------------------------------------------------------
// Scoring pipeline
// ---------------------------------------------------------------------------

/// A signal's effective score: neutral 50 when stale or absent confidence.
fn effective(signal: &Signal, ttl_secs: u64, now: DateTime<Utc>) -> (f64, f64) {
    if signal.is_stale(ttl_secs, now) {
        (50.0, 0.0)
    } else {
        (signal.score, signal.confidence)
    }
}

/// Fold a signal set into the five component scores, rejecting stale inputs.
pub fn component_scores(set: &SignalSet, ttl_secs: u64, now: DateTime<Utc>) -> ComponentScores {
    let (technical, _) = effective(&set.technical, ttl_secs, now);
    let (volume, _) = effective(&set.volume, ttl_secs, now);
    let (sentiment, _) = effective(&set.sentiment, ttl_secs, now);
    let (mtf, _) = effective(&set.multi_timeframe, ttl_secs, now);

    // Intelligence blends on-chain and cross-exchange by confidence.
    let (onchain, onchain_conf) = effective(&set.onchain, ttl_secs, now);
    let (cross, cross_conf) = effective(&set.cross_exchange, ttl_secs, now);
    let conf_sum = onchain_conf + cross_conf;
    let intelligence = if conf_sum > 0.0 {
        (onchain * onchain_conf + cross * cross_conf) / conf_sum
    } else {
        50.0
    };

    ComponentScores {
        technical,
        intelligence,
        multi_timeframe: mtf,
        volume,
        sentiment,
    }
}

/// Weighted composite of the component scores for the given regime.
pub fn composite(components: &ComponentScores, regime: Regime) -> f64 {
    let w = CompositeWeights::for_regime(regime);
    components.technical * w.technical
        + components.intelligence * w.intelligence
        + components.multi_timeframe * w.multi_timeframe
        + components.volume * w.volume
        + components.sentiment * w.sentiment
}

/// Score one symbol: composite, tier from the ladder, then learning-memory
/// promotion/demotion (win-rate < 0.30 over >= 5 trades demotes one tier;
/// >= 0.70 over >= 10 trades promotes one, capped at GodTier).
pub fn score_symbol(
    symbol: &str,
    set: &SignalSet,
    regime: Regime,
    learning: &LearningMemory,
    price: f64,
    volume_24h: f64,
    atr_pct: Option<f64>,
    ttl_secs: u64,
    now: DateTime<Utc>,
) -> ScoredOpportunity {
    let components = component_scores(set, ttl_secs, now);
    let composite_score = composite(&components, regime);
    let base_tier = Tier::from_composite(composite_score);

    let tier = match learning.tier_adjustment(regime) {
        a if a > 0 => base_tier.promoted(),
        a if a < 0 => base_tier.demoted(),
        _ => base_tier,
    };

    let rationale = format!(
        "tech {:.0} intel {:.0} mtf {:.0} vol {:.0} sent {:.0} @ {}",
        components.technical,
        components.intelligence,
        components.multi_timeframe,
        components.volume,
        components.sentiment,
        regime
    );

    debug!(
        symbol,
        composite = composite_score,
        tier = %tier,
        base_tier = %base_tier,
        %regime,
        "symbol scored"
    );

    ScoredOpportunity {
        symbol: symbol.to_string(),
        composite: composite_score,
        components,
        tier,
        regime,
        price,
        volume_24h,
        atr_pct,
        rationale,
    }
}

/// Rank scored symbols: composite descending, ties broken by technical
/// subscore then 24 h volume. Skip-tier entries are dropped; at most `k`
/// survive.
pub fn rank(mut opportunities: Vec<ScoredOpportunity>, k: usize) -> Vec<ScoredOpportunity> {
    opportunities.retain(|o| o.tier != Tier::Skip);
    opportunities.sort_by(|a, b| {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.components
                    .technical
                    .partial_cmp(&a.components.technical)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.volume_24h
                    .partial_cmp(&a.volume_24h)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    opportunities.truncate(k);
    opportunities
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Signal;

    fn signal(source: &str, score: f64, confidence: f64) -> Signal {
        Signal::new(source, "BTCUSDT", score, confidence)
    }

    fn set(tech: f64, intel: f64, mtf: f64, vol: f64, sent: f64) -> SignalSet {
        SignalSet {
            technical: signal("technical", tech, 1.0),
            volume: signal("volume", vol, 1.0),
            sentiment: signal("sentiment", sent, 1.0),
            onchain: signal("onchain", intel, 1.0),
            cross_exchange: signal("cross_exchange", intel, 1.0),
            multi_timeframe: signal("multi_timeframe", mtf, 1.0),
        }
    }

    #[test]
    fn tier_ladder() {
        assert_eq!(Tier::from_composite(96.0), Tier::GodTier);
        assert_eq!(Tier::from_composite(95.0), Tier::GodTier);
        assert_eq!(Tier::from_composite(91.0), Tier::HighConfidence);
        assert_eq!(Tier::from_composite(86.0), Tier::StrongSetup);
        assert_eq!(Tier::from_composite(81.0), Tier::Good);
        assert_eq!(Tier::from_composite(72.0), Tier::Standard);
        assert_eq!(Tier::from_composite(69.9), Tier::Skip);
    }

    #[test]
    fn tier_promotion_caps_at_god() {
        assert_eq!(Tier::GodTier.promoted(), Tier::GodTier);
        assert_eq!(Tier::Standard.promoted(), Tier::Good);
        assert_eq!(Tier::Skip.promoted(), Tier::Skip);
    }

    #[test]
    fn tier_demotion_drops_standard_to_skip() {
        assert_eq!(Tier::Standard.demoted(), Tier::Skip);
        assert_eq!(Tier::GodTier.demoted(), Tier::HighConfidence);
    }

    #[test]
    fn weights_sum_to_one_in_every_regime() {
        for regime in [
            Regime::StrongBull,
            Regime::Bull,
            Regime::Normal,
            Regime::Volatile,
            Regime::Flat,
            Regime::Bear,
            Regime::StrongBear,
            Regime::Unknown,
        ] {
            let w = CompositeWeights::for_regime(regime);
            assert!((w.sum() - 1.0).abs() < 1e-9, "weights for {regime} sum to {}", w.sum());
        }
    }

    #[test]
    fn composite_matches_documented_weighted_sum() {
        let components = ComponentScores {
            technical: 80.0,
            intelligence: 70.0,
            multi_timeframe: 60.0,
            volume: 50.0,
            sentiment: 40.0,
        };
        let c = composite(&components, Regime::Normal);
        let expected = 0.40 * 80.0 + 0.30 * 70.0 + 0.15 * 60.0 + 0.10 * 50.0 + 0.05 * 40.0;
        assert!((c - expected).abs() < 1e-6);
    }

    #[test]
    fn volatile_regime_shifts_weight_off_technical() {
        let components = ComponentScores {
            technical: 100.0,
            intelligence: 50.0,
            multi_timeframe: 50.0,
            volume: 50.0,
            sentiment: 50.0,
        };
        let normal = composite(&components, Regime::Normal);
        let volatile = composite(&components, Regime::Volatile);
        assert!(volatile < normal);
    }

    #[test]
    fn stale_signals_fall_back_to_neutral() {
        let now = Utc::now();
        let mut s = set(90.0, 90.0, 90.0, 90.0, 90.0);
        s.technical.generated_at = now - chrono::Duration::seconds(120);

        let components = component_scores(&s, 60, now);
        assert!((components.technical - 50.0).abs() < f64::EPSILON);
        assert!((components.volume - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn intelligence_blend_is_confidence_weighted() {
        let now = Utc::now();
        let mut s = set(50.0, 50.0, 50.0, 50.0, 50.0);
        s.onchain = signal("onchain", 80.0, 0.9);
        s.cross_exchange = signal("cross_exchange", 20.0, 0.1);

        let components = component_scores(&s, 60, now);
        let expected = (80.0 * 0.9 + 20.0 * 0.1) / 1.0;
        assert!((components.intelligence - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_confidence_intelligence_is_neutral() {
        let now = Utc::now();
        let mut s = set(50.0, 50.0, 50.0, 50.0, 50.0);
        s.onchain = signal("onchain", 99.0, 0.0);
        s.cross_exchange = signal("cross_exchange", 1.0, 0.0);

        let components = component_scores(&s, 60, now);
        assert!((components.intelligence - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rank_sorts_and_breaks_ties() {
        let mk = |symbol: &str, composite: f64, tech: f64, vol: f64| ScoredOpportunity {
            symbol: symbol.to_string(),
            composite,
            components: ComponentScores {
                technical: tech,
                intelligence: 50.0,
                multi_timeframe: 50.0,
                volume: 50.0,
                sentiment: 50.0,
            },
            tier: Tier::Standard,
            regime: Regime::Normal,
            price: 1.0,
            volume_24h: vol,
            atr_pct: None,
            rationale: String::new(),
        };

        let ranked = rank(
            vec![
                mk("LOW", 71.0, 50.0, 10.0),
                mk("TIE_B", 80.0, 60.0, 5.0),
                mk("TIE_A", 80.0, 60.0, 9.0),
                mk("TECH", 80.0, 70.0, 1.0),
            ],
            3,
        );

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].symbol, "TECH"); // higher technical wins the tie
        assert_eq!(ranked[1].symbol, "TIE_A"); // then higher volume
        assert_eq!(ranked[2].symbol, "TIE_B");
    }

    #[test]
    fn rank_drops_skip_tier() {
        let mut opp = ScoredOpportunity {
            symbol: "X".into(),
            composite: 40.0,
            components: ComponentScores {
                technical: 40.0,
                intelligence: 40.0,
                multi_timeframe: 40.0,
                volume: 40.0,
                sentiment: 40.0,
            },
            tier: Tier::Skip,
            regime: Regime::Normal,
            price: 1.0,
            volume_24h: 1.0,
            atr_pct: None,
            rationale: String::new(),
        };
        assert!(rank(vec![opp.clone()], 10).is_empty());

        opp.tier = Tier::Standard;
        assert_eq!(rank(vec![opp], 10).len(), 1);
    }
}
