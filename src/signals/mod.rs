// =============================================================================
// Signal Pipeline — bounded, timestamped scores from independent sources
// =============================================================================
//
// Every fetcher implements `SignalSource` and returns a `Signal` with a score
// in [0, 100] and a confidence in [0, 1]. A fetcher that cannot produce a
// reading returns the neutral signal (score 50, confidence 0) instead of an
// error; the scorer additionally rejects signals older than the configured
// TTL.
// =============================================================================

pub mod cross_exchange;
pub mod multi_timeframe;
pub mod onchain;
pub mod sentiment;
pub mod technical;
pub mod volume;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::Ticker;
use crate::market_data::Candle;

pub use cross_exchange::CrossExchangeSignal;
pub use multi_timeframe::MultiTimeframeSignal;
pub use onchain::{OnChainSignal, WhaleEvent, WhaleFeed};
pub use sentiment::{SentimentAggregator, SentimentProvider};
pub use technical::TechnicalSignal;
pub use volume::VolumeSignal;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A bounded, timestamped score from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub source: String,
    pub symbol: String,
    /// Directional score in [0, 100]; 50 is neutral, higher is bullish.
    pub score: f64,
    /// Source confidence in [0, 1].
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
    /// Optional source-specific numeric payload (e.g. lead percent).
    #[serde(default)]
    pub payload: Option<f64>,
}

impl Signal {
    /// Build a signal, clamping score and confidence into their ranges.
    pub fn new(source: &str, symbol: &str, score: f64, confidence: f64) -> Self {
        Self {
            source: source.to_string(),
            symbol: symbol.to_string(),
            score: score.clamp(0.0, 100.0),
            confidence: confidence.clamp(0.0, 1.0),
            generated_at: Utc::now(),
            payload: None,
        }
    }

    /// The zero-information signal every fetcher falls back to on failure.
    pub fn neutral(source: &str, symbol: &str) -> Self {
        Self::new(source, symbol, 50.0, 0.0)
    }

    pub fn with_payload(mut self, payload: f64) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether this signal is older than `ttl_secs`.
    pub fn is_stale(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.generated_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 > ttl_secs
    }
}

// ---------------------------------------------------------------------------
// Market view + source trait
// ---------------------------------------------------------------------------

/// Read-only per-symbol market context assembled during ScanPhase.
pub struct MarketView<'a> {
    pub symbol: &'a str,
    pub candles_1m: &'a [Candle],
    pub candles_5m: &'a [Candle],
    pub candles_15m: &'a [Candle],
    pub candles_1h: &'a [Candle],
    pub ticker: &'a Ticker,
    /// Last price at the reference venue, when the cross-exchange feed has
    /// one for this symbol.
    pub reference_price: Option<f64>,
}

/// One opinion source in the pipeline.
pub trait SignalSource: Send + Sync {
    fn id(&self) -> &'static str;

    /// Compute the signal for the given market view. Must not fail: sources
    /// return [`Signal::neutral`] when they cannot produce a reading.
    fn score(&self, view: &MarketView<'_>) -> Signal;
}

/// The full signal set for one symbol in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSet {
    pub technical: Signal,
    pub volume: Signal,
    pub sentiment: Signal,
    pub onchain: Signal,
    pub cross_exchange: Signal,
    pub multi_timeframe: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_clamped() {
        let s = Signal::new("test", "BTCUSDT", 150.0, 2.0);
        assert!((s.score - 100.0).abs() < f64::EPSILON);
        assert!((s.confidence - 1.0).abs() < f64::EPSILON);

        let s = Signal::new("test", "BTCUSDT", -10.0, -0.5);
        assert!(s.score.abs() < f64::EPSILON);
        assert!(s.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn neutral_has_zero_confidence() {
        let s = Signal::neutral("test", "BTCUSDT");
        assert!((s.score - 50.0).abs() < f64::EPSILON);
        assert!(s.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn staleness_respects_ttl() {
        let mut s = Signal::neutral("test", "BTCUSDT");
        let now = Utc::now();
        assert!(!s.is_stale(60, now));

        s.generated_at = now - chrono::Duration::seconds(61);
        assert!(s.is_stale(60, now));

        // A timestamp from the future is treated as stale too.
        s.generated_at = now + chrono::Duration::seconds(30);
        assert!(s.is_stale(60, now));
    }
}
