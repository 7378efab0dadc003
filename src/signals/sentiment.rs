// =============================================================================
// Sentiment Signal — aggregator over pluggable external sources
// =============================================================================
//
// Third-party sentiment fetchers live outside this crate; they plug in as
// `SentimentProvider` implementations that surface their most recent bounded
// reading. The aggregator averages whatever is healthy and reports a
// confidence equal to the healthy fraction, so one dead feed degrades the
// signal instead of killing it.
// =============================================================================

use std::sync::Arc;

use crate::signals::{MarketView, Signal, SignalSource};

/// One external sentiment feed.
pub trait SentimentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Most recent sentiment reading for `symbol` in [0, 100], or `None`
    /// when the feed is unhealthy or has no data for the symbol.
    fn latest(&self, symbol: &str) -> Option<f64>;
}

/// Confidence-weighted mean over all registered providers.
pub struct SentimentAggregator {
    providers: Vec<Arc<dyn SentimentProvider>>,
}

impl SentimentAggregator {
    pub fn new(providers: Vec<Arc<dyn SentimentProvider>>) -> Self {
        Self { providers }
    }

    /// An aggregator with no feeds; always neutral.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl SignalSource for SentimentAggregator {
    fn id(&self) -> &'static str {
        "sentiment"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        if self.providers.is_empty() {
            return Signal::neutral(self.id(), view.symbol);
        }

        let readings: Vec<f64> = self
            .providers
            .iter()
            .filter_map(|p| p.latest(view.symbol))
            .map(|s| s.clamp(0.0, 100.0))
            .collect();

        if readings.is_empty() {
            return Signal::neutral(self.id(), view.symbol);
        }

        let mean = readings.iter().sum::<f64>() / readings.len() as f64;
        let confidence = readings.len() as f64 / self.providers.len() as f64;
        Signal::new(self.id(), view.symbol, mean, confidence)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Ticker;
    use crate::market_data::Candle;

    struct FixedProvider {
        value: Option<f64>,
    }

    impl SentimentProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn latest(&self, _symbol: &str) -> Option<f64> {
            self.value
        }
    }

    fn run(aggregator: &SentimentAggregator) -> Signal {
        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            price: 100.0,
            volume_24h: 0.0,
            change_24h_pct: 0.0,
        };
        let candles: Vec<Candle> = Vec::new();
        aggregator.score(&MarketView {
            symbol: "BTCUSDT",
            candles_1m: &candles,
            candles_5m: &candles,
            candles_15m: &candles,
            candles_1h: &candles,
            ticker: &ticker,
            reference_price: None,
        })
    }

    #[test]
    fn no_providers_is_neutral() {
        let s = run(&SentimentAggregator::empty());
        assert!((s.score - 50.0).abs() < f64::EPSILON);
        assert!(s.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn healthy_providers_average() {
        let agg = SentimentAggregator::new(vec![
            Arc::new(FixedProvider { value: Some(80.0) }),
            Arc::new(FixedProvider { value: Some(60.0) }),
        ]);
        let s = run(&agg);
        assert!((s.score - 70.0).abs() < f64::EPSILON);
        assert!((s.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dead_feed_degrades_confidence() {
        let agg = SentimentAggregator::new(vec![
            Arc::new(FixedProvider { value: Some(90.0) }),
            Arc::new(FixedProvider { value: None }),
        ]);
        let s = run(&agg);
        assert!((s.score - 90.0).abs() < f64::EPSILON);
        assert!((s.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_readings_are_clamped() {
        let agg = SentimentAggregator::new(vec![Arc::new(FixedProvider { value: Some(250.0) })]);
        let s = run(&agg);
        assert!((s.score - 100.0).abs() < f64::EPSILON);
    }
}
