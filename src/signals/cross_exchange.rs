// =============================================================================
// Cross-Exchange Lead Signal — reference-venue price divergence
// =============================================================================
//
// When a reference venue prints a higher price than the primary venue, the
// primary tends to follow; the divergence becomes a bounded lead score.
// Payload carries the raw lead percentage; a positive payload means the
// reference leads upward.
// =============================================================================

use crate::signals::{MarketView, Signal, SignalSource};

/// Divergence beyond this magnitude (percent) saturates the score.
const SATURATION_PCT: f64 = 2.5;

pub struct CrossExchangeSignal;

impl SignalSource for CrossExchangeSignal {
    fn id(&self) -> &'static str {
        "cross_exchange"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        let local = view.ticker.price;
        let reference = match view.reference_price {
            Some(p) if p > 0.0 && local > 0.0 => p,
            _ => return Signal::neutral(self.id(), view.symbol),
        };

        let lead_pct = (reference - local) / local * 100.0;
        let score = 50.0 + (lead_pct / SATURATION_PCT * 50.0).clamp(-50.0, 50.0);

        // Tiny divergences are noise; confidence scales with magnitude.
        let confidence = (lead_pct.abs() / SATURATION_PCT).clamp(0.1, 1.0);

        Signal::new(self.id(), view.symbol, score, confidence).with_payload(lead_pct)
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

    fn score(local: f64, reference: Option<f64>) -> Signal {
        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            price: local,
            volume_24h: 1_000_000.0,
            change_24h_pct: 0.0,
        };
        let candles: Vec<Candle> = Vec::new();
        CrossExchangeSignal.score(&MarketView {
            symbol: "BTCUSDT",
            candles_1m: &candles,
            candles_5m: &candles,
            candles_15m: &candles,
            candles_1h: &candles,
            ticker: &ticker,
            reference_price: reference,
        })
    }

    #[test]
    fn missing_reference_is_neutral() {
        let s = score(100.0, None);
        assert!((s.score - 50.0).abs() < f64::EPSILON);
        assert!(s.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn upward_lead_is_bullish() {
        let s = score(100.0, Some(101.0));
        assert!(s.score > 50.0);
        assert!(s.payload.unwrap() > 0.0);
    }

    #[test]
    fn downward_lead_is_bearish() {
        let s = score(100.0, Some(99.0));
        assert!(s.score < 50.0);
        assert!(s.payload.unwrap() < 0.0);
    }

    #[test]
    fn large_lead_saturates() {
        let s = score(100.0, Some(110.0));
        assert!((s.score - 100.0).abs() < f64::EPSILON);
        assert!((s.confidence - 1.0).abs() < f64::EPSILON);
    }
}
