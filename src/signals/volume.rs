// =============================================================================
// Volume Signal — relative participation on the 5m series
// =============================================================================

use crate::signals::technical::relative_volume_contribution;
use crate::signals::{MarketView, Signal, SignalSource};

pub struct VolumeSignal;

impl SignalSource for VolumeSignal {
    fn id(&self) -> &'static str {
        "volume"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        match relative_volume_contribution(view.candles_5m) {
            Some(score) => Signal::new(self.id(), view.symbol, score, 0.9),
            None => Signal::neutral(self.id(), view.symbol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Ticker;
    use crate::market_data::Candle;

    #[test]
    fn no_history_is_neutral() {
        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            price: 100.0,
            volume_24h: 0.0,
            change_24h_pct: 0.0,
        };
        let candles: Vec<Candle> = Vec::new();
        let s = VolumeSignal.score(&MarketView {
            symbol: "BTCUSDT",
            candles_1m: &candles,
            candles_5m: &candles,
            candles_15m: &candles,
            candles_1h: &candles,
            ticker: &ticker,
            reference_price: None,
        });
        assert!((s.score - 50.0).abs() < f64::EPSILON);
        assert!(s.confidence.abs() < f64::EPSILON);
    }
}
