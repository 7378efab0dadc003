// =============================================================================
// Multi-Timeframe Signal — trend alignment across 1m / 5m / 15m / 1h
// =============================================================================
//
// A timeframe counts as aligned when its 20-period MA sits above its
// 50-period MA and price is above the 20-period MA. Score by aligned count:
// 4 -> 100, 3 -> 75, 2 -> 50, 1 -> 25, 0 -> 0. Confidence reflects how many
// timeframes had enough history to evaluate.
// =============================================================================

use crate::indicators::ma;
use crate::market_data::Candle;
use crate::signals::{MarketView, Signal, SignalSource};

pub struct MultiTimeframeSignal;

impl MultiTimeframeSignal {
    /// Bullish-alignment check for a single timeframe series.
    fn aligned(candles: &[Candle]) -> Option<bool> {
        if candles.len() < 50 {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = *closes.last()?;
        let ma20 = ma::sma(&closes, 20)?;
        let ma50 = ma::sma(&closes, 50)?;
        Some(ma20 > ma50 && price > ma20)
    }
}

impl SignalSource for MultiTimeframeSignal {
    fn id(&self) -> &'static str {
        "multi_timeframe"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        let frames = [
            view.candles_1m,
            view.candles_5m,
            view.candles_15m,
            view.candles_1h,
        ];

        let mut aligned = 0u32;
        let mut evaluated = 0u32;
        for frame in frames {
            if let Some(is_aligned) = Self::aligned(frame) {
                evaluated += 1;
                if is_aligned {
                    aligned += 1;
                }
            }
        }

        if evaluated == 0 {
            return Signal::neutral(self.id(), view.symbol);
        }

        let score = match aligned {
            4 => 100.0,
            3 => 75.0,
            2 => 50.0,
            1 => 25.0,
            _ => 0.0,
        };
        let confidence = evaluated as f64 / frames.len() as f64;

        Signal::new(self.id(), view.symbol, score, confidence).with_payload(aligned as f64)
    }
}
