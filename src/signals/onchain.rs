// =============================================================================
// On-Chain / Whale Signal — discrete events bucketed into a bounded score
// =============================================================================
//
// On-chain watchers are external; they push discrete `WhaleEvent`s through a
// `WhaleFeed`. Each event nudges the score away from neutral 50; exchange
// inflows read bearish (coins arriving to be sold), withdrawals and
// accumulation read bullish. Confidence grows with the number of recent
// events.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::signals::{MarketView, Signal, SignalSource};

/// Discrete on-chain observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhaleEvent {
    /// Large transfer onto an exchange (sell pressure).
    ExchangeInflow,
    /// Large transfer off an exchange (supply removed).
    ExchangeWithdrawal,
    /// Wallet clusters adding to holdings.
    Accumulation,
    /// Wallet clusters reducing holdings.
    Distribution,
}

impl WhaleEvent {
    /// Score nudge relative to neutral 50.
    fn nudge(self) -> f64 {
        match self {
            Self::ExchangeInflow => -12.0,
            Self::ExchangeWithdrawal => 12.0,
            Self::Accumulation => 8.0,
            Self::Distribution => -8.0,
        }
    }
}

/// Source of recent whale events for a symbol's base asset.
pub trait WhaleFeed: Send + Sync {
    /// Events observed within the feed's own recency window.
    fn recent_events(&self, symbol: &str) -> Vec<WhaleEvent>;
}

pub struct OnChainSignal {
    feed: Option<Arc<dyn WhaleFeed>>,
}

impl OnChainSignal {
    pub fn new(feed: Arc<dyn WhaleFeed>) -> Self {
        Self { feed: Some(feed) }
    }

    /// No feed attached; always neutral.
    pub fn disabled() -> Self {
        Self { feed: None }
    }
}

impl SignalSource for OnChainSignal {
    fn id(&self) -> &'static str {
        "onchain"
    }

    fn score(&self, view: &MarketView<'_>) -> Signal {
        let feed = match &self.feed {
            Some(f) => f,
            None => return Signal::neutral(self.id(), view.symbol),
        };

        let events = feed.recent_events(view.symbol);
        if events.is_empty() {
            return Signal::neutral(self.id(), view.symbol);
        }

        let score = 50.0 + events.iter().map(|e| e.nudge()).sum::<f64>();
        // Three or more events is a full-confidence read.
        let confidence = (events.len() as f64 / 3.0).min(1.0);

        Signal::new(self.id(), view.symbol, score, confidence).with_payload(events.len() as f64)
    }
}
