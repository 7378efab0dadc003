// =============================================================================
// Shared types used across the Meridian trading agent
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side. Spot long only: entries are always `Buy`, exits always `Sell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a position was (or is being) closed. Doubles as the strategy tag in
/// the learning memory buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeReason {
    /// Price reached the take-profit target.
    TakeProfit,
    /// Price breached the stop-loss.
    StopLoss,
    /// Voluntary early close of a small gain to free capital.
    RecycleProfit,
    /// Time-based exit after the entry thesis decayed.
    AlphaDecay,
    /// Record imported from exchange fill history during reconciliation.
    HistorySync,
}

impl TradeReason {
    /// Deterministic ordering used when several closes fire in one cycle:
    /// stop-loss first, then take-profit, then recycle, then decay.
    pub fn priority(self) -> u8 {
        match self {
            Self::StopLoss => 0,
            Self::TakeProfit => 1,
            Self::RecycleProfit => 2,
            Self::AlphaDecay => 3,
            Self::HistorySync => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TakeProfit => "take_profit",
            Self::StopLoss => "stop_loss",
            Self::RecycleProfit => "recycle_profit",
            Self::AlphaDecay => "alpha_decay",
            Self::HistorySync => "history_sync",
        }
    }
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the agent is admitting new entries or only managing what it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMode {
    /// Normal operation: new entries allowed.
    Trading,
    /// Circuit breaker tripped: monitor and close-only.
    Observing,
}

impl Default for AgentMode {
    fn default() -> Self {
        Self::Trading
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trading => write!(f, "TRADING"),
            Self::Observing => write!(f, "OBSERVING"),
        }
    }
}

/// Aggregate runtime health surfaced by the status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Ok,
    Degraded,
    Critical,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}
