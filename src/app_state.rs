// =============================================================================
// Application Context — every subsystem, threaded explicitly through the loop
// =============================================================================
//
// No global singletons: main builds one AppState and hands Arcs to the agent
// loop and the status API. The agent loop is the single writer for trading
// state; the API only ever reads snapshots.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::exchange::ExchangeClient;
use crate::execution::ExecutionEngine;
use crate::learning::LearningMemory;
use crate::market_data::CandleStore;
use crate::reconcile::{ReconcileReport, ReportLevel};
use crate::regime::{RegimeDetector, RegimeReading};
use crate::runtime_config::RuntimeConfig;
use crate::scoring::ScoredOpportunity;
use crate::signals::{
    CrossExchangeSignal, MultiTimeframeSignal, OnChainSignal, SentimentAggregator,
    TechnicalSignal, VolumeSignal,
};
use crate::state::ledger::TradeLedger;
use crate::state::{StateSnapshot, StateStore};
use crate::types::RuntimeStatus;
use crate::universe::SymbolUniverse;

/// Candles retained per (symbol, timeframe) series.
const CANDLE_CAP: usize = 500;

/// The signal sources evaluated for every scanned symbol.
pub struct SignalPipeline {
    pub technical: TechnicalSignal,
    pub volume: VolumeSignal,
    pub sentiment: SentimentAggregator,
    pub onchain: OnChainSignal,
    pub cross_exchange: CrossExchangeSignal,
    pub multi_timeframe: MultiTimeframeSignal,
}

impl Default for SignalPipeline {
    fn default() -> Self {
        Self {
            technical: TechnicalSignal,
            volume: VolumeSignal,
            sentiment: SentimentAggregator::empty(),
            onchain: OnChainSignal::disabled(),
            cross_exchange: CrossExchangeSignal,
            multi_timeframe: MultiTimeframeSignal,
        }
    }
}

pub struct AppState {
    pub config: RwLock<RuntimeConfig>,
    pub client: Arc<dyn ExchangeClient>,
    pub universe: Arc<SymbolUniverse>,
    pub state: Arc<StateStore>,
    pub ledger: Arc<TradeLedger>,
    pub learning: RwLock<LearningMemory>,
    pub regime: RwLock<RegimeDetector>,
    pub candles: Arc<CandleStore>,
    pub execution: ExecutionEngine,
    pub signals: SignalPipeline,

    /// Reference-venue prices for the cross-exchange lead signal, keyed by
    /// symbol. Populated by an external feed; empty means neutral.
    pub reference_prices: RwLock<HashMap<String, f64>>,

    /// This cycle's composite score per scanned symbol (recycle input).
    pub last_quality: RwLock<HashMap<String, f64>>,
    /// This cycle's ranked opportunities (status surface).
    pub last_opportunities: RwLock<Vec<ScoredOpportunity>>,

    pub last_reconcile: RwLock<Option<ReconcileReport>>,
    pub consecutive_criticals: AtomicU32,

    /// Why admission control is refusing entries, when it is.
    pub breaker_reason: RwLock<Option<String>>,

    pub cycle_count: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, client: Arc<dyn ExchangeClient>) -> Self {
        let state = Arc::new(StateStore::load_or_default(&config.state_path));
        let ledger = Arc::new(TradeLedger::open(&config.ledger_path));
        let universe = Arc::new(SymbolUniverse::load_or_default(&config.rules_cache_path));
        let learning = LearningMemory::load_or_default(&config.learning_path);

        let execution = ExecutionEngine::new(
            client.clone(),
            state.clone(),
            ledger.clone(),
            universe.clone(),
            config.fee_rate,
        );

        Self {
            config: RwLock::new(config),
            client,
            universe,
            state,
            ledger,
            learning: RwLock::new(learning),
            regime: RwLock::new(RegimeDetector::new()),
            candles: Arc::new(CandleStore::new(CANDLE_CAP)),
            execution,
            signals: SignalPipeline::default(),
            reference_prices: RwLock::new(HashMap::new()),
            last_quality: RwLock::new(HashMap::new()),
            last_opportunities: RwLock::new(Vec::new()),
            last_reconcile: RwLock::new(None),
            consecutive_criticals: AtomicU32::new(0),
            breaker_reason: RwLock::new(None),
            cycle_count: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    /// Aggregate health for the status probe.
    pub fn runtime_status(&self) -> RuntimeStatus {
        if self.consecutive_criticals.load(Ordering::SeqCst) > 0 {
            return RuntimeStatus::Critical;
        }
        let reconcile_warn = self
            .last_reconcile
            .read()
            .as_ref()
            .map(|r| r.level != ReportLevel::Ok)
            .unwrap_or(false);
        if self.universe.is_degraded() || reconcile_warn || self.breaker_reason.read().is_some() {
            return RuntimeStatus::Degraded;
        }
        RuntimeStatus::Ok
    }

    /// Build the full serialisable snapshot served by the status API.
    pub fn build_snapshot(&self) -> EngineSnapshot {
        let state = self.state.snapshot();
        EngineSnapshot {
            status: self.runtime_status().to_string(),
            mode: state.mode.to_string(),
            cycle: self.cycle_count.load(Ordering::SeqCst),
            uptime_secs: self.start_time.elapsed().as_secs(),
            regime: self.regime.read().last_reading(),
            breaker_reason: self.breaker_reason.read().clone(),
            universe_size: self.universe.len(),
            universe_degraded: self.universe.is_degraded(),
            last_reconcile: self.last_reconcile.read().clone(),
            opportunities: self.last_opportunities.read().clone(),
            state,
        }
    }
}

/// Snapshot payload for `GET /api/v1/status`.
#[derive(Debug, Serialize)]
pub struct EngineSnapshot {
    pub status: String,
    pub mode: String,
    pub cycle: u64,
    pub uptime_secs: u64,
    pub regime: RegimeReading,
    pub breaker_reason: Option<String>,
    pub universe_size: usize,
    pub universe_degraded: bool,
    pub last_reconcile: Option<ReconcileReport>,
    pub opportunities: Vec<ScoredOpportunity>,
    pub state: StateSnapshot,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state", &self.state)
            .field("universe", &self.universe)
            .field("cycle", &self.cycle_count.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;

    fn app(dir: &tempfile::TempDir) -> AppState {
        let mut cfg = RuntimeConfig::default();
        cfg.state_path = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.ledger_path = dir.path().join("trades.jsonl").to_string_lossy().into_owned();
        cfg.learning_path = dir.path().join("learning.json").to_string_lossy().into_owned();
        cfg.rules_cache_path = dir.path().join("rules.json").to_string_lossy().into_owned();

        let client: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new("USDT", 1000.0, 0.001));
        AppState::new(cfg, client)
    }

    #[test]
    fn fresh_state_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        assert_eq!(app.runtime_status(), RuntimeStatus::Ok);
    }

    #[test]
    fn breaker_reason_degrades_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        *app.breaker_reason.write() = Some("daily loss limit breached".into());
        assert_eq!(app.runtime_status(), RuntimeStatus::Degraded);
    }

    #[test]
    fn consecutive_criticals_dominate() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        app.consecutive_criticals.store(1, Ordering::SeqCst);
        assert_eq!(app.runtime_status(), RuntimeStatus::Critical);
    }

    #[test]
    fn snapshot_serialises() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let snapshot = app.build_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"status\":\"OK\""));
        assert!(json.contains("\"mode\":\"TRADING\""));
    }
}
