// =============================================================================
// Agent Loop — single cooperative scheduler driving every subsystem
// =============================================================================
//
// Fixed phase order each cycle:
//
//    1. Housekeeping — reconcile (if due), refresh symbol rules (if due),
//                      resolve fills, cancel stale pendings
//    2. Awareness    — balances, capital awareness, position mark prices
//    3. Learning     — fold closed trades into the learning memory
//    4. Detection    — regime classification
//    5. Scan         — candles + signals for candidate symbols (bounded
//                      fan-out, join-barrier)
//    6. Score        — composite scores, top-K selection
//    7. Decide       — admission control (circuit breaker, capital, slots)
//    8. Execute      — place entries, one order per symbol per cycle
//    9. Monitor      — evaluate exits, fire closes in deterministic order
//   10. Persist      — atomic state + learning writes
//   11. Sleep        — enforce the regime-dependent cycle interval
//
// Phases never observe another phase's mutation mid-flight; exchange IO is
// confined to Housekeeping/Awareness/Scan/Execute/Monitor and every IO-bound
// phase runs under a hard budget. A phase that blows its budget is cancelled
// and the cycle falls through to PersistPhase so durable state stays
// consistent. Shutdown is honored at phase boundaries and always completes
// PersistPhase.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::exchange::Ticker;
use crate::market_data::{Candle, CandleKey, Timeframe};
use crate::monitor;
use crate::reconcile::{self, ReportLevel};
use crate::regime::Regime;
use crate::risk::{self, TradePlan};
use crate::scoring::{self, ScoredOpportunity};
use crate::signals::{MarketView, SignalSet, SignalSource};
use crate::state::ledger::TradeRecord;
use crate::types::{AgentMode, OrderSide};

/// Candles fetched per (symbol, timeframe) each scan.
const CANDLE_FETCH: u32 = 120;

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Graceful shutdown (signal); exit code 0 / 130 decided by main.
    Shutdown,
    /// Two consecutive CRITICAL reconciliation reports; exit code 2.
    FatalReconciliation,
}

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Completed,
    /// A phase blew its budget; the rest of the cycle was skipped.
    Truncated,
    ShutdownRequested,
    Fatal(AgentExit),
}

/// One scanned symbol, ready for scoring.
struct SymbolScan {
    symbol: String,
    set: SignalSet,
    price: f64,
    volume_24h: f64,
    atr_pct: Option<f64>,
}

pub struct Agent {
    app: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
    last_reconcile_at: Option<Instant>,
    last_rule_refresh_at: Option<Instant>,
}

impl Agent {
    pub fn new(app: Arc<AppState>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            app,
            shutdown,
            last_reconcile_at: None,
            last_rule_refresh_at: None,
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn phase_budget(&self) -> Duration {
        Duration::from_secs(self.app.config.read().phase_budget_secs)
    }

    /// Run a phase under the hard budget. `None` means the budget was blown
    /// and partial results discarded.
    async fn with_budget<T>(
        &self,
        phase: &'static str,
        fut: impl std::future::Future<Output = T>,
    ) -> Option<T> {
        match tokio::time::timeout(self.phase_budget(), fut).await {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(phase, "phase budget exceeded, cancelling and truncating cycle");
                None
            }
        }
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    pub async fn run(mut self) -> AgentExit {
        info!("agent loop starting");

        loop {
            let cycle_started = Instant::now();
            let end = self.run_cycle().await;

            // PersistPhase always runs, even on truncation or shutdown.
            self.persist_phase();

            match end {
                CycleEnd::Fatal(exit) => {
                    error!(?exit, "agent loop terminating");
                    return exit;
                }
                CycleEnd::ShutdownRequested => {
                    info!("graceful shutdown: durable state persisted");
                    return AgentExit::Shutdown;
                }
                CycleEnd::Completed | CycleEnd::Truncated => {}
            }

            // Sleep (phase 11) honors shutdown promptly.
            let interval = self.cycle_interval();
            let elapsed = cycle_started.elapsed();
            let mut remaining = interval.saturating_sub(elapsed);
            while !remaining.is_zero() {
                if self.shutting_down() {
                    self.persist_phase();
                    info!("graceful shutdown during sleep: durable state persisted");
                    return AgentExit::Shutdown;
                }
                let nap = remaining.min(Duration::from_millis(250));
                tokio::time::sleep(nap).await;
                remaining = remaining.saturating_sub(nap);
            }
        }
    }

    /// Cycle interval by regime: floor in STRONG_BULL, ceiling in
    /// FLAT/STRONG_BEAR, nominal otherwise.
    fn cycle_interval(&self) -> Duration {
        let cfg = self.app.config.read();
        let secs = match self.app.regime.read().current() {
            Regime::StrongBull => cfg.min_cycle_interval_secs,
            Regime::Flat | Regime::StrongBear => cfg.max_cycle_interval_secs,
            _ => cfg.scan_interval_secs,
        };
        Duration::from_secs(secs)
    }

    async fn run_cycle(&mut self) -> CycleEnd {
        let cycle = self.app.cycle_count.load(Ordering::SeqCst);
        debug!(cycle, "cycle starting");

        macro_rules! boundary {
            () => {
                if self.shutting_down() {
                    return CycleEnd::ShutdownRequested;
                }
            };
        }

        boundary!();
        // Housekeeping needs &mut self (reconcile/refresh timers), so the
        // budget wrapper is inlined here.
        let budget = self.phase_budget();
        match tokio::time::timeout(budget, self.housekeeping_phase()).await {
            Ok(Some(exit)) => return CycleEnd::Fatal(exit),
            Ok(None) => {}
            Err(_) => {
                warn!(phase = "housekeeping", "phase budget exceeded, cancelling and truncating cycle");
                return CycleEnd::Truncated;
            }
        }

        boundary!();
        let tickers = match self.with_budget("awareness", self.awareness_phase()).await {
            Some(t) => t,
            None => return CycleEnd::Truncated,
        };

        boundary!();
        self.learning_phase();

        boundary!();
        self.detection_phase(&tickers);

        boundary!();
        let scans = match self.with_budget("scan", self.scan_phase(&tickers)).await {
            Some(s) => s,
            None => return CycleEnd::Truncated,
        };

        boundary!();
        let ranked = self.score_phase(scans);

        boundary!();
        let plans = self.decide_phase(ranked);

        boundary!();
        if self.with_budget("execute", self.execute_phase(plans)).await.is_none() {
            return CycleEnd::Truncated;
        }

        boundary!();
        if self.with_budget("monitor", self.monitor_phase()).await.is_none() {
            return CycleEnd::Truncated;
        }

        debug!(cycle, "cycle complete");
        CycleEnd::Completed
    }

    // =========================================================================
    // 1. Housekeeping
    // =========================================================================

    async fn housekeeping_phase(&mut self) -> Option<AgentExit> {
        self.app.state.roll_daily();

        // Reconcile at startup, on schedule, and on demand.
        let reconcile_due = {
            let interval = self.app.config.read().reconcile_interval_secs;
            self.last_reconcile_at
                .map(|t| t.elapsed() >= Duration::from_secs(interval))
                .unwrap_or(true)
                || self.app.state.take_reconcile_request()
        };
        if reconcile_due {
            let quote_asset = self.app.config.read().quote_asset.clone();
            let report = reconcile::reconcile_once(
                &self.app.client,
                &self.app.state,
                &self.app.ledger,
                &self.app.universe,
                &quote_asset,
            )
            .await;
            self.last_reconcile_at = Some(Instant::now());

            let criticals = if report.level == ReportLevel::Critical {
                self.app.consecutive_criticals.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                self.app.consecutive_criticals.store(0, Ordering::SeqCst);
                0
            };
            *self.app.last_reconcile.write() = Some(report);

            if criticals >= 2 {
                error!("two consecutive CRITICAL reconciliation reports");
                return Some(AgentExit::FatalReconciliation);
            }
        }

        // Rule refresh on schedule or after detected drift.
        let refresh_due = {
            let interval = self.app.config.read().rule_refresh_interval_secs;
            self.last_rule_refresh_at
                .map(|t| t.elapsed() >= Duration::from_secs(interval))
                .unwrap_or(true)
                || self.app.universe.take_refresh_request()
        };
        if refresh_due {
            let cfg = self.app.config.read().clone();
            if self
                .app
                .universe
                .refresh(self.app.client.as_ref(), &cfg)
                .await
                .is_ok()
            {
                self.last_rule_refresh_at = Some(Instant::now());
            }
        }

        if let Err(e) = self.app.execution.resolve_pending().await {
            warn!(error = %e, "pending resolution failed this cycle");
        }
        let ttl = self.app.config.read().pending_ttl_secs;
        self.app.execution.cancel_stale_pending(ttl).await;

        None
    }

    // =========================================================================
    // 2. Awareness
    // =========================================================================

    /// Refresh balances, mark prices, and capital awareness. Returns the
    /// batched ticker map consumed by Detection and Scan.
    async fn awareness_phase(&self) -> HashMap<String, Ticker> {
        let tickers: HashMap<String, Ticker> = match self.app.client.get_tickers().await {
            Ok(list) => list.into_iter().map(|t| (t.symbol.clone(), t)).collect(),
            Err(e) => {
                warn!(error = %e, "ticker fetch failed, proceeding with stale prices");
                HashMap::new()
            }
        };

        let prices: HashMap<String, f64> =
            tickers.iter().map(|(s, t)| (s.clone(), t.price)).collect();
        self.app.state.update_prices(&prices);

        match self.app.client.get_balances().await {
            Ok(balances) => {
                let quote_asset = self.app.config.read().quote_asset.clone();
                let quote = balances.get(&quote_asset).copied().unwrap_or_default();
                let snapshot = self.app.state.snapshot();
                let holdings_value: f64 = snapshot
                    .positions
                    .iter()
                    .map(|p| p.quantity * p.current_price)
                    .sum();
                self.app.state.set_capital(crate::state::CapitalAwareness::compute(
                    quote.free,
                    quote.locked,
                    holdings_value,
                ));
            }
            Err(e) => warn!(error = %e, "balance fetch failed, capital awareness stale"),
        }

        tickers
    }

    // =========================================================================
    // 3. Learning
    // =========================================================================

    /// Fold every realized sell into the learning memory. The fold is
    /// idempotent per trade id, so replaying the whole ledger is safe and
    /// covers closes from before a crash.
    fn learning_phase(&self) {
        let records = match self.app.ledger.load_all() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "ledger load failed, learning fold skipped");
                return;
            }
        };

        let mut learning = self.app.learning.write();
        for record in records {
            if record.side != OrderSide::Sell {
                continue;
            }
            let (Some(reason), Some(pnl)) = (record.reason, record.realized_pnl) else {
                continue;
            };
            learning.fold(&record.id, record.regime, reason, &record.symbol, pnl);
        }
    }

    /// Immediate fold for closes executed this cycle (same dedupe keys as
    /// the ledger replay above).
    fn fold_closes(&self, records: &[TradeRecord]) {
        let mut learning = self.app.learning.write();
        for record in records {
            let (Some(reason), Some(pnl)) = (record.reason, record.realized_pnl) else {
                continue;
            };
            learning.fold(&record.id, record.regime, reason, &record.symbol, pnl);
        }
    }

    // =========================================================================
    // 4. Detection
    // =========================================================================

    fn detection_phase(&self, tickers: &HashMap<String, Ticker>) {
        let sample_size = self.app.config.read().regime_sample_size;
        let universe = self.app.universe.all();

        // Top-N eligible symbols by 24 h volume.
        let mut sample: Vec<&Ticker> = universe
            .iter()
            .filter_map(|s| tickers.get(s))
            .collect();
        sample.sort_by(|a, b| {
            b.volume_24h
                .partial_cmp(&a.volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sample.truncate(sample_size);

        let returns: Vec<f64> = sample.iter().map(|t| t.change_24h_pct).collect();
        let reading = self.app.regime.write().observe(&returns);
        self.app.state.set_last_regime(reading.regime);
    }

    // =========================================================================
    // 5. Scan
    // =========================================================================

    async fn scan_phase(&self, tickers: &HashMap<String, Ticker>) -> Vec<SymbolScan> {
        let (workers, sample_size) = {
            let cfg = self.app.config.read();
            (cfg.scan_workers, cfg.regime_sample_size.max(cfg.top_k))
        };

        // Candidate set: eligible symbols with a live ticker, by volume.
        let mut candidates: Vec<String> = self
            .app
            .universe
            .all()
            .into_iter()
            .filter(|s| tickers.contains_key(s))
            .collect();
        candidates.sort_by(|a, b| {
            let va = tickers.get(a).map(|t| t.volume_24h).unwrap_or(0.0);
            let vb = tickers.get(b).map(|t| t.volume_24h).unwrap_or(0.0);
            vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(sample_size);

        // Bounded fan-out over exchange IO; join-barrier before signals run.
        let client = self.app.client.clone();
        let fetched: Vec<(String, Vec<(Timeframe, Vec<Candle>)>)> = stream::iter(
            candidates.into_iter().map(|symbol| {
                let client = client.clone();
                async move {
                    let mut frames = Vec::with_capacity(Timeframe::ALL.len());
                    for tf in Timeframe::ALL {
                        match client.get_candles(&symbol, tf, CANDLE_FETCH).await {
                            Ok(candles) => frames.push((tf, candles)),
                            Err(e) => {
                                debug!(symbol = %symbol, timeframe = %tf, error = %e,
                                    "candle fetch failed");
                            }
                        }
                    }
                    (symbol, frames)
                }
            }),
        )
        .buffer_unordered(workers)
        .collect()
        .await;

        let reference_prices = self.app.reference_prices.read().clone();
        let mut scans = Vec::with_capacity(fetched.len());

        for (symbol, frames) in fetched {
            let Some(ticker) = tickers.get(&symbol) else {
                continue;
            };

            for (tf, candles) in &frames {
                self.app
                    .candles
                    .put(CandleKey::new(symbol.clone(), *tf), candles.clone());
            }

            let frame = |tf: Timeframe| -> Vec<Candle> {
                self.app.candles.get(&CandleKey::new(symbol.clone(), tf))
            };
            let candles_1m = frame(Timeframe::M1);
            let candles_5m = frame(Timeframe::M5);
            let candles_15m = frame(Timeframe::M15);
            let candles_1h = frame(Timeframe::H1);

            let view = MarketView {
                symbol: &symbol,
                candles_1m: &candles_1m,
                candles_5m: &candles_5m,
                candles_15m: &candles_15m,
                candles_1h: &candles_1h,
                ticker,
                reference_price: reference_prices.get(&symbol).copied(),
            };

            let pipeline = &self.app.signals;
            let set = SignalSet {
                technical: pipeline.technical.score(&view),
                volume: pipeline.volume.score(&view),
                sentiment: pipeline.sentiment.score(&view),
                onchain: pipeline.onchain.score(&view),
                cross_exchange: pipeline.cross_exchange.score(&view),
                multi_timeframe: pipeline.multi_timeframe.score(&view),
            };

            let atr_pct = crate::indicators::atr::atr_pct(&candles_5m, 14);

            scans.push(SymbolScan {
                symbol,
                set,
                price: ticker.price,
                volume_24h: ticker.volume_24h,
                atr_pct,
            });
        }

        debug!(count = scans.len(), "scan phase complete");
        scans
    }

    // =========================================================================
    // 6. Score
    // =========================================================================

    fn score_phase(&self, scans: Vec<SymbolScan>) -> Vec<ScoredOpportunity> {
        let (ttl, top_k) = {
            let cfg = self.app.config.read();
            (cfg.signal_ttl_secs, cfg.top_k)
        };
        let regime = self.app.regime.read().current();
        let now = Utc::now();

        let learning = self.app.learning.read();
        let scored: Vec<ScoredOpportunity> = scans
            .iter()
            .map(|scan| {
                scoring::score_symbol(
                    &scan.symbol,
                    &scan.set,
                    regime,
                    &learning,
                    scan.price,
                    scan.volume_24h,
                    scan.atr_pct,
                    ttl,
                    now,
                )
            })
            .collect();
        drop(learning);

        // Quality map feeds the recycle rule for every scanned symbol.
        *self.app.last_quality.write() = scored
            .iter()
            .map(|o| (o.symbol.clone(), o.composite))
            .collect();

        let ranked = scoring::rank(scored, top_k);
        *self.app.last_opportunities.write() = ranked.clone();
        ranked
    }

    // =========================================================================
    // 7. Decide
    // =========================================================================

    fn decide_phase(&self, ranked: Vec<ScoredOpportunity>) -> Vec<TradePlan> {
        let cfg = self.app.config.read().clone();
        let daily = self.app.state.daily();
        let reconcile_critical = self
            .app
            .last_reconcile
            .read()
            .as_ref()
            .map(|r| r.level == ReportLevel::Critical)
            .unwrap_or(false);

        if let Some(trip) = risk::circuit_breaker(&daily, &cfg, reconcile_critical) {
            let reason = trip.to_string();
            if self.app.state.mode() != AgentMode::Observing {
                warn!(reason = %reason, "circuit breaker tripped, entering close-only mode");
            }
            self.app.state.set_mode(AgentMode::Observing);
            *self.app.breaker_reason.write() = Some(reason);
            return Vec::new();
        }
        self.app.state.set_mode(AgentMode::Trading);
        *self.app.breaker_reason.write() = None;

        let snapshot = self.app.state.snapshot();
        let open_slots = (cfg.max_total_positions as usize)
            .saturating_sub(snapshot.positions.len() + snapshot.pending_buys.len());
        if open_slots == 0 {
            debug!("no open slots, skipping admission");
            return Vec::new();
        }

        let learning = self.app.learning.read();
        let mut capital = snapshot.capital.quote_available;
        let mut plans: Vec<TradePlan> = Vec::new();

        for opp in ranked {
            if plans.len() >= open_slots {
                break;
            }
            // One new order per symbol per cycle.
            if plans.iter().any(|p| p.symbol == opp.symbol) {
                continue;
            }
            if self.app.state.has_position(&opp.symbol) || self.app.state.has_pending(&opp.symbol)
            {
                continue;
            }
            if self.app.state.is_quarantined(&opp.symbol) {
                debug!(symbol = %opp.symbol, "skipped: symbol quarantined today");
                continue;
            }
            if learning.avoid(&opp.symbol) {
                debug!(symbol = %opp.symbol, "skipped: learning memory says avoid");
                continue;
            }
            let Ok(rules) = self.app.universe.rules(&opp.symbol) else {
                continue;
            };

            match risk::build_plan(&opp, &rules, capital, &cfg) {
                Ok(plan) => {
                    capital -= plan.notional;
                    plans.push(plan);
                }
                Err(reject) => {
                    debug!(symbol = %opp.symbol, %reject, "opportunity rejected by sizing");
                }
            }
        }

        plans
    }

    // =========================================================================
    // 8. Execute
    // =========================================================================

    async fn execute_phase(&self, plans: Vec<TradePlan>) {
        for plan in plans {
            match self.app.execution.open(&plan).await {
                Ok(pending) => {
                    info!(
                        symbol = %plan.symbol,
                        order_id = ?pending.order_id,
                        notional = plan.notional,
                        tier = %plan.tier,
                        "entry submitted"
                    );
                }
                Err(e) => warn!(symbol = %plan.symbol, error = %e, "entry failed"),
            }
        }
    }

    // =========================================================================
    // 9. Monitor
    // =========================================================================

    async fn monitor_phase(&self) {
        let snapshot = self.app.state.snapshot();
        if snapshot.positions.is_empty() {
            return;
        }

        let quality = self.app.last_quality.read().clone();
        let cfg = self.app.config.read().clone();
        let plan = monitor::evaluate(&snapshot.positions, &quality, &cfg, Utc::now());

        let outcome = monitor::apply(plan, &self.app.execution, &self.app.state).await;
        if !outcome.closed.is_empty() {
            self.fold_closes(&outcome.closed);
        }
    }

    // =========================================================================
    // 10. Persist
    // =========================================================================

    fn persist_phase(&self) {
        if let Err(e) = self.app.state.persist() {
            error!(error = %e, "state persist failed");
        }
        {
            let mut learning = self.app.learning.write();
            learning.record_cycle();
            if let Err(e) = learning.persist() {
                error!(error = %e, "learning persist failed");
            }
        }
        self.app.cycle_count.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Integration-style tests over the paper exchange
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::{ExchangeClient, SymbolRule};
    use crate::runtime_config::RuntimeConfig;
    use crate::scoring::{ComponentScores, Tier};
    use crate::types::TradeReason;

    struct Harness {
        app: Arc<AppState>,
        agent: Agent,
        client: Arc<PaperExchange>,
        _dir: tempfile::TempDir,
    }

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 9.0 + i as f64 * 0.01;
                Candle::new(
                    i as i64 * 60_000,
                    base,
                    base + 0.05,
                    base - 0.05,
                    base,
                    1000.0,
                    (i as i64 + 1) * 60_000,
                )
            })
            .collect()
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = RuntimeConfig::default();
        cfg.state_path = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.ledger_path = dir.path().join("trades.jsonl").to_string_lossy().into_owned();
        cfg.learning_path = dir.path().join("learning.json").to_string_lossy().into_owned();
        cfg.rules_cache_path = dir.path().join("rules.json").to_string_lossy().into_owned();

        let client = Arc::new(PaperExchange::new("USDT", 1000.0, 0.001));
        client.seed_rule(SymbolRule {
            symbol: "XUSDT".into(),
            base_asset: "X".into(),
            quote_asset: "USDT".into(),
            tick_size: 0.001,
            lot_size: 0.1,
            min_notional: 11.0,
            active: true,
        });
        client.set_price("XUSDT", 10.0);
        for tf in Timeframe::ALL {
            client.seed_candles("XUSDT", tf, rising_candles(120));
        }

        let dyn_client: Arc<dyn ExchangeClient> = client.clone();
        let app = Arc::new(AppState::new(cfg, dyn_client));
        let agent = Agent::new(app.clone(), Arc::new(AtomicBool::new(false)));

        Harness {
            app,
            agent,
            client,
            _dir: dir,
        }
    }

    fn opportunity(symbol: &str, composite: f64) -> ScoredOpportunity {
        ScoredOpportunity {
            symbol: symbol.to_string(),
            composite,
            components: ComponentScores {
                technical: composite,
                intelligence: composite,
                multi_timeframe: composite,
                volume: composite,
                sentiment: composite,
            },
            tier: Tier::from_composite(composite),
            regime: Regime::Normal,
            price: 10.0,
            volume_24h: 1_000_000.0,
            atr_pct: None,
            rationale: String::new(),
        }
    }

    #[tokio::test]
    async fn full_cycle_completes_and_persists() {
        let mut h = harness();
        let end = h.agent.run_cycle().await;
        assert_eq!(end, CycleEnd::Completed);

        h.agent.persist_phase();
        assert_eq!(h.app.cycle_count.load(Ordering::SeqCst), 1);
        assert!(h.app.state.snapshot().version >= 1);
        // Reconcile ran at startup.
        assert!(h.app.last_reconcile.read().is_some());
        // Universe got refreshed.
        assert_eq!(h.app.universe.len(), 1);
    }

    #[tokio::test]
    async fn decide_and_execute_open_one_position_per_symbol() {
        let mut h = harness();
        h.agent.run_cycle().await; // bootstrap universe, capital, regime

        let plans = h.agent.decide_phase(vec![
            opportunity("XUSDT", 75.0),
            opportunity("XUSDT", 75.0), // duplicate proposal in the same cycle
        ]);
        assert_eq!(plans.len(), 1, "duplicate proposals collapse to one plan");

        h.agent.execute_phase(plans).await;
        let snapshot = h.app.state.snapshot();
        assert_eq!(snapshot.pending_buys.len(), 1);

        // Fill promotion happens in the next housekeeping pass.
        h.app.execution.resolve_pending().await.unwrap();
        assert!(h.app.state.has_position("XUSDT"));
    }

    #[tokio::test]
    async fn happy_path_take_profit_updates_learning_and_daily() {
        let mut h = harness();
        h.agent.run_cycle().await;

        // Open and fill a STANDARD-tier entry at $10.
        let plans = h.agent.decide_phase(vec![opportunity("XUSDT", 75.0)]);
        h.agent.execute_phase(plans).await;
        h.app.execution.resolve_pending().await.unwrap();

        // Price reaches the take-profit.
        h.client.set_price("XUSDT", 10.16);
        let prices: HashMap<String, f64> = [("XUSDT".to_string(), 10.16)].into();
        h.app.state.update_prices(&prices);

        h.agent.monitor_phase().await;

        assert!(!h.app.state.has_position("XUSDT"));
        let daily = h.app.state.daily();
        assert_eq!(daily.wins, 1);
        assert!(daily.realized_pnl > 0.0);

        // Learning bucket (NORMAL, take_profit) incremented.
        let learning = h.app.learning.read();
        assert!(
            (learning.win_rate(Regime::Normal, TradeReason::TakeProfit).unwrap() - 1.0).abs()
                < 1e-12
        );
    }

    #[tokio::test]
    async fn stop_loss_gap_counts_a_loss() {
        let mut h = harness();
        h.agent.run_cycle().await;

        let plans = h.agent.decide_phase(vec![opportunity("XUSDT", 75.0)]);
        h.agent.execute_phase(plans).await;
        h.app.execution.resolve_pending().await.unwrap();

        // Gap through the stop between cycles.
        h.client.set_price("XUSDT", 9.18);
        let prices: HashMap<String, f64> = [("XUSDT".to_string(), 9.18)].into();
        h.app.state.update_prices(&prices);

        h.agent.monitor_phase().await;

        assert!(!h.app.state.has_position("XUSDT"));
        let daily = h.app.state.daily();
        assert_eq!(daily.losses, 1);
        assert!(daily.realized_pnl < 0.0);

        let learning = h.app.learning.read();
        assert!(learning.win_rate(Regime::Normal, TradeReason::StopLoss).is_some());
    }

    #[tokio::test]
    async fn circuit_breaker_puts_agent_in_observing_mode() {
        let mut h = harness();
        h.agent.run_cycle().await;

        // Five losses totalling -$6 against the default -$5 daily limit.
        for _ in 0..5 {
            h.app.state.record_close(-1.2, 0.01);
        }

        let plans = h.agent.decide_phase(vec![opportunity("XUSDT", 96.0)]);
        assert!(plans.is_empty());
        assert_eq!(h.app.state.mode(), AgentMode::Observing);
        assert!(h.app.breaker_reason.read().is_some());

        // Persisted snapshot carries the observing mode.
        h.agent.persist_phase();
        let reloaded = crate::state::StateStore::load_or_default(
            &h.app.config.read().state_path,
        );
        assert_eq!(reloaded.mode(), AgentMode::Observing);
    }

    #[tokio::test]
    async fn rule_drift_triggers_refresh_and_next_cycle_succeeds() {
        let mut h = harness();
        h.agent.run_cycle().await;

        // Force a PriceIncrementInvalid on open.
        h.client
            .inject_fault(crate::exchange::ExchangeError::PriceIncrementInvalid);
        let plans = h.agent.decide_phase(vec![opportunity("XUSDT", 75.0)]);
        h.agent.execute_phase(plans).await;
        assert!(h.app.state.snapshot().pending_buys.is_empty());

        // Drift raised the refresh request; clear the fault and run a cycle.
        h.client.clear_fault();
        let end = h.agent.run_cycle().await;
        assert_eq!(end, CycleEnd::Completed);

        // Next attempt goes through.
        let plans = h.agent.decide_phase(vec![opportunity("XUSDT", 75.0)]);
        h.agent.execute_phase(plans).await;
        assert_eq!(h.app.state.snapshot().pending_buys.len(), 1);
    }

    #[tokio::test]
    async fn fatal_reconciliation_after_two_criticals() {
        let mut h = harness();
        h.agent.run_cycle().await;

        h.client.inject_fault(crate::exchange::ExchangeError::ExchangeUnavailable(
            "maintenance".into(),
        ));

        // First critical: cycle survives degraded.
        h.app.state.request_reconcile();
        let end = h.agent.run_cycle().await;
        assert_ne!(end, CycleEnd::Fatal(AgentExit::FatalReconciliation));
        assert_eq!(h.app.consecutive_criticals.load(Ordering::SeqCst), 1);

        // Second consecutive critical: fatal.
        h.app.state.request_reconcile();
        let end = h.agent.run_cycle().await;
        assert_eq!(end, CycleEnd::Fatal(AgentExit::FatalReconciliation));
    }

    #[tokio::test]
    async fn shutdown_is_honored_at_phase_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = RuntimeConfig::default();
        cfg.state_path = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.ledger_path = dir.path().join("trades.jsonl").to_string_lossy().into_owned();
        cfg.learning_path = dir.path().join("learning.json").to_string_lossy().into_owned();
        cfg.rules_cache_path = dir.path().join("rules.json").to_string_lossy().into_owned();

        let client: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new("USDT", 1000.0, 0.001));
        let app = Arc::new(AppState::new(cfg, client));
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut agent = Agent::new(app.clone(), shutdown);

        let end = agent.run_cycle().await;
        assert_eq!(end, CycleEnd::ShutdownRequested);
    }
}
