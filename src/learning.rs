// =============================================================================
// Learning Memory — realized-outcome statistics feeding adaptive thresholds
// =============================================================================
//
// Every close increments the bucket (regime at entry, strategy tag) and the
// per-symbol bucket. Folds are idempotent per trade id: the ledger's unique
// id is the dedupe key, so replaying the same close twice leaves the
// counters unchanged.
//
// Read-side queries:
//   - win_rate(regime, strategy)
//   - best_strategies(regime)
//   - avoid(symbol)            — win rate < 0.25 over >= 10 trades
//   - tier_adjustment(regime)  — +1 / 0 / -1 tier nudge for the scorer
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::regime::Regime;
use crate::state::durable::{durable_write_json, load_json};
use crate::types::TradeReason;

/// Retained dedupe ids; old ids age out once the window is full.
const SEEN_TRADE_CAP: usize = 10_000;

const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Monotonic counters for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl: f64,
    #[serde(default)]
    pub last_updated: String,
}

impl BucketStats {
    fn record(&mut self, pnl: f64) {
        self.trades += 1;
        if pnl >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.realized_pnl += pnl;
        self.last_updated = Utc::now().to_rfc3339();
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Durable file format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct BucketEntry {
    regime: Regime,
    strategy: TradeReason,
    stats: BucketStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct SymbolEntry {
    symbol: String,
    stats: BucketStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct LearningFile {
    schema_version: u32,
    by_bucket: Vec<BucketEntry>,
    by_symbol: Vec<SymbolEntry>,
    seen_trades: Vec<String>,
    total_cycles: u64,
    updated_at: String,
}

// ---------------------------------------------------------------------------
// LearningMemory
// ---------------------------------------------------------------------------

pub struct LearningMemory {
    by_bucket: HashMap<(Regime, TradeReason), BucketStats>,
    by_symbol: HashMap<String, BucketStats>,
    seen_trades: HashSet<String>,
    seen_order: VecDeque<String>,
    total_cycles: u64,
    path: PathBuf,
}

impl LearningMemory {
    /// Load from the durable file at `path`, or start blank.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let file: Option<LearningFile> = load_json(&path).unwrap_or(None);

        match file {
            Some(f) => {
                info!(
                    path = %path.display(),
                    buckets = f.by_bucket.len(),
                    symbols = f.by_symbol.len(),
                    cycles = f.total_cycles,
                    "learning memory loaded"
                );
                let seen_order: VecDeque<String> = f.seen_trades.iter().cloned().collect();
                Self {
                    by_bucket: f
                        .by_bucket
                        .into_iter()
                        .map(|e| ((e.regime, e.strategy), e.stats))
                        .collect(),
                    by_symbol: f
                        .by_symbol
                        .into_iter()
                        .map(|e| (e.symbol, e.stats))
                        .collect(),
                    seen_trades: seen_order.iter().cloned().collect(),
                    seen_order,
                    total_cycles: f.total_cycles,
                    path,
                }
            }
            None => Self {
                by_bucket: HashMap::new(),
                by_symbol: HashMap::new(),
                seen_trades: HashSet::new(),
                seen_order: VecDeque::new(),
                total_cycles: 0,
                path,
            },
        }
    }

    /// Persist atomically. Entries are sorted so the file is deterministic.
    pub fn persist(&self) -> Result<()> {
        let mut by_bucket: Vec<BucketEntry> = self
            .by_bucket
            .iter()
            .map(|((regime, strategy), stats)| BucketEntry {
                regime: *regime,
                strategy: *strategy,
                stats: stats.clone(),
            })
            .collect();
        by_bucket.sort_by_key(|e| (e.regime.to_string(), e.strategy.to_string()));

        let mut by_symbol: Vec<SymbolEntry> = self
            .by_symbol
            .iter()
            .map(|(symbol, stats)| SymbolEntry {
                symbol: symbol.clone(),
                stats: stats.clone(),
            })
            .collect();
        by_symbol.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let file = LearningFile {
            schema_version: SCHEMA_VERSION,
            by_bucket,
            by_symbol,
            seen_trades: self.seen_order.iter().cloned().collect(),
            total_cycles: self.total_cycles,
            updated_at: Utc::now().to_rfc3339(),
        };

        durable_write_json(&self.path, &file)
    }

    // -------------------------------------------------------------------------
    // Folding
    // -------------------------------------------------------------------------

    /// Fold one realized close into the memory. Returns `false` when the
    /// trade id was already folded (no counters change).
    pub fn fold(
        &mut self,
        trade_id: &str,
        regime: Regime,
        strategy: TradeReason,
        symbol: &str,
        pnl: f64,
    ) -> bool {
        if self.seen_trades.contains(trade_id) {
            debug!(trade_id, "learning fold skipped (duplicate)");
            return false;
        }

        self.seen_trades.insert(trade_id.to_string());
        self.seen_order.push_back(trade_id.to_string());
        while self.seen_order.len() > SEEN_TRADE_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_trades.remove(&old);
            }
        }

        self.by_bucket
            .entry((regime, strategy))
            .or_default()
            .record(pnl);
        self.by_symbol.entry(symbol.to_string()).or_default().record(pnl);

        debug!(trade_id, %regime, %strategy, symbol, pnl, "learning fold applied");
        true
    }

    pub fn record_cycle(&mut self) {
        self.total_cycles += 1;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn win_rate(&self, regime: Regime, strategy: TradeReason) -> Option<f64> {
        self.by_bucket
            .get(&(regime, strategy))
            .filter(|s| s.trades > 0)
            .map(BucketStats::win_rate)
    }

    /// Strategies for `regime`, best win rate first.
    pub fn best_strategies(&self, regime: Regime) -> Vec<(TradeReason, f64)> {
        let mut out: Vec<(TradeReason, f64)> = self
            .by_bucket
            .iter()
            .filter(|((r, _), stats)| *r == regime && stats.trades > 0)
            .map(|((_, strategy), stats)| (*strategy, stats.win_rate()))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// A symbol is avoided when it has lost repeatedly: win rate below 0.25
    /// over at least 10 trades.
    pub fn avoid(&self, symbol: &str) -> bool {
        self.by_symbol
            .get(symbol)
            .map(|s| s.trades >= 10 && s.win_rate() < 0.25)
            .unwrap_or(false)
    }

    /// Tier nudge for the scorer, aggregated across every strategy bucket in
    /// the regime: -1 when win rate < 0.30 over >= 5 trades, +1 when
    /// >= 0.70 over >= 10 trades.
    pub fn tier_adjustment(&self, regime: Regime) -> i8 {
        let mut trades = 0u64;
        let mut wins = 0u64;
        for ((r, _), stats) in &self.by_bucket {
            if *r == regime {
                trades += stats.trades;
                wins += stats.wins;
            }
        }
        if trades == 0 {
            return 0;
        }
        let rate = wins as f64 / trades as f64;
        if trades >= 10 && rate >= 0.70 {
            1
        } else if trades >= 5 && rate < 0.30 {
            -1
        } else {
            0
        }
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }
}

impl std::fmt::Debug for LearningMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningMemory")
            .field("buckets", &self.by_bucket.len())
            .field("symbols", &self.by_symbol.len())
            .field("total_cycles", &self.total_cycles)
            .finish()
    }
}
