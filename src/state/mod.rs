// =============================================================================
// State Store — the single authoritative in-memory state, durably mirrored
// =============================================================================
//
// Owns positions, pending buys, capital awareness, daily counters, the last
// adopted regime, and the agent mode. Single-writer discipline: only the
// agent loop mutates; every other consumer reads an immutable snapshot.
// Each persist() performs an atomic write-then-rename and bumps a monotonic
// version counter recorded inside the file, so the reconciler can detect
// torn or stale durable state.
// =============================================================================

pub mod durable;
pub mod ledger;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::regime::Regime;
use crate::scoring::Tier;
use crate::state::durable::{durable_write_json, load_json};
use crate::types::AgentMode;

const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One open spot position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    /// Entry fee paid, quote currency.
    pub entry_fee: f64,
    pub current_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Highest price seen since open; drives the trailing stop.
    pub high_water: f64,
    pub opened_at: DateTime<Utc>,
    /// Regime adopted when the position was entered.
    pub entry_regime: Regime,
    /// Tier the entry was sized at.
    pub tier: Tier,
    /// Composite score at entry; recycle-profit compares against it.
    pub entry_score: f64,
    pub entry_order_id: String,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.quantity
    }

    /// Unrealized gain as a percent of entry.
    pub fn gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.opened_at).num_seconds()
    }
}

/// An entry order awaiting its fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBuy {
    pub symbol: String,
    /// Exchange order id; `None` while the network call is in flight (the
    /// pending is recorded before the order is placed).
    pub order_id: Option<String>,
    /// Reserved quote notional.
    pub notional: f64,
    pub price: f64,
    pub quantity: f64,
    /// Planned exit levels, carried through to the position on fill.
    pub take_profit: f64,
    pub stop_loss: f64,
    pub tier: Tier,
    pub entry_regime: Regime,
    pub entry_score: f64,
    pub placed_at: DateTime<Utc>,
}

impl PendingBuy {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.placed_at).num_seconds()
    }
}

/// Realized trading counters, reset at the UTC day boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub date: String,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub realized_pnl: f64,
    pub fees_paid: f64,
}

impl DailyCounters {
    fn fresh(date: String) -> Self {
        Self {
            date,
            ..Default::default()
        }
    }

    fn record_close(&mut self, pnl: f64, fees: f64) {
        self.trades += 1;
        self.realized_pnl += pnl;
        self.fees_paid += fees;
        if pnl >= 0.0 {
            self.wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.losses += 1;
            self.consecutive_losses += 1;
        }
    }
}

/// Quote capital decomposition. Recomputed each cycle from authoritative
/// sources: exchange balance + open positions + pending reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapitalAwareness {
    pub quote_available: f64,
    pub quote_locked: f64,
    pub holdings_value: f64,
    pub total_assets: f64,
}

impl CapitalAwareness {
    pub fn compute(quote_available: f64, quote_locked: f64, holdings_value: f64) -> Self {
        Self {
            quote_available,
            quote_locked,
            holdings_value,
            total_assets: quote_available + quote_locked + holdings_value,
        }
    }
}

// ---------------------------------------------------------------------------
// Durable file format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    schema_version: u32,
    /// Monotonic persist counter; lets the reconciler spot stale files.
    version: u64,
    positions: Vec<Position>,
    pending_buys: Vec<PendingBuy>,
    capital_awareness: CapitalAwareness,
    daily_counters: DailyCounters,
    last_regime: Regime,
    agent_mode: AgentMode,
    updated_at: String,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable copy handed to readers for the duration of a phase.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub positions: Vec<Position>,
    pub pending_buys: Vec<PendingBuy>,
    pub capital: CapitalAwareness,
    pub daily: DailyCounters,
    pub last_regime: Regime,
    pub mode: AgentMode,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

struct Inner {
    positions: HashMap<String, Position>,
    pending: HashMap<String, PendingBuy>,
    capital: CapitalAwareness,
    daily: DailyCounters,
    last_regime: Regime,
    mode: AgentMode,
}

pub struct StateStore {
    inner: RwLock<Inner>,
    version: AtomicU64,
    /// Set by the execution engine when the exchange contradicts local state
    /// (e.g. insufficient balance on close); the agent loop runs an
    /// out-of-schedule reconciliation pass and clears it.
    reconcile_requested: AtomicBool,
    /// Symbols barred from new entries for the rest of the UTC day after a
    /// logic-invariant violation. Not persisted; cleared at the day roll.
    quarantined: RwLock<HashSet<String>>,
    path: PathBuf,
}

impl StateStore {
    /// Load durable state from `path`, or start blank.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let file: Option<StateFile> = load_json(&path).unwrap_or(None);
        let (inner, version) = match file {
            Some(f) => {
                info!(
                    path = %path.display(),
                    positions = f.positions.len(),
                    pending = f.pending_buys.len(),
                    version = f.version,
                    "state loaded from durable file"
                );
                let daily = if f.daily_counters.date == today {
                    f.daily_counters
                } else {
                    DailyCounters::fresh(today)
                };
                (
                    Inner {
                        positions: f
                            .positions
                            .into_iter()
                            .map(|p| (p.symbol.clone(), p))
                            .collect(),
                        pending: f
                            .pending_buys
                            .into_iter()
                            .map(|p| (p.symbol.clone(), p))
                            .collect(),
                        capital: f.capital_awareness,
                        daily,
                        last_regime: f.last_regime,
                        mode: f.agent_mode,
                    },
                    f.version,
                )
            }
            None => {
                warn!(path = %path.display(), "no durable state found, starting blank");
                (
                    Inner {
                        positions: HashMap::new(),
                        pending: HashMap::new(),
                        capital: CapitalAwareness::default(),
                        daily: DailyCounters::fresh(today),
                        last_regime: Regime::Unknown,
                        mode: AgentMode::Trading,
                    },
                    0,
                )
            }
        };

        Self {
            inner: RwLock::new(inner),
            version: AtomicU64::new(version),
            reconcile_requested: AtomicBool::new(false),
            quarantined: RwLock::new(HashSet::new()),
            path,
        }
    }

    /// Persist the current state atomically and bump the version counter.
    pub fn persist(&self) -> Result<()> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.read();

        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut pending_buys: Vec<PendingBuy> = inner.pending.values().cloned().collect();
        pending_buys.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let file = StateFile {
            schema_version: SCHEMA_VERSION,
            version,
            positions,
            pending_buys,
            capital_awareness: inner.capital,
            daily_counters: inner.daily.clone(),
            last_regime: inner.last_regime,
            agent_mode: inner.mode,
            updated_at: Utc::now().to_rfc3339(),
        };
        drop(inner);

        durable_write_json(&self.path, &file)
    }

    // -------------------------------------------------------------------------
    // Snapshot readers
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read();
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut pending_buys: Vec<PendingBuy> = inner.pending.values().cloned().collect();
        pending_buys.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        StateSnapshot {
            positions,
            pending_buys,
            capital: inner.capital,
            daily: inner.daily.clone(),
            last_regime: inner.last_regime,
            mode: inner.mode,
            version: self.version.load(Ordering::SeqCst),
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.inner.read().positions.contains_key(symbol)
    }

    pub fn has_pending(&self, symbol: &str) -> bool {
        self.inner.read().pending.contains_key(symbol)
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.read().positions.len()
    }

    pub fn capital(&self) -> CapitalAwareness {
        self.inner.read().capital
    }

    pub fn daily(&self) -> DailyCounters {
        self.inner.read().daily.clone()
    }

    pub fn mode(&self) -> AgentMode {
        self.inner.read().mode
    }

    pub fn last_regime(&self) -> Regime {
        self.inner.read().last_regime
    }

    // -------------------------------------------------------------------------
    // Mutators (agent-loop writer only)
    // -------------------------------------------------------------------------

    /// Record a pending buy. Fails when the symbol already has a position or
    /// a pending buy; that invariant backs duplicate-order prevention.
    pub fn add_pending(&self, pending: PendingBuy) -> bool {
        let mut inner = self.inner.write();
        if inner.positions.contains_key(&pending.symbol)
            || inner.pending.contains_key(&pending.symbol)
        {
            return false;
        }
        inner.pending.insert(pending.symbol.clone(), pending);
        true
    }

    pub fn set_pending_order_id(&self, symbol: &str, order_id: &str) {
        if let Some(p) = self.inner.write().pending.get_mut(symbol) {
            p.order_id = Some(order_id.to_string());
        }
    }

    pub fn remove_pending(&self, symbol: &str) -> Option<PendingBuy> {
        self.inner.write().pending.remove(symbol)
    }

    /// Promote a filled pending buy into a position.
    pub fn promote_pending(&self, symbol: &str, position: Position) -> Option<PendingBuy> {
        let mut inner = self.inner.write();
        let pending = inner.pending.remove(symbol)?;
        inner.positions.insert(symbol.to_string(), position);
        Some(pending)
    }

    /// Insert a position directly (reconciler adoption path).
    pub fn upsert_position(&self, position: Position) {
        self.inner
            .write()
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub fn remove_position(&self, symbol: &str) -> Option<Position> {
        self.inner.write().positions.remove(symbol)
    }

    /// Update mark prices and high-water marks from a price map.
    pub fn update_prices(&self, prices: &HashMap<String, f64>) {
        let mut inner = self.inner.write();
        for (symbol, price) in prices {
            if let Some(pos) = inner.positions.get_mut(symbol) {
                if *price > 0.0 {
                    pos.current_price = *price;
                    if *price > pos.high_water {
                        pos.high_water = *price;
                    }
                }
            }
        }
    }

    /// Raise a position's stop. The stop only ever ratchets upward.
    pub fn raise_stop(&self, symbol: &str, new_stop: f64) -> bool {
        let mut inner = self.inner.write();
        match inner.positions.get_mut(symbol) {
            Some(pos) if new_stop > pos.stop_loss => {
                pos.stop_loss = new_stop;
                true
            }
            _ => false,
        }
    }

    /// Fold a realized close into the daily counters.
    pub fn record_close(&self, pnl: f64, fees: f64) {
        let mut inner = self.inner.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if inner.daily.date != today {
            inner.daily = DailyCounters::fresh(today);
        }
        inner.daily.record_close(pnl, fees);
    }

    /// Roll the daily counters (and lift quarantines) if the UTC date
    /// changed.
    pub fn roll_daily(&self) {
        let mut inner = self.inner.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if inner.daily.date != today {
            info!(old = %inner.daily.date, new = %today, "daily counters reset");
            inner.daily = DailyCounters::fresh(today);
            self.quarantined.write().clear();
        }
    }

    /// Bar a symbol from new entries for the rest of the day.
    pub fn quarantine(&self, symbol: &str) {
        if self.quarantined.write().insert(symbol.to_string()) {
            warn!(symbol, "symbol quarantined for the rest of the day");
        }
    }

    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.quarantined.read().contains(symbol)
    }

    pub fn set_capital(&self, capital: CapitalAwareness) {
        self.inner.write().capital = capital;
    }

    pub fn set_mode(&self, mode: AgentMode) {
        let mut inner = self.inner.write();
        if inner.mode != mode {
            info!(from = %inner.mode, to = %mode, "agent mode changed");
            inner.mode = mode;
        }
    }

    pub fn set_last_regime(&self, regime: Regime) {
        self.inner.write().last_regime = regime;
    }

    // -------------------------------------------------------------------------
    // Reconcile request flag
    // -------------------------------------------------------------------------

    pub fn request_reconcile(&self) {
        self.reconcile_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_reconcile_request(&self) -> bool {
        self.reconcile_requested.swap(false, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateStore")
            .field("positions", &inner.positions.len())
            .field("pending", &inner.pending.len())
            .field("mode", &inner.mode)
            .field("version", &self.version.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::load_or_default(dir.path().join("state.json"))
    }

    fn position(symbol: &str, entry: f64, qty: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            entry_price: entry,
            entry_fee: 0.03,
            current_price: entry,
            take_profit: entry * 1.015,
            stop_loss: entry * 0.95,
            high_water: entry,
            opened_at: Utc::now(),
            entry_regime: Regime::Normal,
            tier: Tier::Standard,
            entry_score: 75.0,
            entry_order_id: "1".into(),
        }
    }

    fn pending(symbol: &str) -> PendingBuy {
        PendingBuy {
            symbol: symbol.to_string(),
            order_id: Some("1".into()),
            notional: 30.0,
            price: 10.0,
            quantity: 3.0,
            take_profit: 10.15,
            stop_loss: 9.5,
            tier: Tier::Standard,
            entry_regime: Regime::Normal,
            entry_score: 75.0,
            placed_at: Utc::now(),
        }
    }

    #[test]
    fn pending_and_position_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.add_pending(pending("BTCUSDT")));
        // Second pending for the same symbol is rejected.
        assert!(!store.add_pending(pending("BTCUSDT")));

        store.promote_pending("BTCUSDT", position("BTCUSDT", 10.0, 3.0));
        assert!(store.has_position("BTCUSDT"));
        assert!(!store.has_pending("BTCUSDT"));

        // Pending for a symbol with an open position is rejected.
        assert!(!store.add_pending(pending("BTCUSDT")));
    }

    #[test]
    fn raise_stop_only_ratchets_upward() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.upsert_position(position("ETHUSDT", 100.0, 1.0));

        assert!(store.raise_stop("ETHUSDT", 97.0));
        assert!(!store.raise_stop("ETHUSDT", 96.0));
        assert!((store.position("ETHUSDT").unwrap().stop_loss - 97.0).abs() < 1e-12);
    }

    #[test]
    fn update_prices_tracks_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.upsert_position(position("ETHUSDT", 100.0, 1.0));

        let mut prices = HashMap::new();
        prices.insert("ETHUSDT".to_string(), 105.0);
        store.update_prices(&prices);
        prices.insert("ETHUSDT".to_string(), 102.0);
        store.update_prices(&prices);

        let pos = store.position("ETHUSDT").unwrap();
        assert!((pos.current_price - 102.0).abs() < 1e-12);
        assert!((pos.high_water - 105.0).abs() < 1e-12);
    }

    #[test]
    fn daily_counters_track_streaks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.record_close(-1.0, 0.05);
        store.record_close(-2.0, 0.05);
        assert_eq!(store.daily().consecutive_losses, 2);
        assert_eq!(store.daily().losses, 2);

        store.record_close(3.0, 0.05);
        let daily = store.daily();
        assert_eq!(daily.consecutive_losses, 0);
        assert_eq!(daily.wins, 1);
        assert!((daily.realized_pnl - 0.0).abs() < 1e-12);
        assert!((daily.fees_paid - 0.15).abs() < 1e-12);
    }

    #[test]
    fn persist_then_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load_or_default(&path);
        store.upsert_position(position("BTCUSDT", 10.0, 3.0));
        store.add_pending(pending("ETHUSDT"));
        store.set_capital(CapitalAwareness::compute(100.0, 30.0, 30.0));
        store.set_mode(AgentMode::Observing);
        store.set_last_regime(Regime::Bull);
        store.persist().unwrap();

        let reloaded = StateStore::load_or_default(&path);
        let snap = reloaded.snapshot();
        assert_eq!(snap.positions.len(), 1);
        assert_eq!(snap.pending_buys.len(), 1);
        assert_eq!(snap.mode, AgentMode::Observing);
        assert_eq!(snap.last_regime, Regime::Bull);
        assert!((snap.capital.total_assets - 160.0).abs() < 1e-12);
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn persist_bumps_version_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.persist().unwrap();
        store.persist().unwrap();
        assert_eq!(store.snapshot().version, 2);
    }

    #[test]
    fn capital_identity_holds() {
        let c = CapitalAwareness::compute(10.0, 20.0, 30.0);
        assert!((c.total_assets - (c.quote_available + c.quote_locked + c.holdings_value)).abs() < 1e-12);
    }

    #[test]
    fn quarantine_bars_symbol_until_day_roll() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(!store.is_quarantined("XUSDT"));
        store.quarantine("XUSDT");
        assert!(store.is_quarantined("XUSDT"));
        // Same-day roll is a no-op; the quarantine stands.
        store.roll_daily();
        assert!(store.is_quarantined("XUSDT"));
    }

    #[test]
    fn reconcile_request_flag_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(!store.take_reconcile_request());
        store.request_reconcile();
        assert!(store.take_reconcile_request());
        assert!(!store.take_reconcile_request());
    }
}
