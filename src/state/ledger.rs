// =============================================================================
// Trade Ledger — append-only JSONL log of realized fills
// =============================================================================
//
// One line per fill, unique id per record. The append is flushed and synced
// before the caller proceeds: a close appends its record *before* the
// position leaves the state store, so a crash between the two leaves a
// ledger-closed position for the reconciler to clean up.
//
// On restart the ledger is the source of truth for historical performance
// and for FIFO entry-price reconstruction.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::regime::Regime;
use crate::types::{OrderSide, TradeReason};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSource {
    /// A fill the agent actively executed.
    ActiveTrade,
    /// A fill imported from exchange history during reconciliation.
    HistorySync,
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fees: f64,
    pub timestamp: DateTime<Utc>,
    /// Close reason for sells; `None` for plain entry buys.
    #[serde(default)]
    pub reason: Option<TradeReason>,
    /// Realized PnL, only meaningful on sells.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    /// Regime adopted when the originating position was entered.
    pub regime: Regime,
    pub source: FillSource,
}

impl TradeRecord {
    pub fn entry(symbol: &str, quantity: f64, price: f64, fees: f64, regime: Regime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity,
            price,
            fees,
            timestamp: Utc::now(),
            reason: None,
            realized_pnl: None,
            regime,
            source: FillSource::ActiveTrade,
        }
    }

    pub fn exit(
        symbol: &str,
        quantity: f64,
        price: f64,
        fees: f64,
        reason: TradeReason,
        realized_pnl: f64,
        regime: Regime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            quantity,
            price,
            fees,
            timestamp: Utc::now(),
            reason: Some(reason),
            realized_pnl: Some(realized_pnl),
            regime,
            source: FillSource::ActiveTrade,
        }
    }
}

/// Append-only ledger over a JSONL file.
pub struct TradeLedger {
    path: PathBuf,
    // Serializes appends so records never interleave.
    write_lock: Mutex<()>,
}

impl TradeLedger {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut line = serde_json::to_string(record).context("failed to serialise trade record")?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .context("failed to append trade record")?;
        file.sync_all().context("failed to sync ledger")?;

        debug!(id = %record.id, symbol = %record.symbol, side = %record.side, "ledger append");
        Ok(())
    }

    /// Load every record, oldest first. Unparseable lines are skipped with a
    /// warning rather than failing the whole load.
    pub fn load_all(&self) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read ledger {}", self.path.display()))?;

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(line = idx + 1, error = %e, "skipping unparseable ledger line"),
            }
        }
        Ok(records)
    }

    /// Most recent buy for `symbol`, used to reconstruct an unknown entry
    /// price during reconciliation.
    pub fn last_buy(&self, symbol: &str) -> Result<Option<TradeRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .rev()
            .find(|r| r.symbol == symbol && r.side == OrderSide::Buy))
    }

    /// Net base quantity held per the ledger: buys minus sells, FIFO order.
    pub fn net_quantity(&self, symbol: &str) -> Result<f64> {
        let mut net = 0.0;
        for record in self.load_all()? {
            if record.symbol != symbol {
                continue;
            }
            match record.side {
                OrderSide::Buy => net += record.quantity,
                OrderSide::Sell => net -= record.quantity,
            }
        }
        Ok(net)
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLedger")
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &tempfile::TempDir) -> TradeLedger {
        TradeLedger::open(dir.path().join("trades.jsonl"))
    }

    #[test]
    fn append_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        let entry = TradeRecord::entry("BTCUSDT", 3.0, 10.0, 0.03, Regime::Normal);
        let exit = TradeRecord::exit(
            "BTCUSDT",
            3.0,
            10.15,
            0.03,
            TradeReason::TakeProfit,
            0.39,
            Regime::Normal,
        );
        ledger.append(&entry).unwrap();
        ledger.append(&exit).unwrap();

        let all = ledger.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry);
        assert_eq!(all[1], exit);
    }

    #[test]
    fn record_ids_are_unique() {
        let a = TradeRecord::entry("X", 1.0, 1.0, 0.0, Regime::Unknown);
        let b = TradeRecord::entry("X", 1.0, 1.0, 0.0, Regime::Unknown);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ledger(&dir).load_all().unwrap().is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let ledger = TradeLedger::open(&path);

        ledger
            .append(&TradeRecord::entry("BTCUSDT", 1.0, 10.0, 0.01, Regime::Flat))
            .unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{{{{ not json\n");
        std::fs::write(&path, content).unwrap();
        ledger
            .append(&TradeRecord::entry("ETHUSDT", 1.0, 20.0, 0.02, Regime::Flat))
            .unwrap();

        let all = ledger.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn last_buy_finds_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger
            .append(&TradeRecord::entry("BTCUSDT", 1.0, 10.0, 0.01, Regime::Normal))
            .unwrap();
        ledger
            .append(&TradeRecord::entry("BTCUSDT", 2.0, 12.0, 0.02, Regime::Normal))
            .unwrap();
        ledger
            .append(&TradeRecord::entry("ETHUSDT", 1.0, 99.0, 0.01, Regime::Normal))
            .unwrap();

        let buy = ledger.last_buy("BTCUSDT").unwrap().unwrap();
        assert!((buy.price - 12.0).abs() < 1e-12);
        assert!(ledger.last_buy("SOLUSDT").unwrap().is_none());
    }

    #[test]
    fn net_quantity_reconciles_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger
            .append(&TradeRecord::entry("BTCUSDT", 3.0, 10.0, 0.03, Regime::Normal))
            .unwrap();
        ledger
            .append(&TradeRecord::exit(
                "BTCUSDT",
                1.0,
                10.2,
                0.01,
                TradeReason::RecycleProfit,
                0.2,
                Regime::Normal,
            ))
            .unwrap();

        let net = ledger.net_quantity("BTCUSDT").unwrap();
        assert!((net - 2.0).abs() < 1e-12);
    }
}
