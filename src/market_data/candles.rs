// =============================================================================
// Candle Store — bounded per-(symbol, timeframe) OHLCV cache
// =============================================================================
//
// The agent loop fetches candles over REST during ScanPhase and deposits them
// here; the indicator pipeline and the regime detector read immutable
// snapshots. Series are capped so memory stays bounded no matter how long the
// process runs.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single OHLCV candle. Immutable once closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close time in epoch milliseconds.
    pub close_time: i64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time,
        }
    }
}

/// Timeframes the agent works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    /// Exchange interval string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
        }
    }

    /// The four timeframes checked by the multi-timeframe alignment signal.
    pub const ALL: [Timeframe; 4] = [Self::M1, Self::M5, Self::M15, Self::H1];
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one candle series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

/// Thread-safe bounded store of candle series.
pub struct CandleStore {
    series: RwLock<HashMap<CandleKey, Vec<Candle>>>,
    /// Maximum candles retained per series.
    cap: usize,
}

impl CandleStore {
    pub fn new(cap: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            cap,
        }
    }

    /// Replace the series for `key` with the freshly fetched `candles`
    /// (oldest first), truncated to the cap from the front.
    pub fn put(&self, key: CandleKey, mut candles: Vec<Candle>) {
        if candles.len() > self.cap {
            candles.drain(..candles.len() - self.cap);
        }
        self.series.write().insert(key, candles);
    }

    /// Snapshot of the series for `key`, oldest first.
    pub fn get(&self, key: &CandleKey) -> Vec<Candle> {
        self.series.read().get(key).cloned().unwrap_or_default()
    }

    /// Most recent close for `key`, if any candles are cached.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        self.series.read().get(key).and_then(|s| s.last()).map(|c| c.close)
    }

    /// Number of cached series (diagnostics).
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }
}

impl std::fmt::Debug for CandleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleStore")
            .field("series", &self.series_count())
            .field("cap", &self.cap)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, close: f64) -> Candle {
        Candle::new(i * 60_000, close, close + 1.0, close - 1.0, close, 100.0, (i + 1) * 60_000)
    }

    #[test]
    fn put_and_get_roundtrip() {
        let store = CandleStore::new(10);
        let key = CandleKey::new("BTCUSDT", Timeframe::M1);
        store.put(key.clone(), vec![candle(0, 100.0), candle(1, 101.0)]);

        let series = store.get(&key);
        assert_eq!(series.len(), 2);
        assert!((series[1].close - 101.0).abs() < f64::EPSILON);
        assert_eq!(store.last_close(&key), Some(101.0));
    }

    #[test]
    fn cap_keeps_most_recent() {
        let store = CandleStore::new(3);
        let key = CandleKey::new("ETHUSDT", Timeframe::M5);
        store.put(key.clone(), (0..5).map(|i| candle(i, 100.0 + i as f64)).collect());

        let series = store.get(&key);
        assert_eq!(series.len(), 3);
        // Oldest two dropped; the newest (close 104) is last.
        assert!((series[0].close - 102.0).abs() < f64::EPSILON);
        assert!((series[2].close - 104.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_key_is_empty() {
        let store = CandleStore::new(10);
        let key = CandleKey::new("NOPEUSDT", Timeframe::H1);
        assert!(store.get(&key).is_empty());
        assert!(store.last_close(&key).is_none());
    }

    #[test]
    fn timeframe_strings() {
        assert_eq!(Timeframe::M1.as_str(), "1m");
        assert_eq!(Timeframe::H1.as_str(), "1h");
        assert_eq!(Timeframe::ALL.len(), 4);
    }
}
