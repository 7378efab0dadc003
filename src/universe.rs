// =============================================================================
// Symbol Universe & Rule Cache — eligible symbols with exchange rules
// =============================================================================
//
// refresh() pulls the full symbol list and filters out inactive symbols,
// quote-currency mismatches, the operator's ignore set, stablecoin bases,
// and purely numeric bases. The surviving set replaces the cache atomically.
//
// Rule refresh policy is merge-with-preserve: when a refresh payload omits a
// symbol's tick or lot (zero in the parsed rule), the previously cached
// values are retained. Missing-after-present is a transient exchange quirk,
// not a rule change.
//
// The cache is durable: rules survive restart and are usable before the
// first refresh completes. A failed refresh keeps the previous cache and
// raises the degraded flag.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, ExchangeError, SymbolRule};
use crate::runtime_config::RuntimeConfig;
use crate::state::durable::{durable_write_json, load_json};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UniverseError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRule {
    rule: SymbolRule,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UniverseFile {
    schema_version: u32,
    rules: Vec<CachedRule>,
    updated_at: String,
}

pub struct SymbolUniverse {
    rules: RwLock<HashMap<String, CachedRule>>,
    degraded: AtomicBool,
    /// Set when rule drift is detected (PriceIncrementInvalid); the agent
    /// loop refreshes out of schedule and clears it.
    refresh_requested: AtomicBool,
    path: PathBuf,
}

impl SymbolUniverse {
    /// Load the durable rule cache from `path`, or start empty.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let file: Option<UniverseFile> = load_json(&path).unwrap_or(None);

        let rules: HashMap<String, CachedRule> = file
            .map(|f| {
                f.rules
                    .into_iter()
                    .map(|c| (c.rule.symbol.clone(), c))
                    .collect()
            })
            .unwrap_or_default();

        if !rules.is_empty() {
            info!(path = %path.display(), count = rules.len(), "symbol rule cache loaded");
        }

        Self {
            rules: RwLock::new(rules),
            degraded: AtomicBool::new(false),
            refresh_requested: AtomicBool::new(false),
            path,
        }
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Refresh the universe from the exchange. On success the eligible set
    /// replaces the cache atomically and is persisted; on failure the
    /// previous cache is retained and the degraded flag raised.
    pub async fn refresh(
        &self,
        client: &dyn ExchangeClient,
        cfg: &RuntimeConfig,
    ) -> Result<usize, ExchangeError> {
        let fetched = match client.get_symbols().await {
            Ok(rules) => rules,
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                warn!(error = %e, "symbol refresh failed, keeping previous cache");
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut next: HashMap<String, CachedRule> = HashMap::new();
        {
            let current = self.rules.read();
            for mut rule in fetched {
                if !Self::eligible(&rule, cfg) {
                    continue;
                }

                // Merge-with-preserve: a zeroed tick/lot/min-notional in the
                // refresh payload keeps the cached prior value.
                if let Some(prev) = current.get(&rule.symbol) {
                    if rule.tick_size <= 0.0 {
                        rule.tick_size = prev.rule.tick_size;
                    }
                    if rule.lot_size <= 0.0 {
                        rule.lot_size = prev.rule.lot_size;
                    }
                    if rule.min_notional <= 0.0 {
                        rule.min_notional = prev.rule.min_notional;
                    }
                }

                next.insert(
                    rule.symbol.clone(),
                    CachedRule {
                        rule,
                        refreshed_at: now,
                    },
                );
            }
        }

        let count = next.len();
        *self.rules.write() = next;
        self.degraded.store(false, Ordering::SeqCst);
        info!(count, "symbol universe refreshed");

        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist symbol rule cache");
        }
        Ok(count)
    }

    /// Eligibility filter for one symbol.
    fn eligible(rule: &SymbolRule, cfg: &RuntimeConfig) -> bool {
        if !rule.active {
            return false;
        }
        if rule.quote_asset != cfg.quote_asset {
            return false;
        }
        if cfg.ignored_bases.iter().any(|b| b == &rule.base_asset) {
            return false;
        }
        if cfg.stablecoin_bases.iter().any(|b| b == &rule.base_asset) {
            return false;
        }
        // Purely numeric bases (e.g. leveraged-token artifacts) are junk.
        if !rule.base_asset.is_empty() && rule.base_asset.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        true
    }

    fn persist(&self) -> anyhow::Result<()> {
        let mut rules: Vec<CachedRule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.rule.symbol.cmp(&b.rule.symbol));
        let file = UniverseFile {
            schema_version: SCHEMA_VERSION,
            rules,
            updated_at: Utc::now().to_rfc3339(),
        };
        durable_write_json(&self.path, &file)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Trading rules for `symbol`.
    pub fn rules(&self, symbol: &str) -> Result<SymbolRule, UniverseError> {
        self.rules
            .read()
            .get(symbol)
            .map(|c| c.rule.clone())
            .ok_or_else(|| UniverseError::UnknownSymbol(symbol.to_string()))
    }

    /// Snapshot of eligible symbol keys.
    pub fn all(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.rules.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Drop a symbol from the eligible set (UnknownSymbol recovery path).
    pub fn remove(&self, symbol: &str) {
        if self.rules.write().remove(symbol).is_some() {
            warn!(symbol, "symbol removed from eligible set");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn request_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_refresh_request(&self) -> bool {
        self.refresh_requested.swap(false, Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

impl std::fmt::Debug for SymbolUniverse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolUniverse")
            .field("symbols", &self.len())
            .field("degraded", &self.is_degraded())
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

    fn rule(symbol: &str, base: &str, quote: &str, active: bool) -> SymbolRule {
        SymbolRule {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            tick_size: 0.01,
            lot_size: 0.001,
            min_notional: 5.0,
            active,
        }
    }

    fn universe(dir: &tempfile::TempDir) -> SymbolUniverse {
        SymbolUniverse::load_or_default(dir.path().join("rules.json"))
    }

    #[tokio::test]
    async fn refresh_filters_ineligible_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let uni = universe(&dir);
        let mut cfg = RuntimeConfig::default();
        cfg.ignored_bases = vec!["SHIB".to_string()];

        let ex = PaperExchange::new("USDT", 1000.0, 0.001);
        ex.seed_rule(rule("BTCUSDT", "BTC", "USDT", true));
        ex.seed_rule(rule("ETHBTC", "ETH", "BTC", true)); // quote mismatch
        ex.seed_rule(rule("XRPUSDT", "XRP", "USDT", false)); // inactive
        ex.seed_rule(rule("USDCUSDT", "USDC", "USDT", true)); // stablecoin base
        ex.seed_rule(rule("SHIBUSDT", "SHIB", "USDT", true)); // ignored
        ex.seed_rule(rule("1000USDT", "1000", "USDT", true)); // numeric base

        let count = uni.refresh(&ex, &cfg).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(uni.all(), vec!["BTCUSDT".to_string()]);
        assert!(!uni.is_degraded());
    }

    #[tokio::test]
    async fn rules_lookup_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let uni = universe(&dir);
        let cfg = RuntimeConfig::default();

        let ex = PaperExchange::new("USDT", 1000.0, 0.001);
        ex.seed_rule(rule("BTCUSDT", "BTC", "USDT", true));
        uni.refresh(&ex, &cfg).await.unwrap();

        assert!(uni.rules("BTCUSDT").is_ok());
        assert_eq!(
            uni.rules("NOPEUSDT"),
            Err(UniverseError::UnknownSymbol("NOPEUSDT".to_string()))
        );
    }

    #[tokio::test]
    async fn merge_preserves_tick_and_lot_when_payload_omits_them() {
        let dir = tempfile::tempdir().unwrap();
        let uni = universe(&dir);
        let cfg = RuntimeConfig::default();

        let ex = PaperExchange::new("USDT", 1000.0, 0.001);
        ex.seed_rule(rule("BTCUSDT", "BTC", "USDT", true));
        uni.refresh(&ex, &cfg).await.unwrap();

        // Second refresh returns a partial payload with zeroed tick/lot.
        let mut partial = rule("BTCUSDT", "BTC", "USDT", true);
        partial.tick_size = 0.0;
        partial.lot_size = 0.0;
        partial.min_notional = 0.0;
        ex.seed_rule(partial);
        uni.refresh(&ex, &cfg).await.unwrap();

        let merged = uni.rules("BTCUSDT").unwrap();
        assert!((merged.tick_size - 0.01).abs() < 1e-12);
        assert!((merged.lot_size - 0.001).abs() < 1e-12);
        assert!((merged.min_notional - 5.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_cache_and_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let uni = universe(&dir);
        let cfg = RuntimeConfig::default();

        let ex = PaperExchange::new("USDT", 1000.0, 0.001);
        ex.seed_rule(rule("BTCUSDT", "BTC", "USDT", true));
        uni.refresh(&ex, &cfg).await.unwrap();

        ex.inject_fault(ExchangeError::ExchangeUnavailable("down".into()));
        assert!(uni.refresh(&ex, &cfg).await.is_err());
        assert!(uni.is_degraded());
        // Previous cache survives.
        assert!(uni.rules("BTCUSDT").is_ok());

        ex.clear_fault();
        uni.refresh(&ex, &cfg).await.unwrap();
        assert!(!uni.is_degraded());
    }

    #[tokio::test]
    async fn cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let cfg = RuntimeConfig::default();

        {
            let uni = SymbolUniverse::load_or_default(&path);
            let ex = PaperExchange::new("USDT", 1000.0, 0.001);
            ex.seed_rule(rule("BTCUSDT", "BTC", "USDT", true));
            uni.refresh(&ex, &cfg).await.unwrap();
        }

        let reloaded = SymbolUniverse::load_or_default(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.rules("BTCUSDT").is_ok());
    }
}
