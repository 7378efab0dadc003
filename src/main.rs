// =============================================================================
// Meridian Spot Agent — Main Entry Point
// =============================================================================
//
// The agent starts in paper-trading mode unless PAPER_TRADING=false and API
// credentials are present. Exit codes: 0 normal shutdown, 1 unrecoverable
// configuration error, 2 fatal reconciliation failure, 130 after SIGINT.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent;
mod api;
mod app_state;
mod exchange;
mod execution;
mod indicators;
mod learning;
mod market_data;
mod monitor;
mod reconcile;
mod regime;
mod risk;
mod runtime_config;
mod scoring;
mod signals;
mod state;
mod types;
mod universe;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{Agent, AgentExit};
use crate::app_state::AppState;
use crate::exchange::binance::BinanceClient;
use crate::exchange::paper::PaperExchange;
use crate::exchange::ExchangeClient;
use crate::runtime_config::RuntimeConfig;

const SIGNAL_NONE: u8 = 0;
const SIGNAL_INT: u8 = 1;
const SIGNAL_TERM: u8 = 2;

/// Default quote balance for a fresh paper session.
const PAPER_STARTING_BALANCE: f64 = 1000.0;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Spot Agent starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return 1;
    }

    info!(
        paper_trading = config.paper_trading,
        quote_asset = %config.quote_asset,
        scan_interval_secs = config.scan_interval_secs,
        max_total_positions = config.max_total_positions,
        "runtime config ready"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let client: Arc<dyn ExchangeClient> = if config.paper_trading {
        info!("paper trading enabled: orders never leave this process");
        Arc::new(PaperExchange::new(
            &config.quote_asset,
            PAPER_STARTING_BALANCE,
            config.fee_rate,
        ))
    } else {
        let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
        if api_key.is_empty() || api_secret.is_empty() {
            error!("live trading requires EXCHANGE_API_KEY and EXCHANGE_API_SECRET");
            return 1;
        }
        Arc::new(BinanceClient::new(api_key, api_secret))
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let app = Arc::new(AppState::new(config, client));

    // ── 4. Status probe ──────────────────────────────────────────────────
    let api_app = app.clone();
    tokio::spawn(async move {
        let router = api::rest::router(api_app);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "status probe listening");
                if let Err(e) = axum::serve(listener, router).await {
                    error!(error = %e, "status probe failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "status probe bind failed"),
        }
    });

    // ── 5. Signal handling ───────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_kind = Arc::new(AtomicU8::new(SIGNAL_NONE));
    spawn_signal_listener(shutdown.clone(), signal_kind.clone());

    // ── 6. Agent loop ────────────────────────────────────────────────────
    let agent = Agent::new(app.clone(), shutdown);
    let exit = agent.run().await;

    // Save the runtime config so operator tweaks survive restarts.
    if let Err(e) = app.config.read().save(&config_path) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    match exit {
        AgentExit::FatalReconciliation => {
            error!("exiting after fatal reconciliation failure");
            2
        }
        AgentExit::Shutdown => {
            info!("Meridian Spot Agent shut down complete");
            if signal_kind.load(Ordering::SeqCst) == SIGNAL_INT {
                130
            } else {
                0
            }
        }
    }
}

/// Listen for SIGINT and SIGTERM; the agent honors the flag at the next
/// phase boundary and completes its persist phase before exiting.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>, signal_kind: Arc<AtomicU8>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("SIGINT received, shutting down gracefully");
                    signal_kind.store(SIGNAL_INT, Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received, shutting down gracefully");
                    signal_kind.store(SIGNAL_TERM, Ordering::SeqCst);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            warn!("interrupt received, shutting down gracefully");
            signal_kind.store(SIGNAL_INT, Ordering::SeqCst);
        }

        shutdown.store(true, Ordering::SeqCst);
    });
}
