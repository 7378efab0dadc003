// =============================================================================
// Status Probe — health and engine-state endpoints
// =============================================================================
//
// Two read-only endpoints:
//   GET /healthz        -> "ok" (liveness)
//   GET /api/v1/status  -> full engine snapshot with the OK | DEGRADED |
//                          CRITICAL runtime status
//
// The probe never mutates trading state.
// =============================================================================

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::app_state::AppState;

/// Build the status router.
pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.build_snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::ExchangeClient;
    use crate::runtime_config::RuntimeConfig;

    fn app(dir: &tempfile::TempDir) -> Arc<AppState> {
        let mut cfg = RuntimeConfig::default();
        cfg.state_path = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.ledger_path = dir.path().join("trades.jsonl").to_string_lossy().into_owned();
        cfg.learning_path = dir.path().join("learning.json").to_string_lossy().into_owned();
        cfg.rules_cache_path = dir.path().join("rules.json").to_string_lossy().into_owned();
        let client: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new("USDT", 1000.0, 0.001));
        Arc::new(AppState::new(cfg, client))
    }

    #[tokio::test]
    async fn healthz_and_status_respond() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(app(&dir));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert!(health.status().is_success());

        let status = reqwest::get(format!("http://{addr}/api/v1/status"))
            .await
            .unwrap();
        assert!(status.status().is_success());
        let body: serde_json::Value = status.json().await.unwrap();
        assert_eq!(body["status"], "OK");
        assert_eq!(body["mode"], "TRADING");
    }
}
