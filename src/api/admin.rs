// =============================================================================
// Admin API — Axum 0.7
// =============================================================================
//
// Operational surface for the indicator service:
//
//   GET  /healthz   liveness probe, plain "ok"
//   GET  /health    three-level health document (JSON)
//   GET  /metrics   counters, gauges, latency percentiles, fan-out stats
//   POST /reload    full per-TF indicator config; responds
//                   {status, preserved, created}; 400 on bad JSON or
//                   validation failure, 405 on wrong method (axum default)
//
// CORS is permissive; this surface is expected to sit behind the internal
// network boundary.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::indicators::{ReloadStats, TfIndicatorConfig};
use crate::metrics::PipelineMetrics;
use crate::pipeline::FanoutBus;

/// The slice of the indicator service the admin surface needs.
pub trait ReloadTarget: Send + Sync {
    fn reload(&self, configs: Vec<TfIndicatorConfig>) -> Result<ReloadStats>;
    fn enabled_tfs(&self) -> Vec<u32>;
}

pub struct AdminState {
    pub target: Arc<dyn ReloadTarget>,
    pub metrics: Arc<PipelineMetrics>,
    pub fanout: Arc<FanoutBus>,
}

/// Build the admin router with CORS and shared state.
pub fn router(state: Arc<AdminState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/reload", post(reload))
        .layer(cors)
        .with_state(state)
}

/// Serve the admin API until cancelled.
pub async fn run_admin_server(
    bind_addr: String,
    state: Arc<AdminState>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> &'static str {
    "ok"
}

async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let tfs = state.target.enabled_tfs();
    Json(state.metrics.build_health(&tfs))
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "pipeline": state.metrics.snapshot(),
        "fanout": state.fanout.channel_stats(),
    }))
}

/// `POST /reload` with a full `[TFIndicatorConfig]` body. The body is parsed
/// by hand so both malformed JSON and validation failures map to 400 with a
/// descriptive message.
async fn reload(State(state): State<Arc<AdminState>>, body: String) -> impl IntoResponse {
    let configs: Vec<TfIndicatorConfig> = match serde_json::from_str(&body) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "reload rejected: bad JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };

    match state.target.reload(configs) {
        Ok(stats) => {
            info!(
                preserved = stats.preserved,
                created = stats.created,
                "reload applied via admin API"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ok",
                    "preserved": stats.preserved,
                    "created": stats.created,
                })),
            )
        }
        Err(e) => {
            warn!(error = %e, "reload rejected: validation failed");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::Mutex;
    use tower::util::ServiceExt;

    use crate::indicators::IndicatorEngine;

    struct EngineTarget {
        engine: Mutex<IndicatorEngine>,
    }

    impl ReloadTarget for EngineTarget {
        fn reload(&self, configs: Vec<TfIndicatorConfig>) -> Result<ReloadStats> {
            Ok(self.engine.lock().reload_configs(configs)?)
        }
        fn enabled_tfs(&self) -> Vec<u32> {
            self.engine.lock().enabled_tfs()
        }
    }

    fn test_state() -> Arc<AdminState> {
        let configs: Vec<TfIndicatorConfig> =
            serde_json::from_str(r#"[{"tf":60,"indicators":[{"type":"SMA","period":9}]}]"#)
                .unwrap();
        Arc::new(AdminState {
            target: Arc::new(EngineTarget {
                engine: Mutex::new(IndicatorEngine::new(configs).unwrap()),
            }),
            metrics: Arc::new(PipelineMetrics::new()),
            fanout: Arc::new(FanoutBus::new()),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_public_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reload_applies_valid_config() {
        let app = router(test_state());
        let body = r#"[{"tf":60,"indicators":[{"type":"SMA","period":9},{"type":"EMA","period":21}]}]"#;
        let response = app
            .oneshot(
                Request::post("/reload")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["preserved"], 0); // no instrument state yet
        assert_eq!(json["created"], 0);
    }

    #[tokio::test]
    async fn reload_rejects_bad_json_with_400() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::post("/reload")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn reload_rejects_invalid_config_with_400() {
        let app = router(test_state());
        // Duplicate timeframe fails validation.
        let body = r#"[{"tf":60,"indicators":[{"type":"SMA","period":9}]},
                       {"tf":60,"indicators":[{"type":"EMA","period":9}]}]"#;
        let response = app
            .oneshot(Request::post("/reload").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reports_enabled_tfs() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["enabled_tfs"], serde_json::json!([60]));
        assert!(json["status"].is_string());
    }
}
