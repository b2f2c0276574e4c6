//! HTTP surface — dashboard, health, stats and the proxied message paths.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json},
    routing::{any, get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::AppResult;
use crate::modules::infra::database::Timeframe;
use crate::modules::proxy::{self, ROLLING_WINDOW_HOURS};
use crate::modules::state::AppState;
use crate::modules::config::get_data_dir;

// ============================================================================
// Endpoints
// ============================================================================

/// Health check
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Aggregated ledger + prediction + router view for external consumers.
async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match build_stats(&state) {
        Ok(stats) => (StatusCode::OK, Json(stats)),
        Err(e) => {
            error!("Stats query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e })),
            )
        }
    }
}

fn build_stats(state: &AppState) -> Result<Value, String> {
    let session = state.ledger.get_total_usage(Timeframe::Session)?;
    let today = state.ledger.get_total_usage(Timeframe::Today)?;
    let week = state.ledger.get_total_usage(Timeframe::Week)?;
    let saved = state.ledger.get_routing_savings(Timeframe::Session)?;

    let model = state
        .router
        .current_model()
        .or_else(|| {
            state
                .router
                .primary_provider()
                .and_then(|p| p.models.first().cloned())
        })
        .unwrap_or_else(|| "claude-sonnet-4-5".to_string());
    let prediction = state.predictor.predict(ROLLING_WINDOW_HOURS, &model)?;

    Ok(json!({
        "usage": {
            "input_tokens": session.input_tokens,
            "output_tokens": session.output_tokens,
            "cache_read_tokens": session.cache_read_tokens,
            "cache_write_tokens": session.cache_write_tokens,
            "session_cost": session.total_cost,
            "today_cost": today.total_cost,
            "week_cost": week.total_cost,
            "saved_by_routing": saved,
        },
        "prediction": {
            "usage_percent": prediction.usage_percent,
            "minutes_until_limit": prediction.minutes_until_limit_or_sentinel(),
            "velocity": prediction.velocity.tokens_per_hour,
            "confidence": prediction.confidence,
            "trend": prediction.velocity.trend,
        },
        "session": {
            "requests": session.request_count,
        },
        "router": state.router.get_status(),
    }))
}

/// Static dashboard when the asset exists; a minimal inline page otherwise.
async fn dashboard() -> Html<String> {
    if let Ok(dir) = get_data_dir() {
        if let Ok(html) = std::fs::read_to_string(dir.join("dashboard.html")) {
            return Html(html);
        }
    }
    Html(INLINE_DASHBOARD.to_string())
}

const INLINE_DASHBOARD: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>cruise</title></head>
<body style="font-family: monospace; margin: 2em;">
  <h1>cruise</h1>
  <p>Proxy is running. Live numbers: <a href="/stats">/stats</a> &middot; <a href="/health">/health</a></p>
  <pre id="out">loading...</pre>
  <script>
    async function refresh() {
      const r = await fetch('/stats');
      document.getElementById('out').textContent = JSON.stringify(await r.json(), null, 2);
    }
    refresh(); setInterval(refresh, 5000);
  </script>
</body>
</html>
"#;

// ============================================================================
// Server Startup
// ============================================================================

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Views
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/stats", get(stats))
        // Proxied message path
        .route("/v1/messages", post(proxy::handle_messages))
        // Everything else under /v1 forwards to the primary unchanged
        .route("/v1/{*path}", any(proxy::handle_passthrough))
        // CORS
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(state: Arc<AppState>, port: u16) -> AppResult<()> {
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Proxy listening on http://localhost:{}", port);
    info!("Stats: http://localhost:{}/stats", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
