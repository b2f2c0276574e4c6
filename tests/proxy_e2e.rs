//! End-to-end proxy tests against a fake upstream server.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{Json, Response},
    routing::post,
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use cruise::models::{AppConfig, ProviderKind};
use cruise::modules::infra::database::{Ledger, NewUsageLog, Timeframe};
use cruise::modules::server::build_router;
use cruise::modules::state::AppState;
use cruise::utils::ids::now_ms;

/// Requests captured by a fake upstream, body + selected headers.
#[derive(Default)]
struct Captured {
    bodies: Vec<Value>,
    api_keys: Vec<Option<String>>,
    auth_headers: Vec<Option<String>>,
}

type Shared = Arc<Mutex<Captured>>;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn capture(captured: &Shared, headers: &HeaderMap, body: &Value) {
    let mut guard = captured.lock();
    guard.bodies.push(body.clone());
    guard
        .api_keys
        .push(headers.get("x-api-key").map(|v| v.to_str().unwrap().to_string()));
    guard
        .auth_headers
        .push(headers.get("authorization").map(|v| v.to_str().unwrap().to_string()));
}

/// Fake primary returning a fixed usage block.
async fn spawn_primary_ok(captured: Shared) -> String {
    let app = Router::new().route(
        "/v1/messages",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                capture(&captured, &headers, &body);
                Json(json!({
                    "id": "msg_01",
                    "model": body["model"],
                    "content": [{"type": "text", "text": "hello"}],
                    "usage": {"input_tokens": 10, "output_tokens": 20},
                }))
            }
        }),
    );
    spawn(app).await
}

/// Fake primary that always rejects with a quota error.
async fn spawn_primary_429() -> String {
    let app = Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": {"type": "rate_limit_exceeded"}})),
            )
        }),
    );
    spawn(app).await
}

/// Fake primary that streams three SSE-ish chunks.
async fn spawn_primary_streaming() -> String {
    let app = Router::new().route(
        "/v1/messages",
        post(|| async {
            let chunks: Vec<Result<String, std::io::Error>> = vec![
                Ok("event: message_start\ndata: {\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n".to_string()),
                Ok("data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n".to_string()),
                Ok("data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":11}}\n\n".to_string()),
            ];
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(futures::stream::iter(chunks)))
                .unwrap()
        }),
    );
    spawn(app).await
}

/// Fake OpenAI-compatible provider.
async fn spawn_openai_compatible(captured: Shared) -> String {
    let app = Router::new().route(
        "/chat/completions",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                capture(&captured, &headers, &body);
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 6},
                }))
            }
        }),
    );
    spawn(app).await
}

/// Catch-all fake for pass-through checks.
async fn spawn_passthrough_target() -> String {
    let app = Router::new().route(
        "/v1/models",
        axum::routing::get(|headers: HeaderMap| async move {
            let key = headers
                .get("x-api-key")
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            Json(json!({"data": [], "seen_key": key}))
        }),
    );
    spawn(app).await
}

fn state_with_primary(endpoint: &str) -> Arc<AppState> {
    let mut config = AppConfig::new();
    for provider in &mut config.router.providers {
        if provider.kind == ProviderKind::Primary {
            provider.endpoint = endpoint.to_string();
            provider.api_key = Some("sk-config".to_string());
        }
    }
    Arc::new(AppState::new(config, Arc::new(Ledger::open_in_memory().unwrap())))
}

fn seed_window_tokens(ledger: &Ledger, total: i64) {
    ledger
        .add_log(NewUsageLog {
            timestamp: now_ms(),
            model: "claude-sonnet-4-5".to_string(),
            provider: "anthropic".to_string(),
            input_tokens: total / 2,
            output_tokens: total - total / 2,
            success: true,
            ..Default::default()
        })
        .unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_request_under_threshold() {
    let captured: Shared = Default::default();
    let upstream = spawn_primary_ok(captured.clone()).await;
    let state = state_with_primary(&upstream);
    let proxy = spawn(build_router(state.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["usage"]["input_tokens"], 10);
    assert_eq!(body["usage"]["output_tokens"], 20);

    // Client key wins over the configured one; body reaches the upstream
    // with the model untouched (no routing below threshold)
    {
        let guard = captured.lock();
        assert_eq!(guard.api_keys[0].as_deref(), Some("sk-client"));
        assert_eq!(guard.bodies[0]["model"], "claude-sonnet-4-5");
        assert_eq!(guard.bodies[0]["messages"][0]["content"], "hi");
    }

    let logs = state.ledger.get_session_logs().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].model, "claude-sonnet-4-5");
    assert_eq!(logs[0].input_tokens, 10);
    assert_eq!(logs[0].output_tokens, 20);
    assert!((logs[0].cost_usd - 0.00033).abs() < 1e-9);
    assert!(logs[0].routed_from.is_none());
    assert!(logs[0].success);
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_crossing_downgrades_to_cheap_model() {
    let captured: Shared = Default::default();
    let upstream = spawn_primary_ok(captured.clone()).await;
    let state = state_with_primary(&upstream);
    // 3.6M of the 5M default = 72%, above the 70% threshold
    seed_window_tokens(&state.ledger, 3_600_000);
    let proxy = spawn(build_router(state.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert_eq!(captured.lock().bodies[0]["model"], "claude-haiku-4-5");

    let logs = state.ledger.get_session_logs().unwrap();
    // Seed row plus the proxied request
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].model, "claude-haiku-4-5");
    assert_eq!(logs[0].routed_from.as_deref(), Some("claude-sonnet-4-5"));

    let saved = state.ledger.get_routing_savings(Timeframe::Session).unwrap();
    assert!(saved > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_rejection_learns_and_falls_back() {
    let primary = spawn_primary_429().await;
    let openai_captured: Shared = Default::default();
    let openrouter = spawn_openai_compatible(openai_captured.clone()).await;

    let mut config = AppConfig::new();
    for provider in &mut config.router.providers {
        match provider.kind {
            ProviderKind::Primary => {
                provider.endpoint = primary.clone();
                provider.api_key = Some("sk-config".to_string());
            }
            ProviderKind::OpenaiCompatible => {
                provider.endpoint = openrouter.clone();
                provider.api_key = Some("sk-or".to_string());
                provider.enabled = true;
            }
            ProviderKind::LocalChat => {}
        }
    }
    let state = Arc::new(AppState::new(config, Arc::new(Ledger::open_in_memory().unwrap())));
    seed_window_tokens(&state.ledger, 4_000_000);
    let proxy = spawn(build_router(state.clone())).await;

    let client = reqwest::Client::new();
    let request_body = json!({
        "model": "claude-sonnet-4-5",
        "system": "S",
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"},
        ]}],
        "max_tokens": 16,
    });

    // First request hits the primary's quota and passes the 429 through
    let resp = client
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&request_body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_exceeded");

    let history = state.ledger.get_rate_limit_history("claude-sonnet-4-5").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tokens_used_before_limit, 4_000_000);
    assert_eq!(
        state.predictor.get_learned_limit("claude-sonnet-4-5").token_limit,
        3_800_000
    );
    assert!(state.router.is_rate_limited());

    // Second request sticks to the non-primary fallback, with the
    // OpenAI-compatible schema: system prepended, parts flattened
    let resp = client
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&request_body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    {
        let guard = openai_captured.lock();
        assert_eq!(guard.bodies.len(), 1);
        let outbound = &guard.bodies[0];
        assert_eq!(outbound["model"], "anthropic/claude-sonnet-4.5");
        assert_eq!(
            outbound["messages"],
            json!([
                {"role": "system", "content": "S"},
                {"role": "user", "content": "a\nb"},
            ])
        );
        assert_eq!(outbound["max_tokens"], 16);
        assert_eq!(outbound["stream"], false);
        assert_eq!(guard.auth_headers[0].as_deref(), Some("Bearer sk-or"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_passes_bytes_and_extracts_usage() {
    let upstream = spawn_primary_streaming().await;
    let state = state_with_primary(&upstream);
    let proxy = spawn(build_router(state.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
            "stream": true,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("message_start"));
    assert!(text.contains("content_block_delta"));
    assert!(text.contains("\"output_tokens\":11"));

    // The meter writes after the stream closes; give it a beat
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let logs = state.ledger.get_session_logs().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].input_tokens, 7);
    assert_eq!(logs[0].output_tokens, 11);
    assert!(logs[0].success);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credential_is_rejected_without_ledger_row() {
    let captured: Shared = Default::default();
    let upstream = spawn_primary_ok(captured.clone()).await;

    let mut config = AppConfig::new();
    for provider in &mut config.router.providers {
        if provider.kind == ProviderKind::Primary {
            provider.endpoint = upstream.clone();
            provider.api_key = None;
        }
    }
    let state = Arc::new(AppState::new(config, Arc::new(Ledger::open_in_memory().unwrap())));
    let proxy = spawn(build_router(state.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy))
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    // No upstream call, no ledger row
    assert!(captured.lock().bodies.is_empty());
    assert!(state.ledger.get_session_logs().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn passthrough_forwards_other_v1_paths() {
    let upstream = spawn_passthrough_target().await;
    let state = state_with_primary(&upstream);
    let proxy = spawn(build_router(state.clone())).await;

    let resp = reqwest::Client::new()
        .get(format!("{}/v1/models", proxy))
        .header("x-api-key", "sk-client")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["seen_key"], "sk-client");
    // Pass-through writes no usage rows
    assert!(state.ledger.get_session_logs().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_stats_endpoints() {
    let captured: Shared = Default::default();
    let upstream = spawn_primary_ok(captured).await;
    let state = state_with_primary(&upstream);
    let proxy = spawn(build_router(state.clone())).await;

    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["version"].is_string());

    client
        .post(format!("{}/v1/messages", proxy))
        .header("x-api-key", "sk-client")
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();

    let stats: Value = client
        .get(format!("{}/stats", proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["usage"]["input_tokens"], 10);
    assert_eq!(stats["usage"]["output_tokens"], 20);
    assert_eq!(stats["session"]["requests"], 1);
    assert_eq!(stats["router"]["is_rate_limited"], false);
    assert!(stats["prediction"]["trend"].as_array().is_some());
}
