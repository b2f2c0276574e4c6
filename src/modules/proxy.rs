//! Proxy engine — the metered message path and the raw pass-through.
//!
//! One request: parse the native body, ask the router for a target, translate
//! via the matching adapter, forward, and write exactly one usage row once
//! the upstream response has been consumed. Streamed bodies pass through
//! chunk-by-chunk and are metered on the way past.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::models::ProviderKind;
use crate::modules::ai::providers;
use crate::modules::ai::streaming::{parse_usage_block, StreamScanner, UsageCounts};
use crate::modules::infra::database::{NewRateLimitEvent, NewRoutingDecision, NewUsageLog};
use crate::modules::router::RouteDecision;
use crate::modules::state::AppState;
use crate::utils::http::get_upstream_client;
use crate::utils::ids::now_ms;

/// The primary provider's rolling quota window.
pub const ROLLING_WINDOW_HOURS: f64 = 5.0;

// ============================================================================
// POST /v1/messages
// ============================================================================

pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    req_headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("request body is not valid JSON: {}", e),
            );
        }
    };

    let requested_model = payload["model"].as_str().unwrap_or_default().to_string();
    let stream_requested = payload["stream"].as_bool().unwrap_or(false);

    let usage_percent = match state.predictor.predict(ROLLING_WINDOW_HOURS, &requested_model) {
        Ok(p) => p.usage_percent,
        Err(e) => {
            warn!("Prediction unavailable, assuming 0% usage: {}", e);
            0.0
        }
    };

    let decision = state.router.route(&requested_model, usage_percent);
    if decision.should_route {
        info!(
            "Routing {} -> {}/{} ({})",
            requested_model, decision.provider, decision.target_model, decision.reason
        );
    }

    // Credential resolution: the client's key wins for the primary; routed
    // providers use their configured key; local chat needs none.
    let client_key = req_headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty());
    let api_key: Option<String> = match decision.provider_kind {
        ProviderKind::Primary => client_key.map(str::to_string).or_else(|| decision.api_key.clone()),
        ProviderKind::OpenaiCompatible => decision.api_key.clone(),
        ProviderKind::LocalChat => None,
    };
    if api_key.is_none() && decision.provider_kind != ProviderKind::LocalChat {
        // No upstream call and no ledger row for unauthenticated requests
        return error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "missing api key",
        );
    }

    let beta = req_headers.get("anthropic-beta").and_then(|v| v.to_str().ok());
    let outbound = providers::build_request(decision.provider_kind, &payload, &decision.target_model);
    let url = providers::request_url(decision.provider_kind, &decision.endpoint);

    let mut request = get_upstream_client().post(&url).json(&outbound);
    for (name, value) in providers::build_headers(decision.provider_kind, api_key.as_deref(), beta) {
        request = request.header(&name, &value);
    }

    let upstream = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Upstream request failed: {}", e);
            write_usage_log(
                &state,
                &decision,
                UsageCounts::default(),
                started.elapsed().as_millis() as i64,
                false,
                Some("network_error".to_string()),
            );
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                &e.to_string(),
            );
        }
    };

    let status = upstream.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = upstream
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        handle_quota_rejection(&state, &decision.original_model, retry_after_secs);
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    if stream_requested && status.is_success() {
        // Pass chunks through verbatim; the meter writes the ledger row when
        // the upstream stream ends (or the client goes away).
        let meter = MeterStream::new(
            upstream.bytes_stream().boxed(),
            StreamMeter {
                state: state.clone(),
                decision,
                started,
            },
        );
        return response_with(status, &content_type, Body::from_stream(meter));
    }

    let bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to read upstream body: {}", e);
            write_usage_log(
                &state,
                &decision,
                UsageCounts::default(),
                started.elapsed().as_millis() as i64,
                false,
                Some("network_error".to_string()),
            );
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                &e.to_string(),
            );
        }
    };

    let (counts, error_type) = if status.is_success() {
        let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (parse_usage_block(&parsed), None)
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        (UsageCounts::default(), Some("rate_limit_exceeded".to_string()))
    } else {
        (UsageCounts::default(), Some(upstream_error_type(&bytes, status)))
    };

    if let Some(ref err) = error_type {
        // Bound the logged body; upstream errors can be arbitrarily large
        let preview: String = String::from_utf8_lossy(&bytes).chars().take(300).collect();
        warn!("Upstream returned {}: {} ({})", status, err, preview);
    }

    write_usage_log(
        &state,
        &decision,
        counts,
        started.elapsed().as_millis() as i64,
        status.is_success(),
        error_type,
    );

    response_with(status, &content_type, Body::from(bytes))
}

// ============================================================================
// Pass-through forwarder for other /v1/* paths
// ============================================================================

pub async fn handle_passthrough(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let endpoint = state
        .router
        .primary_provider()
        .map(|p| p.endpoint)
        .unwrap_or_else(|| "https://api.anthropic.com".to_string());

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let url = format!("{}{}", endpoint.trim_end_matches('/'), path_and_query);

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("failed to read request body: {}", e),
            );
        }
    };

    let mut request = get_upstream_client().request(parts.method.clone(), &url);
    for name in ["x-api-key", "anthropic-version", "content-type"] {
        if let Some(value) = parts.headers.get(name) {
            request = request.header(name, value.clone());
        }
    }

    let upstream = match request.body(body_bytes.to_vec()).send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Pass-through to {} failed: {}", url, e);
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                &e.to_string(),
            );
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = upstream.bytes().await.unwrap_or_default();

    response_with(status, &content_type, Body::from(bytes))
}

// ============================================================================
// Meter
// ============================================================================

/// Write the single usage row for one proxied response, and the routing
/// decision row when the request was switched. Failures are logged and never
/// surface to the client.
fn write_usage_log(
    state: &AppState,
    decision: &RouteDecision,
    counts: UsageCounts,
    latency_ms: i64,
    success: bool,
    error_type: Option<String>,
) {
    let entry = NewUsageLog {
        timestamp: now_ms(),
        model: decision.target_model.clone(),
        provider: decision.provider.clone(),
        input_tokens: counts.input_tokens,
        output_tokens: counts.output_tokens,
        cache_read_tokens: counts.cache_read_tokens,
        cache_write_tokens: counts.cache_write_tokens,
        latency_ms,
        success,
        error_type,
        project_path: state.ledger.project_path().to_string(),
        routed_from: decision.should_route.then(|| decision.original_model.clone()),
        routing_reason: decision.should_route.then(|| decision.reason.clone()),
    };

    if let Err(e) = state.ledger.add_log(entry) {
        error!("Usage log write failed: {}", e);
    }

    if decision.should_route {
        let original_provider = state
            .router
            .primary_provider()
            .map(|p| p.name)
            .unwrap_or_else(|| "anthropic".to_string());
        let row = NewRoutingDecision {
            timestamp: now_ms(),
            original_provider,
            routed_provider: decision.provider.clone(),
            routed_model: decision.target_model.clone(),
            reason: decision.reason.clone(),
            estimated_savings: decision.estimated_savings,
        };
        if let Err(e) = state.ledger.add_routing_decision(row) {
            error!("Routing decision write failed: {}", e);
        }
    }
}

/// Observed quota-rejection: persist the event with the window's token sum,
/// teach the learner, flip the router's sticky flag.
fn handle_quota_rejection(state: &Arc<AppState>, original_model: &str, retry_after_secs: Option<i64>) {
    let tokens = match state.ledger.get_window_token_sum(ROLLING_WINDOW_HOURS) {
        Ok(sum) => sum,
        Err(e) => {
            warn!("Window sum unavailable for rate-limit event: {}", e);
            0
        }
    };
    let reset_time = retry_after_secs.map(|secs| now_ms() + secs * 1000);

    let event = NewRateLimitEvent {
        timestamp: now_ms(),
        model: original_model.to_string(),
        error_type: "rate_limit_exceeded".to_string(),
        reset_time,
        tokens_used_before_limit: tokens,
        window_hours: ROLLING_WINDOW_HOURS as i64,
    };

    if let Err(e) = state.predictor.record_rate_limit(event) {
        error!("Failed to record rate-limit event: {}", e);
    }
    state.router.record_rate_limit(reset_time);
}

/// Context carried by a metered stream until its single ledger write.
struct StreamMeter {
    state: Arc<AppState>,
    decision: RouteDecision,
    started: Instant,
}

impl StreamMeter {
    fn finish(self, counts: UsageCounts, success: bool, error_type: Option<String>) {
        write_usage_log(
            &self.state,
            &self.decision,
            counts,
            self.started.elapsed().as_millis() as i64,
            success,
            error_type,
        );
    }
}

/// Forwards upstream chunks verbatim while scanning them for token counts.
/// The ledger write happens exactly once: at end-of-stream, on a stream
/// error, or from `Drop` when the client disconnects first.
struct MeterStream<S> {
    inner: S,
    scanner: StreamScanner,
    meter: Option<StreamMeter>,
}

impl<S> MeterStream<S> {
    fn new(inner: S, meter: StreamMeter) -> Self {
        Self {
            inner,
            scanner: StreamScanner::new(),
            meter: Some(meter),
        }
    }
}

impl<S, E> Stream for MeterStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.scanner.scan_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("Upstream stream error: {}", e);
                if let Some(meter) = this.meter.take() {
                    meter.finish(this.scanner.counts(), false, Some("stream_error".to_string()));
                }
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                ))))
            }
            Poll::Ready(None) => {
                if let Some(meter) = this.meter.take() {
                    meter.finish(this.scanner.counts(), true, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for MeterStream<S> {
    fn drop(&mut self) {
        // Client went away before the stream finished; keep what was counted
        if let Some(meter) = self.meter.take() {
            meter.finish(
                self.scanner.counts(),
                false,
                Some("client_disconnected".to_string()),
            );
        }
    }
}

// ============================================================================
// Response helpers
// ============================================================================

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": { "type": error_type, "message": message }
        })),
    )
        .into_response()
}

/// Error classification for non-2xx upstream bodies.
fn upstream_error_type(body: &[u8], status: StatusCode) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["type"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("http_{}", status.as_u16()))
}

fn response_with(status: StatusCode, content_type: &str, body: Body) -> Response {
    match Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
    {
        Ok(resp) => resp,
        Err(e) => {
            error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
