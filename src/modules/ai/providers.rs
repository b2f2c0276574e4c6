//! Provider adapters — translate the native Messages schema to each upstream.
//!
//! Three schema families are bridged: the primary Messages API, the
//! OpenAI-compatible chat-completions API, and the local /api/chat API.
//! Request bodies are built as `serde_json::Value`; headers as plain pairs.

use serde_json::{json, Value};

use crate::models::ProviderKind;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Advertising headers required by OpenAI-compatible gateways.
const REFERER: &str = "http://localhost:4141";
const APP_TITLE: &str = "cruise";

// ============================================================================
// Request URLs
// ============================================================================

/// Endpoint URL for the message call on a provider.
pub fn request_url(kind: ProviderKind, endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    match kind {
        ProviderKind::Primary => format!("{}/v1/messages", base),
        ProviderKind::OpenaiCompatible => format!("{}/chat/completions", base),
        ProviderKind::LocalChat => format!("{}/api/chat", base),
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Headers for one outbound request. `api_key` is required for the primary
/// and OpenAI-compatible schemas; `beta` is the client's optional beta header,
/// passed through to the primary only.
pub fn build_headers(
    kind: ProviderKind,
    api_key: Option<&str>,
    beta: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

    match kind {
        ProviderKind::Primary => {
            if let Some(key) = api_key {
                headers.push(("x-api-key".to_string(), key.to_string()));
            }
            headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
            if let Some(beta) = beta {
                headers.push(("anthropic-beta".to_string(), beta.to_string()));
            }
        }
        ProviderKind::OpenaiCompatible => {
            if let Some(key) = api_key {
                headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
            }
            headers.push(("HTTP-Referer".to_string(), REFERER.to_string()));
            headers.push(("X-Title".to_string(), APP_TITLE.to_string()));
        }
        ProviderKind::LocalChat => {}
    }

    headers
}

// ============================================================================
// Request Body Builders
// ============================================================================

/// Primary schema: the client body forwarded with only `model` replaced.
pub fn build_primary_request(body: &Value, model: &str) -> Value {
    let mut out = body.clone();
    out["model"] = json!(model);
    out
}

/// OpenAI-compatible schema: `{model, messages, max_tokens, stream}` with
/// flattened messages and the system prompt prepended.
pub fn build_openai_request(body: &Value, model: &str) -> Value {
    json!({
        "model": model,
        "messages": flatten_messages(body),
        "max_tokens": body["max_tokens"].as_u64().unwrap_or(4096),
        "stream": body["stream"].as_bool().unwrap_or(false),
    })
}

/// Local-chat schema: `{model, messages, stream}`, same flattening.
pub fn build_local_request(body: &Value, model: &str) -> Value {
    json!({
        "model": model,
        "messages": flatten_messages(body),
        "stream": body["stream"].as_bool().unwrap_or(false),
    })
}

/// Build the outbound body for whichever schema the target speaks.
pub fn build_request(kind: ProviderKind, body: &Value, model: &str) -> Value {
    match kind {
        ProviderKind::Primary => build_primary_request(body, model),
        ProviderKind::OpenaiCompatible => build_openai_request(body, model),
        ProviderKind::LocalChat => build_local_request(body, model),
    }
}

// ============================================================================
// Message Flattening
// ============================================================================

/// Native messages carry either a string or an array of content parts; the
/// chat schemas only take strings. Text parts are joined with newlines.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// Flattened message list. A top-level `system` field becomes the leading
/// `{role:"system"}` message.
fn flatten_messages(body: &Value) -> Vec<Value> {
    let mut out = Vec::new();

    let system = &body["system"];
    if !system.is_null() {
        out.push(json!({
            "role": "system",
            "content": flatten_content(system),
        }));
    }

    if let Some(messages) = body["messages"].as_array() {
        for message in messages {
            out.push(json!({
                "role": message["role"].as_str().unwrap_or("user"),
                "content": flatten_content(&message["content"]),
            }));
        }
    }

    out
}
