//! Static pricing table — USD per million tokens, keyed by effective model.
//!
//! Routed OpenAI-compatible mirrors carry a `vendor/model` name and slightly
//! higher rates; local-chat models are free. Unknown models fall back to
//! primary Sonnet-class prices.

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

const SONNET: ModelPricing = ModelPricing { input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 };
const HAIKU: ModelPricing = ModelPricing { input: 0.8, output: 4.0, cache_read: 0.08, cache_write: 1.0 };
const OPUS: ModelPricing = ModelPricing { input: 15.0, output: 75.0, cache_read: 1.5, cache_write: 18.75 };
const FREE: ModelPricing = ModelPricing { input: 0.0, output: 0.0, cache_read: 0.0, cache_write: 0.0 };
const MIRROR_SONNET: ModelPricing = ModelPricing { input: 3.5, output: 16.0, cache_read: 0.0, cache_write: 0.0 };
const MIRROR_HAIKU: ModelPricing = ModelPricing { input: 1.0, output: 5.0, cache_read: 0.0, cache_write: 0.0 };

/// Look up pricing for a model name.
pub fn model_pricing(model: &str) -> ModelPricing {
    let m = model.to_lowercase();

    // OpenAI-compatible mirrors use "vendor/model" names
    if m.contains('/') {
        if m.contains("sonnet") { return MIRROR_SONNET; }
        if m.contains("haiku") { return MIRROR_HAIKU; }
    }

    // Local models (Ollama)
    if m.starts_with("llama") || m.starts_with("qwen") || m.starts_with("mistral")
        || m.starts_with("phi") || m.starts_with("gemma") || m.starts_with("deepseek")
    {
        return FREE;
    }

    if m.contains("haiku") { return HAIKU; }
    if m.contains("opus") { return OPUS; }
    if m.contains("sonnet") { return SONNET; }

    // Default: primary Sonnet-class
    SONNET
}

/// Calculate cost in USD for one request.
pub fn estimate_cost(
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_read_tokens: i64,
    cache_write_tokens: i64,
) -> f64 {
    let p = model_pricing(model);
    (input_tokens as f64 / 1_000_000.0) * p.input
        + (output_tokens as f64 / 1_000_000.0) * p.output
        + (cache_read_tokens as f64 / 1_000_000.0) * p.cache_read
        + (cache_write_tokens as f64 / 1_000_000.0) * p.cache_write
}

/// Tokens assumed per request when estimating routing savings.
const NOMINAL_REQUEST_TOKENS: i64 = 10_000;

/// Cost of a nominal request (10k input + 10k output) on a model.
/// Used to attribute per-decision savings without knowing real sizes upfront.
pub fn nominal_request_cost(model: &str) -> f64 {
    estimate_cost(model, NOMINAL_REQUEST_TOKENS, NOMINAL_REQUEST_TOKENS, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_lookup() {
        assert_eq!(model_pricing("claude-sonnet-4-5"), SONNET);
        assert_eq!(model_pricing("claude-haiku-4-5"), HAIKU);
        assert_eq!(model_pricing("claude-opus-4-1"), OPUS);
        assert_eq!(model_pricing("anthropic/claude-sonnet-4.5"), MIRROR_SONNET);
        assert_eq!(model_pricing("anthropic/claude-haiku-4.5"), MIRROR_HAIKU);
        assert_eq!(model_pricing("llama3.3"), FREE);
        assert_eq!(model_pricing("qwen2.5"), FREE);
        // Unknown model falls back to Sonnet-class
        assert_eq!(model_pricing("totally-unknown"), SONNET);
    }

    #[test]
    fn test_estimate_cost() {
        // 10 input + 20 output on sonnet: 10/1e6*3 + 20/1e6*15
        let cost = estimate_cost("claude-sonnet-4-5", 10, 20, 0, 0);
        assert!((cost - 0.00033).abs() < 1e-9);

        let with_cache = estimate_cost("claude-sonnet-4-5", 0, 0, 1_000_000, 1_000_000);
        assert!((with_cache - (0.3 + 3.75)).abs() < 1e-9);

        assert_eq!(estimate_cost("llama3.3", 5000, 5000, 0, 0), 0.0);
    }

    #[test]
    fn test_nominal_request_cost() {
        // sonnet: 10k/1e6 * (3 + 15) = 0.18
        assert!((nominal_request_cost("claude-sonnet-4-5") - 0.18).abs() < 1e-9);
        // haiku: 10k/1e6 * (0.8 + 4) = 0.048
        assert!((nominal_request_cost("claude-haiku-4-5") - 0.048).abs() < 1e-9);
    }
}
