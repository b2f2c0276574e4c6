//! Router — picks the target provider + model for the next request.
//!
//! A threshold cascade over the predicted usage percent, plus a sticky
//! rate-limited flag that forces traffic off the primary until it clears.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::info;

use crate::models::{ProviderEntry, ProviderKind, RouterMode, RouterSettings};
use crate::modules::pricing::nominal_request_cost;
use crate::utils::ids::now_ms;

/// Fallback model on the primary when its haiku-class entry is not configured.
const DEFAULT_CHEAP_MODEL: &str = "claude-haiku-4-5";

const DEFAULT_PRIMARY_ENDPOINT: &str = "https://api.anthropic.com";

/// How long the rate-limited flag stays set when the upstream gives no reset.
const DEFAULT_RATE_LIMIT_CLEAR_MS: i64 = 5 * 3_600_000;

/// Minimum time the flag stays set even with an imminent reset.
const MIN_RATE_LIMIT_CLEAR_MS: i64 = 60_000;

/// Where one request should go.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider: String,
    pub provider_kind: ProviderKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub target_model: String,
    pub original_model: String,
    pub reason: String,
    pub estimated_savings: f64,
    /// True iff the target model differs from the requested model or the
    /// target provider is not the primary.
    pub should_route: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    is_rate_limited: bool,
    rate_limit_reset_time: Option<i64>,
    current_model: Option<String>,
    /// Bumped on every record; timed clears only apply when they still match
    generation: u64,
}

pub struct ModelRouter {
    settings: Mutex<RouterSettings>,
    state: Mutex<RouterState>,
}

impl ModelRouter {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            state: Mutex::new(RouterState::default()),
        }
    }

    // ========================================================================
    // Rate-limit flag
    // ========================================================================

    pub fn is_rate_limited(&self) -> bool {
        self.state.lock().is_rate_limited
    }

    /// Set the sticky flag and schedule its clearing: at `reset_time` when
    /// given (at least one minute out), else after the default 5 hours.
    pub fn record_rate_limit(self: &Arc<Self>, reset_time: Option<i64>) {
        let (delay_ms, generation) = {
            let mut state = self.state.lock();
            state.is_rate_limited = true;
            state.generation += 1;

            let delay_ms = match reset_time {
                Some(reset) => (reset - now_ms()).max(MIN_RATE_LIMIT_CLEAR_MS),
                None => DEFAULT_RATE_LIMIT_CLEAR_MS,
            };
            state.rate_limit_reset_time = Some(now_ms() + delay_ms);
            (delay_ms, state.generation)
        };

        info!("Rate limited; redirecting off primary for {}s", delay_ms / 1000);

        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
            let mut state = router.state.lock();
            if state.generation == generation {
                state.is_rate_limited = false;
                state.rate_limit_reset_time = None;
                info!("Rate-limit flag cleared");
            }
        });
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Decide the target for one request given the predicted usage percent.
    pub fn route(&self, requested_model: &str, usage_percent: f64) -> RouteDecision {
        let settings = self.settings.lock().clone();
        let rate_limited = self.is_rate_limited();

        let primary = settings
            .providers
            .iter()
            .find(|p| p.kind == ProviderKind::Primary && p.enabled);

        let decision = if !settings.enabled || settings.mode == RouterMode::Manual {
            self.no_route(requested_model, primary)
        } else if rate_limited {
            match self.pick_rate_limit_fallback(&settings.providers) {
                Some(provider) => {
                    let target_model = provider
                        .models
                        .first()
                        .cloned()
                        .unwrap_or_else(|| requested_model.to_string());
                    self.decision_for(
                        requested_model,
                        provider,
                        target_model,
                        format!("primary rate limited, falling back to {}", provider.name),
                    )
                }
                None => self.no_route(requested_model, primary),
            }
        } else {
            self.route_by_thresholds(requested_model, usage_percent, &settings, primary)
        };

        self.state.lock().current_model = Some(decision.target_model.clone());
        decision
    }

    fn route_by_thresholds(
        &self,
        requested_model: &str,
        usage_percent: f64,
        settings: &RouterSettings,
        primary: Option<&ProviderEntry>,
    ) -> RouteDecision {
        let t = &settings.thresholds;

        if usage_percent >= t.switch_to_local {
            if let Some(provider) = enabled_of_kind(&settings.providers, ProviderKind::LocalChat) {
                if let Some(model) = provider.models.first() {
                    return self.decision_for(
                        requested_model,
                        provider,
                        model.clone(),
                        format!("usage at {:.1}%, switching to local model", usage_percent),
                    );
                }
            }
        }

        if usage_percent >= t.switch_to_openrouter {
            if let Some(provider) =
                enabled_of_kind(&settings.providers, ProviderKind::OpenaiCompatible)
            {
                if let Some(model) = provider.models.first() {
                    return self.decision_for(
                        requested_model,
                        provider,
                        model.clone(),
                        format!("usage at {:.1}%, switching to {}", usage_percent, provider.name),
                    );
                }
            }
        }

        if usage_percent >= t.switch_to_haiku {
            if let Some(provider) = primary {
                let cheap = provider
                    .models
                    .iter()
                    .find(|m| m.to_lowercase().contains("haiku"))
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_CHEAP_MODEL.to_string());
                return self.decision_for(
                    requested_model,
                    provider,
                    cheap,
                    format!("usage at {:.1}%, downgrading to cheap model", usage_percent),
                );
            }
        }

        self.no_route(requested_model, primary)
    }

    /// Enabled non-primary providers in ascending priority; first wins.
    fn pick_rate_limit_fallback<'a>(
        &self,
        providers: &'a [ProviderEntry],
    ) -> Option<&'a ProviderEntry> {
        providers
            .iter()
            .filter(|p| p.enabled && p.kind != ProviderKind::Primary)
            .min_by_key(|p| p.priority)
    }

    fn decision_for(
        &self,
        requested_model: &str,
        provider: &ProviderEntry,
        target_model: String,
        reason: String,
    ) -> RouteDecision {
        let should_route =
            target_model != requested_model || provider.kind != ProviderKind::Primary;
        let estimated_savings = if should_route {
            (nominal_request_cost(requested_model) - nominal_request_cost(&target_model)).max(0.0)
        } else {
            0.0
        };

        RouteDecision {
            provider: provider.name.clone(),
            provider_kind: provider.kind,
            endpoint: provider.endpoint.clone(),
            api_key: provider.api_key.clone(),
            target_model,
            original_model: requested_model.to_string(),
            reason,
            estimated_savings,
            should_route,
        }
    }

    /// Requested model on the primary; nothing switched.
    fn no_route(&self, requested_model: &str, primary: Option<&ProviderEntry>) -> RouteDecision {
        RouteDecision {
            provider: primary.map(|p| p.name.clone()).unwrap_or_else(|| "anthropic".to_string()),
            provider_kind: ProviderKind::Primary,
            endpoint: primary
                .map(|p| p.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_PRIMARY_ENDPOINT.to_string()),
            api_key: primary.and_then(|p| p.api_key.clone()),
            target_model: requested_model.to_string(),
            original_model: requested_model.to_string(),
            reason: "within thresholds".to_string(),
            estimated_savings: 0.0,
            should_route: false,
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Most recent effective target model, if any request has been routed.
    pub fn current_model(&self) -> Option<String> {
        self.state.lock().current_model.clone()
    }

    /// The configured primary provider entry, enabled or not.
    pub fn primary_provider(&self) -> Option<ProviderEntry> {
        self.settings
            .lock()
            .providers
            .iter()
            .find(|p| p.kind == ProviderKind::Primary)
            .cloned()
    }

    pub fn set_mode(&self, mode: RouterMode) {
        self.settings.lock().mode = mode;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.lock().enabled = enabled;
    }

    /// Replace a provider entry by name, or append it when unknown.
    pub fn update_provider(&self, entry: ProviderEntry) {
        let mut settings = self.settings.lock();
        match settings.providers.iter_mut().find(|p| p.name == entry.name) {
            Some(existing) => *existing = entry,
            None => settings.providers.push(entry),
        }
    }

    /// Dashboard view of the router. Never includes API keys.
    pub fn get_status(&self) -> Value {
        let settings = self.settings.lock();
        let state = self.state.lock();

        let providers: Vec<Value> = settings
            .providers
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "enabled": p.enabled,
                    "has_api_key": p.api_key.as_ref().map(|k| !k.is_empty()).unwrap_or(false),
                })
            })
            .collect();

        let mut status = json!({
            "mode": settings.mode,
            "enabled": settings.enabled,
            "current_model": state.current_model,
            "is_rate_limited": state.is_rate_limited,
            "providers": providers,
        });
        if let Some(reset) = state.rate_limit_reset_time {
            status["rate_limit_reset_time"] = json!(reset);
        }
        status
    }
}

fn enabled_of_kind(providers: &[ProviderEntry], kind: ProviderKind) -> Option<&ProviderEntry> {
    providers
        .iter()
        .filter(|p| p.enabled && p.kind == kind)
        .min_by_key(|p| p.priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::default_providers;

    fn settings_all_enabled() -> RouterSettings {
        let mut settings = RouterSettings::new();
        for provider in &mut settings.providers {
            provider.enabled = true;
            provider.api_key = Some("test-key".to_string());
        }
        settings
    }

    #[test]
    fn test_below_thresholds_no_route() {
        let router = ModelRouter::new(settings_all_enabled());
        let d = router.route("claude-sonnet-4-5", 50.0);

        assert!(!d.should_route);
        assert_eq!(d.provider_kind, ProviderKind::Primary);
        assert_eq!(d.target_model, "claude-sonnet-4-5");
        assert_eq!(d.estimated_savings, 0.0);
    }

    #[test]
    fn test_haiku_threshold() {
        let router = ModelRouter::new(settings_all_enabled());
        let d = router.route("claude-sonnet-4-5", 72.0);

        assert!(d.should_route);
        assert_eq!(d.provider, "anthropic");
        assert_eq!(d.provider_kind, ProviderKind::Primary);
        assert_eq!(d.target_model, "claude-haiku-4-5");
        // 10k in + 10k out: sonnet 0.18 vs haiku 0.048
        assert!((d.estimated_savings - 0.132).abs() < 1e-9);
    }

    #[test]
    fn test_openrouter_threshold() {
        let router = ModelRouter::new(settings_all_enabled());
        let d = router.route("claude-sonnet-4-5", 87.0);

        assert!(d.should_route);
        assert_eq!(d.provider, "openrouter");
        assert_eq!(d.provider_kind, ProviderKind::OpenaiCompatible);
        assert_eq!(d.target_model, "anthropic/claude-sonnet-4.5");
    }

    #[test]
    fn test_local_threshold() {
        let router = ModelRouter::new(settings_all_enabled());
        let d = router.route("claude-sonnet-4-5", 96.0);

        assert!(d.should_route);
        assert_eq!(d.provider, "ollama");
        assert_eq!(d.provider_kind, ProviderKind::LocalChat);
        assert_eq!(d.target_model, "llama3.3");
    }

    #[test]
    fn test_cascade_skips_disabled_providers() {
        let mut settings = settings_all_enabled();
        for provider in &mut settings.providers {
            if provider.kind == ProviderKind::LocalChat {
                provider.enabled = false;
            }
        }
        let router = ModelRouter::new(settings);

        // 96% would prefer local; with local disabled it falls to openrouter
        let d = router.route("claude-sonnet-4-5", 96.0);
        assert_eq!(d.provider, "openrouter");
    }

    #[test]
    fn test_manual_mode_never_routes() {
        let mut settings = settings_all_enabled();
        settings.mode = RouterMode::Manual;
        let router = ModelRouter::new(settings);

        let d = router.route("claude-sonnet-4-5", 99.0);
        assert!(!d.should_route);
        assert_eq!(d.target_model, "claude-sonnet-4-5");
    }

    #[test]
    fn test_disabled_never_routes() {
        let mut settings = settings_all_enabled();
        settings.enabled = false;
        let router = ModelRouter::new(settings);

        let d = router.route("claude-sonnet-4-5", 99.0);
        assert!(!d.should_route);
    }

    #[tokio::test]
    async fn test_rate_limited_avoids_primary() {
        let router = Arc::new(ModelRouter::new(settings_all_enabled()));
        router.record_rate_limit(None);
        assert!(router.is_rate_limited());

        // Even at low usage the primary is skipped
        let d = router.route("claude-sonnet-4-5", 10.0);
        assert!(d.should_route);
        assert_ne!(d.provider_kind, ProviderKind::Primary);
        // openrouter wins on priority over ollama
        assert_eq!(d.provider, "openrouter");
    }

    #[tokio::test]
    async fn test_rate_limited_with_no_fallback() {
        let mut settings = settings_all_enabled();
        for provider in &mut settings.providers {
            if provider.kind != ProviderKind::Primary {
                provider.enabled = false;
            }
        }
        let router = Arc::new(ModelRouter::new(settings));
        router.record_rate_limit(None);

        let d = router.route("claude-sonnet-4-5", 10.0);
        assert!(!d.should_route);
        assert_eq!(d.provider_kind, ProviderKind::Primary);
    }

    #[tokio::test]
    async fn test_rate_limit_clears_after_reset() {
        tokio::time::pause();
        let router = Arc::new(ModelRouter::new(settings_all_enabled()));
        // A reset time already in the past still holds the minimum 60s
        router.record_rate_limit(Some(now_ms() - 1000));
        assert!(router.is_rate_limited());

        // Let the clear task register its sleep, then advance past it
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_millis(61_000)).await;
        tokio::task::yield_now().await;
        assert!(!router.is_rate_limited());
    }

    #[test]
    fn test_update_provider_and_status() {
        let router = ModelRouter::new(RouterSettings::new());
        let mut entry = default_providers().remove(1);
        entry.enabled = true;
        entry.api_key = Some("sk-or".to_string());
        router.update_provider(entry);

        let status = router.get_status();
        assert_eq!(status["enabled"], true);
        let providers = status["providers"].as_array().unwrap();
        let openrouter = providers.iter().find(|p| p["name"] == "openrouter").unwrap();
        assert_eq!(openrouter["has_api_key"], true);
        // Secrets never leave the router
        assert!(status.to_string().find("sk-or").is_none());
    }

    #[test]
    fn test_status_reflects_mode_changes() {
        let router = ModelRouter::new(RouterSettings::new());
        router.set_mode(RouterMode::SemiAuto);
        router.set_enabled(false);

        let status = router.get_status();
        assert_eq!(status["mode"], "semi-auto");
        assert_eq!(status["enabled"], false);
    }
}
