//! Prediction Engine — combines the ledger window, the learned limit and the
//! consumption velocity into a single forward-looking view.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::modules::infra::database::{Ledger, NewRateLimitEvent, RateLimitEvent};
use crate::modules::predict::learner::{LearnedLimit, LimitLearner};
use crate::modules::predict::velocity::{compute_velocity, UsagePattern, VelocityStats};
use crate::utils::ids::now_ms;

/// Reported in place of an unbounded time-to-limit where external interfaces
/// need a finite number.
pub const UNBOUNDED_MINUTES: f64 = 999.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    SwitchModel,
    SwitchProvider,
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub model: String,
    /// Clamped to [0, 100]
    pub usage_percent: f64,
    pub current_usage: i64,
    pub token_limit: i64,
    pub tokens_remaining: i64,
    /// None when the current velocity is zero
    pub minutes_until_limit: Option<f64>,
    pub estimated_limit_time: Option<i64>,
    pub velocity: VelocityStats,
    pub confidence: i64,
    pub recommended_action: RecommendedAction,
    pub log_count: usize,
}

impl Prediction {
    /// Finite minutes for interface boundaries: 999 when unbounded.
    pub fn minutes_until_limit_or_sentinel(&self) -> f64 {
        self.minutes_until_limit.unwrap_or(UNBOUNDED_MINUTES)
    }
}

pub struct PredictionEngine {
    ledger: Arc<Ledger>,
    learner: Arc<LimitLearner>,
}

impl PredictionEngine {
    pub fn new(ledger: Arc<Ledger>, learner: Arc<LimitLearner>) -> Self {
        Self { ledger, learner }
    }

    /// Predict usage over the provider's rolling window for one model.
    pub fn predict(&self, window_hours: f64, model: &str) -> Result<Prediction, String> {
        let logs = self.ledger.get_window_logs(window_hours)?;
        let learned = self.learner.get_learned_limit(model);

        let current_usage: i64 = logs.iter().map(|l| l.input_tokens + l.output_tokens).sum();
        let velocity = compute_velocity(&logs, window_hours * 60.0);

        let usage_percent = if learned.token_limit > 0 {
            (current_usage as f64 / learned.token_limit as f64 * 100.0).min(100.0)
        } else {
            100.0
        };
        let tokens_remaining = (learned.token_limit - current_usage).max(0);

        let (minutes_until_limit, estimated_limit_time) = if velocity.tokens_per_minute > 0.0 {
            let minutes = tokens_remaining as f64 / velocity.tokens_per_minute;
            (Some(minutes), Some(now_ms() + (minutes * 60_000.0) as i64))
        } else {
            (None, None)
        };

        let confidence = (learned.confidence + (logs.len() as i64 * 2).min(100)) / 2;

        let recommended_action = recommend_action(
            usage_percent,
            minutes_until_limit,
            velocity.pattern,
        );

        Ok(Prediction {
            model: model.to_string(),
            usage_percent,
            current_usage,
            token_limit: learned.token_limit,
            tokens_remaining,
            minutes_until_limit,
            estimated_limit_time,
            velocity,
            confidence,
            recommended_action,
            log_count: logs.len(),
        })
    }

    /// Record an observed quota-rejection: persisted through the ledger, then
    /// learned. The router's sticky flag is the caller's responsibility.
    pub fn record_rate_limit(&self, event: NewRateLimitEvent) -> Result<RateLimitEvent, String> {
        self.learner.record_rate_limit(event)
    }

    pub fn get_learned_limit(&self, model: &str) -> LearnedLimit {
        self.learner.get_learned_limit(model)
    }
}

/// The action cascade. Depends only on usage percent, time-to-limit and the
/// usage pattern.
fn recommend_action(
    usage_percent: f64,
    minutes_until_limit: Option<f64>,
    pattern: UsagePattern,
) -> RecommendedAction {
    let minutes_critical = minutes_until_limit.map(|m| m < 10.0).unwrap_or(false);

    if minutes_critical || usage_percent > 95.0 {
        RecommendedAction::Pause
    } else if usage_percent > 85.0 || (pattern == UsagePattern::Burst && usage_percent > 70.0) {
        RecommendedAction::SwitchProvider
    } else if usage_percent > 70.0 {
        RecommendedAction::SwitchModel
    } else {
        RecommendedAction::Continue
    }
}
