//! Limit Learner — learns per-model quota ceilings from observed rejections.
//!
//! The in-memory map is transient; it is rebuilt from the ledger's persisted
//! rate-limit events at startup, so losing it costs nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::modules::infra::database::{Ledger, NewRateLimitEvent, RateLimitEvent};

/// Tokens actually observed before a rejection overshoot the usable budget,
/// so learned ceilings are scaled down by this factor.
const SAFETY_FACTOR: f64 = 0.95;

/// How far back to replay persisted events on construction.
const BOOTSTRAP_DAYS: f64 = 30.0;

/// Learned (or default) quota ceiling for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedLimit {
    pub model: String,
    pub token_limit: i64,
    pub window_hours: i64,
    /// 0-100; 20 points per contributing event
    pub confidence: i64,
    pub last_updated: i64,
    pub data_points: i64,
}

/// Built-in ceilings used until a model has observed rejections.
fn default_limit(model: &str) -> LearnedLimit {
    let m = model.to_lowercase();
    let token_limit = if m.contains("haiku") {
        10_000_000
    } else if m.contains("opus") {
        2_000_000
    } else {
        // Sonnet-class default, also used for unknown families
        5_000_000
    };

    LearnedLimit {
        model: model.to_string(),
        token_limit,
        window_hours: 5,
        confidence: 0,
        last_updated: 0,
        data_points: 0,
    }
}

pub struct LimitLearner {
    ledger: Arc<Ledger>,
    limits: Mutex<HashMap<String, LearnedLimit>>,
}

impl LimitLearner {
    /// Build the learner and replay the last 30 days of persisted events.
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let learner = Self {
            ledger,
            limits: Mutex::new(HashMap::new()),
        };

        match learner.ledger.get_rate_limit_window(BOOTSTRAP_DAYS * 24.0) {
            Ok(events) => {
                let count = events.len();
                for event in events {
                    learner.apply_event(&event.model, event.tokens_used_before_limit, event.window_hours, event.timestamp);
                }
                if count > 0 {
                    info!("Limit learner bootstrapped from {} rate-limit events", count);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load rate-limit history: {}", e);
            }
        }

        learner
    }

    /// Running-average update for one observed rejection.
    fn apply_event(&self, model: &str, tokens_before_limit: i64, window_hours: i64, timestamp: i64) {
        let mut limits = self.limits.lock();
        let scaled = tokens_before_limit as f64 * SAFETY_FACTOR;

        let entry = limits
            .entry(model.to_string())
            .or_insert_with(|| LearnedLimit {
                model: model.to_string(),
                token_limit: 0,
                window_hours,
                confidence: 0,
                last_updated: timestamp,
                data_points: 0,
            });

        let points = entry.data_points;
        entry.token_limit = if points == 0 {
            scaled.floor() as i64
        } else {
            ((entry.token_limit as f64 * points as f64 + scaled) / (points + 1) as f64).floor() as i64
        };
        entry.data_points = points + 1;
        entry.confidence = (entry.data_points * 20).min(100);
        entry.window_hours = window_hours;
        entry.last_updated = timestamp;
    }

    /// Persist a rejection through the ledger, then fold it into the map.
    pub fn record_rate_limit(&self, event: NewRateLimitEvent) -> Result<RateLimitEvent, String> {
        let stored = self.ledger.add_rate_limit_event(event)?;
        self.apply_event(
            &stored.model,
            stored.tokens_used_before_limit,
            stored.window_hours,
            stored.timestamp,
        );

        let learned = self.get_learned_limit(&stored.model);
        info!(
            "Learned limit for {}: {} tokens ({} events, confidence {})",
            stored.model, learned.token_limit, learned.data_points, learned.confidence
        );

        Ok(stored)
    }

    /// Learned entry for a model, or the static default when nothing has been
    /// observed yet.
    pub fn get_learned_limit(&self, model: &str) -> LearnedLimit {
        let limits = self.limits.lock();
        limits
            .get(model)
            .cloned()
            .unwrap_or_else(|| default_limit(model))
    }
}
