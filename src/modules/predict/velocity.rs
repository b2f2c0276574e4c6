//! Consumption velocity — windowed token rate, trend buckets and pattern.

use serde::{Deserialize, Serialize};

use crate::modules::infra::database::UsageLog;

pub const TREND_BUCKETS: usize = 12;

/// Shape of recent consumption.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsagePattern {
    Burst,
    Steady,
    Declining,
}

impl std::fmt::Display for UsagePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsagePattern::Burst => write!(f, "burst"),
            UsagePattern::Steady => write!(f, "steady"),
            UsagePattern::Declining => write!(f, "declining"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityStats {
    pub tokens_per_minute: f64,
    pub tokens_per_hour: f64,
    /// Token volume over the window split into 12 equal intervals
    pub trend: Vec<f64>,
    /// Change of the change across the last three buckets
    pub acceleration: f64,
    pub pattern: UsagePattern,
}

impl VelocityStats {
    fn empty() -> Self {
        Self {
            tokens_per_minute: 0.0,
            tokens_per_hour: 0.0,
            trend: vec![0.0; TREND_BUCKETS],
            acceleration: 0.0,
            pattern: UsagePattern::Steady,
        }
    }
}

/// Compute velocity stats over logs covering a `window_minutes` window.
pub fn compute_velocity(logs: &[UsageLog], window_minutes: f64) -> VelocityStats {
    if logs.is_empty() || window_minutes <= 0.0 {
        return VelocityStats::empty();
    }

    let total_tokens: i64 = logs.iter().map(|l| l.input_tokens + l.output_tokens).sum();
    let tokens_per_minute = total_tokens as f64 / window_minutes;
    let tokens_per_hour = tokens_per_minute * 60.0;

    let (trend, buckets_with_data) = bucket_trend(logs, total_tokens);

    let acceleration = if buckets_with_data < 3 {
        0.0
    } else {
        let n = TREND_BUCKETS;
        (trend[n - 1] - trend[n - 2]) - (trend[n - 2] - trend[n - 3])
    };

    let mean = trend.iter().sum::<f64>() / TREND_BUCKETS as f64;
    let variance = trend.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / TREND_BUCKETS as f64;
    let stddev = variance.sqrt();

    let pattern = if stddev > mean * 0.5 {
        UsagePattern::Burst
    } else if acceleration < -mean * 0.2 {
        UsagePattern::Declining
    } else {
        UsagePattern::Steady
    };

    VelocityStats {
        tokens_per_minute,
        tokens_per_hour,
        trend,
        acceleration,
        pattern,
    }
}

/// Split the [oldest, newest] time range into 12 equal intervals and sum each
/// log's tokens into its interval. A zero-span range spreads the mean evenly.
fn bucket_trend(logs: &[UsageLog], total_tokens: i64) -> (Vec<f64>, usize) {
    let oldest = logs.iter().map(|l| l.timestamp).min().unwrap_or(0);
    let newest = logs.iter().map(|l| l.timestamp).max().unwrap_or(0);

    if newest == oldest {
        let mean = total_tokens as f64 / logs.len() as f64;
        return (vec![mean; TREND_BUCKETS], TREND_BUCKETS);
    }

    let bucket_size = (newest - oldest) as f64 / TREND_BUCKETS as f64;
    let mut trend = vec![0.0; TREND_BUCKETS];
    let mut counts = [0usize; TREND_BUCKETS];

    for log in logs {
        let idx = (((log.timestamp - oldest) as f64 / bucket_size) as usize).min(TREND_BUCKETS - 1);
        trend[idx] += (log.input_tokens + log.output_tokens) as f64;
        counts[idx] += 1;
    }

    let buckets_with_data = counts.iter().filter(|&&c| c > 0).count();
    (trend, buckets_with_data)
}

/// Project tokens consumed over the next `minutes_ahead` minutes.
pub fn project_usage(stats: &VelocityStats, minutes_ahead: f64) -> f64 {
    match stats.pattern {
        UsagePattern::Declining => {
            let decay = (1.0 - 0.1 * minutes_ahead / 60.0).max(0.0);
            stats.tokens_per_minute * minutes_ahead * decay
        }
        UsagePattern::Burst => stats.tokens_per_minute * minutes_ahead * 1.2,
        UsagePattern::Steady => {
            (stats.tokens_per_minute + stats.acceleration / 2.0 * minutes_ahead / 60.0) * minutes_ahead
        }
    }
}
