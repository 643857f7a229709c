// ConvStream - app/health.rs
//
// Health report assembled from tailer status, bus statistics and cache
// statistics. The engine is `Degraded` when any tailed file is degraded, the
// last discovery failed, or parse errors / dead letters reach their alert
// thresholds.

use crate::app::bus::BusStats;
use crate::app::cache::CacheStats;
use crate::app::tail::{FileHealth, TailerStatus};
use crate::util::constants::{DEFAULT_DEAD_LETTER_ALERT, DEFAULT_PARSE_ERROR_ALERT};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Total parse errors at or above which health degrades.
    pub parse_error_alert: u64,
    /// Dead letters on any one subscription at or above which health degrades.
    pub dead_letter_alert: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            parse_error_alert: DEFAULT_PARSE_ERROR_ALERT,
            dead_letter_alert: DEFAULT_DEAD_LETTER_ALERT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterCount {
    pub subscription: u64,
    pub pattern: String,
    pub dead_letters: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Human-readable reasons for a degraded status.
    pub reasons: Vec<String>,
    pub files: Vec<FileHealth>,
    pub parse_errors_total: u64,
    pub events_total: u64,
    pub dead_letters: Vec<DeadLetterCount>,
    pub buffered_events: usize,
    pub evicted_events: u64,
    pub cache: CacheStats,
}

/// Combine component snapshots into one report.
pub fn evaluate(
    tailer: &TailerStatus,
    bus: &BusStats,
    cache: CacheStats,
    thresholds: &HealthThresholds,
) -> HealthReport {
    let mut reasons = Vec::new();

    for f in tailer.files.iter().filter(|f| f.degraded) {
        reasons.push(format!(
            "'{}' degraded after {} consecutive failures{}",
            f.path.display(),
            f.consecutive_failures,
            f.last_error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        ));
    }
    if let Some(e) = &tailer.last_discovery_error {
        reasons.push(format!("discovery failing: {e}"));
    }
    if tailer.parse_errors_total >= thresholds.parse_error_alert {
        reasons.push(format!(
            "{} parse errors (alert at {})",
            tailer.parse_errors_total, thresholds.parse_error_alert
        ));
    }

    let dead_letters: Vec<DeadLetterCount> = bus
        .subscriptions
        .iter()
        .map(|s| DeadLetterCount {
            subscription: s.id,
            pattern: s.pattern.clone(),
            dead_letters: s.dead_letters,
            handler_failures: s.handler_failures,
        })
        .collect();
    for d in dead_letters
        .iter()
        .filter(|d| d.dead_letters >= thresholds.dead_letter_alert)
    {
        reasons.push(format!(
            "subscription {} ({}) dropped {} envelopes",
            d.subscription, d.pattern, d.dead_letters
        ));
    }

    HealthReport {
        status: if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        reasons,
        files: tailer.files.clone(),
        parse_errors_total: tailer.parse_errors_total,
        events_total: tailer.events_total,
        dead_letters,
        buffered_events: bus.buffered,
        evicted_events: bus.evicted,
        cache,
    }
}
