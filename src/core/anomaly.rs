// ConvStream - core/anomaly.rs
//
// Pure statistical detection functions. No state and no I/O: the app-layer
// detector owns the per-series history and calls into these.

// Counts and rates only; f64 precision is ample.
#![allow(clippy::cast_precision_loss)]

use crate::core::model::{AnomalySeverity, ExpectedRange};
use crate::util::constants;

/// Thresholds for both detection methods.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyConfig {
    /// |z| strictly above this is anomalous (medium).
    pub z_threshold: f64,
    /// |z| strictly above this is high severity.
    pub z_high_threshold: f64,
    /// Rolling history window for z-score statistics (days).
    pub history_days: i64,
    /// Short moving-average window (days).
    pub short_window_days: i64,
    /// Long moving-average window (days).
    pub long_window_days: i64,
    /// Short/long ratio below which a decline is reported.
    pub decline_ratio: f64,
    /// History points required before a metric is evaluated.
    pub min_samples: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_threshold: constants::DEFAULT_Z_THRESHOLD,
            z_high_threshold: constants::DEFAULT_Z_HIGH_THRESHOLD,
            history_days: constants::DEFAULT_HISTORY_DAYS,
            short_window_days: constants::DEFAULT_SHORT_WINDOW_DAYS,
            long_window_days: constants::DEFAULT_LONG_WINDOW_DAYS,
            decline_ratio: constants::DEFAULT_DECLINE_RATIO,
            min_samples: constants::DEFAULT_MIN_SAMPLES,
        }
    }
}

/// Outcome of a triggering evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub severity: AnomalySeverity,
    pub score: f64,
    pub expected_range: ExpectedRange,
}

/// Mean and population standard deviation. `None` for an empty slice.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Evaluate `observed` against `history` (prior observations, not including
/// `observed`).
///
/// Never fires when the history is shorter than `min_samples` or has zero
/// spread.
pub fn z_score(history: &[f64], observed: f64, config: &AnomalyConfig) -> Option<Detection> {
    if history.len() < config.min_samples.max(1) || !observed.is_finite() {
        return None;
    }
    let (mean, std) = mean_and_std(history)?;
    if std <= f64::EPSILON {
        return None;
    }
    let z = (observed - mean) / std;
    let magnitude = z.abs();
    if magnitude <= config.z_threshold {
        return None;
    }
    let severity = if magnitude > config.z_high_threshold {
        AnomalySeverity::High
    } else {
        AnomalySeverity::Medium
    };
    Some(Detection {
        severity,
        score: z,
        expected_range: ExpectedRange {
            low: mean - config.z_threshold * std,
            high: mean + config.z_threshold * std,
        },
    })
}

/// Compare the short-window average against the long-window average.
///
/// A ratio below `decline_ratio` is a decline. Severity is `high` below half
/// the threshold, `medium` below three quarters of it, otherwise `low`.
/// A non-positive long average has no meaningful ratio and never fires.
pub fn moving_average_ratio(
    short_avg: f64,
    long_avg: f64,
    config: &AnomalyConfig,
) -> Option<Detection> {
    if !short_avg.is_finite() || !long_avg.is_finite() || long_avg <= 0.0 {
        return None;
    }
    let ratio = short_avg / long_avg;
    let threshold = config.decline_ratio;
    if ratio >= threshold {
        return None;
    }
    let severity = if ratio < threshold * 0.5 {
        AnomalySeverity::High
    } else if ratio < threshold * 0.75 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    };
    Some(Detection {
        severity,
        score: ratio,
        expected_range: ExpectedRange {
            low: long_avg * threshold,
            high: f64::INFINITY,
        },
    })
}

/// Arithmetic mean; `None` for an empty slice.
pub fn average(values: &[f64]) -> Option<f64> {
    mean_and_std(values).map(|(m, _)| m)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 30 alternating points: mean 10, population σ exactly 1.
    fn unit_history() -> Vec<f64> {
        (0..30).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect()
    }

    #[test]
    fn test_mean_and_std() {
        let (m, s) = mean_and_std(&unit_history()).unwrap();
        assert!((m - 10.0).abs() < 1e-9);
        assert!((s - 1.0).abs() < 1e-9);
        assert!(mean_and_std(&[]).is_none());
    }

    #[test]
    fn test_within_two_sigma_is_quiet() {
        let cfg = AnomalyConfig::default();
        let h = unit_history();
        for v in [8.0, 9.5, 10.0, 11.9, 12.0] {
            assert!(z_score(&h, v, &cfg).is_none(), "{v} should not fire");
        }
    }

    #[test]
    fn test_three_and_a_half_sigma_is_medium() {
        let d = z_score(&unit_history(), 13.5, &AnomalyConfig::default()).unwrap();
        assert_eq!(d.severity, AnomalySeverity::Medium);
        assert!((d.score - 3.5).abs() < 1e-9);
        assert!((d.expected_range.low - 7.0).abs() < 1e-9);
        assert!((d.expected_range.high - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_four_and_a_half_sigma_is_high() {
        let d = z_score(&unit_history(), 14.5, &AnomalyConfig::default()).unwrap();
        assert_eq!(d.severity, AnomalySeverity::High);
    }

    #[test]
    fn test_negative_deviation_detected() {
        let d = z_score(&unit_history(), 6.5, &AnomalyConfig::default()).unwrap();
        assert_eq!(d.severity, AnomalySeverity::Medium);
        assert!(d.score < 0.0);
    }

    #[test]
    fn test_exactly_three_sigma_is_not_anomalous() {
        assert!(z_score(&unit_history(), 13.0, &AnomalyConfig::default()).is_none());
    }

    #[test]
    fn test_zero_sigma_never_fires() {
        let flat = vec![5.0; 30];
        assert!(z_score(&flat, 500.0, &AnomalyConfig::default()).is_none());
    }

    #[test]
    fn test_short_history_never_fires() {
        assert!(z_score(&[1.0, 2.0], 100.0, &AnomalyConfig::default()).is_none());
    }

    #[test]
    fn test_moving_average_decline() {
        let cfg = AnomalyConfig::default();
        let d = moving_average_ratio(2.0, 5.0, &cfg).unwrap();
        assert!((d.score - 0.4).abs() < 1e-9);
        assert_eq!(d.severity, AnomalySeverity::Low);
        assert!(moving_average_ratio(4.5, 5.0, &cfg).is_none());
    }

    #[test]
    fn test_moving_average_severity_bands() {
        let cfg = AnomalyConfig::default();
        assert_eq!(
            moving_average_ratio(1.0, 5.0, &cfg).unwrap().severity,
            AnomalySeverity::High
        );
        assert_eq!(
            moving_average_ratio(1.5, 5.0, &cfg).unwrap().severity,
            AnomalySeverity::Medium
        );
    }

    #[test]
    fn test_moving_average_zero_baseline() {
        assert!(moving_average_ratio(0.0, 0.0, &AnomalyConfig::default()).is_none());
    }
}
