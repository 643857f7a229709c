// ConvStream - app/detector.rs
//
// Anomaly detector: keeps a bounded history per metric series and evaluates
// each fresh analysis result with the z-score and moving-average-ratio
// methods from core::anomaly.
//
// A series is the metric name plus its sorted tags. The observation time of a
// result is the end of its analysis window. Observations are folded into
// SERIES_BUCKET_SECS buckets and each bucket's mean is one history point, so
// the day-based windows cover their full span whatever the analysis cadence.
// A result is evaluated against completed buckets only. Buckets older than
// the longest configured window are dropped, and each series is capped at
// MAX_SERIES_BUCKETS.

#![allow(clippy::cast_precision_loss)]

use crate::core::anomaly::{self, AnomalyConfig, Detection};
use crate::core::model::{AnalysisResult, AnomalyRecord, DetectionMethod};
use crate::util::constants::{MAX_SERIES_BUCKETS, SERIES_BUCKET_SECS};
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: DateTime<Utc>,
    sum: f64,
    count: u32,
}

impl Bucket {
    fn mean(&self) -> f64 {
        self.sum / f64::from(self.count.max(1))
    }
}

#[derive(Debug, Default)]
struct Series {
    /// Buckets in start order.
    buckets: VecDeque<Bucket>,
    /// Latest observation folded in.
    last_observed: Option<DateTime<Utc>>,
}

fn bucket_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::seconds(SERIES_BUCKET_SECS))
        .unwrap_or(t)
}

impl Series {
    /// Means of the buckets starting after `since`, excluding the bucket that
    /// starts at `current`.
    fn means_since(&self, since: DateTime<Utc>, current: DateTime<Utc>) -> Vec<f64> {
        self.buckets
            .iter()
            .filter(|b| b.start > since && b.start < current)
            .map(Bucket::mean)
            .collect()
    }

    fn record(&mut self, observed_at: DateTime<Utc>, value: f64) {
        let start = bucket_start(observed_at);
        match self.buckets.back_mut() {
            Some(b) if b.start == start => {
                b.sum += value;
                b.count += 1;
            }
            _ => self.buckets.push_back(Bucket {
                start,
                sum: value,
                count: 1,
            }),
        }
        self.last_observed = Some(observed_at);
    }

    fn prune(&mut self, keep_after: DateTime<Utc>) {
        while self.buckets.front().is_some_and(|b| b.start <= keep_after) {
            self.buckets.pop_front();
        }
        while self.buckets.len() > MAX_SERIES_BUCKETS {
            self.buckets.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    series: Mutex<BTreeMap<String, Series>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            series: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Number of series with history.
    pub fn series_count(&self) -> usize {
        self.series.lock().map_or(0, |s| s.len())
    }

    /// Evaluate `results` against their series history, then record them.
    ///
    /// Returns one record per triggering evaluation. A result whose
    /// observation time is not after the latest recorded point of its series
    /// is ignored, so re-observing the same window never double counts.
    pub fn observe(&self, results: &[AnalysisResult]) -> Vec<AnomalyRecord> {
        let mut all = self.series.lock().unwrap_or_else(|p| p.into_inner());
        let mut records = Vec::new();

        for result in results {
            let observed_at = result.window.end;
            let value = result.value;
            if !value.is_finite() {
                continue;
            }
            let series = all.entry(result.series_key()).or_default();
            if series.last_observed.is_some_and(|t| t >= observed_at) {
                continue;
            }
            let current = bucket_start(observed_at);

            let history = series.means_since(
                observed_at - Duration::days(self.config.history_days),
                current,
            );
            if let Some(d) = anomaly::z_score(&history, value, &self.config) {
                records.push(record(result, DetectionMethod::ZScore, d, observed_at));
            }

            let long_hist = series.means_since(
                observed_at - Duration::days(self.config.long_window_days),
                current,
            );
            if long_hist.len() >= self.config.min_samples.max(1) {
                let mut short = series.means_since(
                    observed_at - Duration::days(self.config.short_window_days),
                    current,
                );
                short.push(value);
                let mut long = long_hist;
                long.push(value);
                if let (Some(s), Some(l)) = (anomaly::average(&short), anomaly::average(&long)) {
                    if let Some(d) = anomaly::moving_average_ratio(s, l, &self.config) {
                        records.push(record(
                            result,
                            DetectionMethod::MovingAverageRatio,
                            d,
                            observed_at,
                        ));
                    }
                }
            }

            series.record(observed_at, value);
            let horizon = self.config.history_days.max(self.config.long_window_days);
            series.prune(observed_at - Duration::days(horizon));
        }

        for r in &records {
            tracing::warn!(
                metric = %r.metric_name,
                method = r.method.as_str(),
                severity = r.severity.label(),
                observed = r.observed_value,
                score = r.score,
                "Anomaly detected"
            );
        }
        records
    }
}

fn record(
    result: &AnalysisResult,
    method: DetectionMethod,
    detection: Detection,
    observed_at: DateTime<Utc>,
) -> AnomalyRecord {
    AnomalyRecord {
        metric_name: result.metric_name.clone(),
        tags: result.tags.clone(),
        severity: detection.severity,
        observed_value: result.value,
        expected_range: detection.expected_range,
        method,
        score: detection.score,
        detected_at: observed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AnomalySeverity, TimeWindow};
    use chrono::TimeZone;

    fn result_at(day: i64, value: f64) -> AnalysisResult {
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        AnalysisResult {
            analyzer_name: "statistical".to_string(),
            metric_name: "total_events".to_string(),
            value,
            tags: BTreeMap::new(),
            window: TimeWindow::trailing(end, 24),
            computed_at: end,
        }
    }

    fn feed(det: &AnomalyDetector, values: &[f64]) -> Vec<AnomalyRecord> {
        values
            .iter()
            .enumerate()
            .flat_map(|(i, v)| det.observe(&[result_at(i as i64, *v)]))
            .collect()
    }

    #[test]
    fn test_spike_is_z_score_anomaly() {
        let det = AnomalyDetector::new(AnomalyConfig::default());
        // mean 100, population sigma 10
        let mut values: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 90.0 } else { 110.0 }).collect();
        assert!(feed(&det, &values).is_empty());

        values.push(145.0);
        let records: Vec<_> = feed(&AnomalyDetector::new(AnomalyConfig::default()), &values)
            .into_iter()
            .filter(|r| r.method == DetectionMethod::ZScore)
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, AnomalySeverity::High);
        assert_eq!(records[0].observed_value, 145.0);
    }

    #[test]
    fn test_within_band_is_quiet() {
        let det = AnomalyDetector::new(AnomalyConfig::default());
        let mut values: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 90.0 } else { 110.0 }).collect();
        values.push(118.0);
        assert!(feed(&det, &values)
            .iter()
            .all(|r| r.method != DetectionMethod::ZScore));
    }

    #[test]
    fn test_sustained_decline_is_moving_average_anomaly() {
        let det = AnomalyDetector::new(AnomalyConfig::default());
        let mut values = vec![10.0; 23];
        values.extend(vec![1.0; 7]);
        let records = feed(&det, &values);
        assert!(records
            .iter()
            .any(|r| r.method == DetectionMethod::MovingAverageRatio));
        assert_eq!(det.series_count(), 1);
    }

    #[test]
    fn test_same_window_is_not_double_counted() {
        let det = AnomalyDetector::new(AnomalyConfig::default());
        det.observe(&[result_at(0, 1.0)]);
        det.observe(&[result_at(0, 500.0)]);
        let series = det.series.lock().unwrap();
        assert_eq!(series["total_events"].buckets.len(), 1);
        assert_eq!(series["total_events"].buckets[0].count, 1);
    }

    /// Minute-by-minute observations still fill the full day-based windows:
    /// twelve days at 10 then seven at 1 is a decline of the 7-day average
    /// against the 30-day one.
    #[test]
    fn test_decline_detected_at_analysis_loop_cadence() {
        let det = AnomalyDetector::new(AnomalyConfig::default());
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let cadence = Duration::seconds(crate::util::constants::DEFAULT_ANALYSIS_INTERVAL_SECS as i64);
        let per_day = 86_400 / crate::util::constants::DEFAULT_ANALYSIS_INTERVAL_SECS as i64;

        let mut last = Vec::new();
        for i in 0..per_day * 19 {
            let value = if i < per_day * 12 { 10.0 } else { 1.0 };
            let end = start + cadence * (i as i32 + 1);
            let result = AnalysisResult {
                analyzer_name: "statistical".to_string(),
                metric_name: "total_events".to_string(),
                value,
                tags: BTreeMap::new(),
                window: TimeWindow::trailing(end, 24),
                computed_at: end,
            };
            last = det.observe(&[result]);
        }

        let series = det.series.lock().unwrap();
        let kept = &series["total_events"].buckets;
        let span = kept.back().unwrap().start - kept.front().unwrap().start;
        assert!(span >= Duration::days(18), "history span {span}");
        drop(series);

        let decline = last
            .iter()
            .find(|r| r.method == DetectionMethod::MovingAverageRatio)
            .expect("decline flagged on the final observation");
        assert_eq!(decline.severity, AnomalySeverity::High);
        assert!(decline.score < 0.25, "ratio {}", decline.score);
    }
}
