// ConvStream - core/analyzers/temporal.rs
//
// Shape of activity over time: hourly and daily histograms, the busiest hour
// of day, bursts and lulls.
//
// Hourly buckets cover the active span (first to last event hour) including
// empty hours. A burst is a bucket whose count exceeds mean + BURST_SIGMA
// standard deviations of all buckets in the span; a lull is an empty bucket
// inside the span.

use super::AnalysisContext;
use crate::core::anomaly::mean_and_std;
use crate::core::model::{AnalysisResult, ConversationEvent};
use crate::util::constants::BURST_SIGMA;
use chrono::{DateTime, Timelike, Utc};
use std::collections::BTreeMap;

pub const NAME: &str = "temporal";

const SECS_PER_HOUR: i64 = 3_600;

pub fn analyze(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut hourly: BTreeMap<i64, u64> = BTreeMap::new();
    let mut daily: BTreeMap<String, u64> = BTreeMap::new();
    let mut hour_of_day = [0u64; 24];

    for e in events {
        let ts = e.timestamp_utc();
        *hourly
            .entry(ts.timestamp().div_euclid(SECS_PER_HOUR))
            .or_default() += 1;
        *daily
            .entry(ts.format("%Y-%m-%d").to_string())
            .or_default() += 1;
        hour_of_day[ts.hour() as usize] += 1;
    }

    let (Some(&first), Some(&last)) = (hourly.keys().next(), hourly.keys().next_back()) else {
        return Vec::new();
    };
    let span: Vec<(i64, u64)> = (first..=last)
        .map(|h| (h, hourly.get(&h).copied().unwrap_or(0)))
        .collect();
    let counts: Vec<f64> = span.iter().map(|(_, n)| *n as f64).collect();
    let Some((mean, std)) = mean_and_std(&counts) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (h, n) in &span {
        out.push(ctx.result("events_per_hour", *n as f64, &[("hour", hour_label(*h).as_str())]));
    }
    for (d, n) in &daily {
        out.push(ctx.result("events_per_day", *n as f64, &[("day", d.as_str())]));
    }

    // Earliest hour wins ties.
    let (peak_hour, peak_count) = hour_of_day
        .iter()
        .enumerate()
        .fold((0usize, 0u64), |best, (h, n)| if *n > best.1 { (h, *n) } else { best });
    out.push(ctx.result("peak_hour", peak_hour as f64, &[]));
    out.push(ctx.result("peak_hour_events", peak_count as f64, &[]));
    out.push(ctx.result("hourly_mean", mean, &[]));
    out.push(ctx.result("hourly_stddev", std, &[]));

    let burst_floor = mean + BURST_SIGMA * std;
    let bursts: Vec<&(i64, u64)> = span
        .iter()
        .filter(|(_, n)| std > 0.0 && *n as f64 > burst_floor)
        .collect();
    let lulls: Vec<&(i64, u64)> = span.iter().filter(|(_, n)| *n == 0).collect();

    out.push(ctx.result("burst_hours", bursts.len() as f64, &[]));
    for (h, n) in bursts {
        out.push(ctx.result("burst", *n as f64, &[("hour", hour_label(*h).as_str())]));
    }
    out.push(ctx.result("lull_hours", lulls.len() as f64, &[]));
    for (h, _) in lulls {
        out.push(ctx.result("lull", 0.0, &[("hour", hour_label(*h).as_str())]));
    }

    out
}

/// RFC 3339 start of the hour bucket.
fn hour_label(hour_index: i64) -> String {
    DateTime::<Utc>::from_timestamp(hour_index * SECS_PER_HOUR, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| hour_index.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{day_window, ev};
    use super::*;
    use crate::core::model::EventType;

    fn find<'a>(r: &'a [AnalysisResult], metric: &str) -> Vec<&'a AnalysisResult> {
        r.iter().filter(|x| x.metric_name == metric).collect()
    }

    /// One event per hour for hours 0..9, hour 5 empty, 20 events in hour 9.
    fn bursty() -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        let mut line = 0;
        for h in 0..9i64 {
            if h == 5 {
                continue;
            }
            line += 1;
            events.push(ev(line, h * 60 + 10, EventType::ProgressUpdate, Some("a"), None));
        }
        for m in 0..20 {
            line += 1;
            events.push(ev(line, 9 * 60 + m, EventType::ProgressUpdate, Some("a"), None));
        }
        events
    }

    #[test]
    fn test_histograms_cover_active_span() {
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&bursty(), &ctx);
        let hours = find(&r, "events_per_hour");
        assert_eq!(hours.len(), 10);
        assert_eq!(hours[0].tags["hour"], "2025-01-15T00:00:00+00:00");
        assert_eq!(hours[5].value, 0.0);
        let days = find(&r, "events_per_day");
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].value, 28.0);
    }

    #[test]
    fn test_peak_burst_and_lull() {
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&bursty(), &ctx);
        assert_eq!(find(&r, "peak_hour")[0].value, 9.0);
        assert_eq!(find(&r, "peak_hour_events")[0].value, 20.0);
        assert_eq!(find(&r, "burst_hours")[0].value, 1.0);
        assert_eq!(find(&r, "burst")[0].tags["hour"], "2025-01-15T09:00:00+00:00");
        assert_eq!(find(&r, "lull_hours")[0].value, 1.0);
        assert_eq!(find(&r, "lull")[0].tags["hour"], "2025-01-15T05:00:00+00:00");
    }

    #[test]
    fn test_flat_activity_has_no_bursts() {
        let events: Vec<_> = (0..4)
            .map(|h| ev(h as u64 + 1, h * 60, EventType::Blocker, None, None))
            .collect();
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        assert_eq!(find(&r, "burst_hours")[0].value, 0.0);
        assert_eq!(find(&r, "lull_hours")[0].value, 0.0);
    }
}
