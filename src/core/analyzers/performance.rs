// ConvStream - core/analyzers/performance.rs
//
// Latency and throughput.
//
//   - task latency: first assignment of a task to its first completion after
//     that assignment
//   - response latency: a coordinator-to-worker message to that worker's next
//     worker-to-coordinator message
//   - throughput: completed tasks and events per unit of window time
//   - completion rate: completed / assigned, over tasks assigned in the window

use super::{percentile, AnalysisContext};
use crate::core::model::{AnalysisResult, ConversationEvent, EventType};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const NAME: &str = "performance";

pub fn analyze(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
    if events.is_empty() {
        return Vec::new();
    }

    // Time order within the window; input order is per-file only.
    let mut ordered: Vec<&ConversationEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.timestamp_utc());

    let mut assigned: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    let mut completed: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    let mut pending_request: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    let mut response_latencies: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut completions = 0u64;

    for e in &ordered {
        let ts = e.timestamp_utc();
        match e.event_type {
            EventType::TaskAssignment => {
                if let Some(task) = e.task_id.as_deref() {
                    assigned.entry(task).or_insert(ts);
                }
            }
            EventType::TaskCompleted => {
                completions += 1;
                if let Some(task) = e.task_id.as_deref() {
                    if assigned.contains_key(task) {
                        completed.entry(task).or_insert(ts);
                    }
                }
            }
            EventType::CoordinatorToWorker => {
                if let Some(worker) = e.actor() {
                    pending_request.entry(worker).or_insert(ts);
                }
            }
            EventType::WorkerToCoordinator => {
                if let Some(worker) = e.actor() {
                    if let Some(req) = pending_request.remove(worker) {
                        response_latencies
                            .entry(worker)
                            .or_default()
                            .push(seconds_between(req, ts));
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();

    let mut task_latencies: Vec<f64> = completed
        .iter()
        .filter_map(|(task, done)| assigned.get(task).map(|start| seconds_between(*start, *done)))
        .collect();
    task_latencies.sort_by(f64::total_cmp);
    out.push(ctx.result("task_latency_count", task_latencies.len() as f64, &[]));
    if let Some(max) = task_latencies.last().copied() {
        let mean = task_latencies.iter().sum::<f64>() / task_latencies.len() as f64;
        out.push(ctx.result("task_latency_mean_seconds", mean, &[]));
        if let Some(p50) = percentile(&task_latencies, 0.50) {
            out.push(ctx.result("task_latency_p50_seconds", p50, &[]));
        }
        if let Some(p95) = percentile(&task_latencies, 0.95) {
            out.push(ctx.result("task_latency_p95_seconds", p95, &[]));
        }
        out.push(ctx.result("task_latency_max_seconds", max, &[]));
    }

    for (worker, lat) in &response_latencies {
        let tag = [("worker", *worker)];
        let mean = lat.iter().sum::<f64>() / lat.len() as f64;
        out.push(ctx.result("response_latency_count", lat.len() as f64, &tag));
        out.push(ctx.result("response_latency_mean_seconds", mean, &tag));
    }

    let hours = ctx.window_hours();
    out.push(ctx.result("completed_tasks_per_hour", completions as f64 / hours, &[]));
    out.push(ctx.result(
        "events_per_minute",
        events.len() as f64 / (hours * 60.0),
        &[],
    ));

    if !assigned.is_empty() {
        out.push(ctx.result(
            "task_completion_rate",
            completed.len() as f64 / assigned.len() as f64,
            &[],
        ));
    }

    out
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{day_window, ev};
    use super::*;

    fn get(r: &[AnalysisResult], metric: &str) -> Option<f64> {
        r.iter().find(|x| x.metric_name == metric).map(|x| x.value)
    }

    #[test]
    fn test_task_latency_and_completion_rate() {
        let events = vec![
            ev(1, 0, EventType::TaskAssignment, Some("a1"), Some("T1")),
            ev(2, 10, EventType::TaskCompleted, Some("a1"), Some("T1")),
            ev(3, 20, EventType::TaskAssignment, Some("a2"), Some("T2")),
            ev(4, 50, EventType::TaskCompleted, Some("a2"), Some("T2")),
            ev(5, 60, EventType::TaskAssignment, Some("a3"), Some("T3")),
            // Completion of a task assigned before the window: counted for
            // throughput, no latency.
            ev(6, 61, EventType::TaskCompleted, Some("a4"), Some("T0")),
        ];
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        assert_eq!(get(&r, "task_latency_count"), Some(2.0));
        assert_eq!(get(&r, "task_latency_mean_seconds"), Some(1200.0));
        assert_eq!(get(&r, "task_latency_p50_seconds"), Some(600.0));
        assert_eq!(get(&r, "task_latency_max_seconds"), Some(1800.0));
        let rate = get(&r, "task_completion_rate").unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        let tph = get(&r, "completed_tasks_per_hour").unwrap();
        assert!((tph - 3.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_response_latency_per_worker() {
        let mut req = ev(1, 0, EventType::CoordinatorToWorker, None, None);
        req.worker_id = Some("w1".to_string());
        let mut resp = ev(2, 2, EventType::WorkerToCoordinator, None, None);
        resp.worker_id = Some("w1".to_string());
        // Out of order on input; sorted by time inside the analyzer.
        let events = vec![resp, req];
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        let m = r
            .iter()
            .find(|x| x.metric_name == "response_latency_mean_seconds")
            .unwrap();
        assert_eq!(m.tags["worker"], "w1");
        assert_eq!(m.value, 120.0);
    }

    #[test]
    fn test_event_rate() {
        let events: Vec<_> = (0..48)
            .map(|i| ev(i as u64 + 1, i * 30, EventType::ProgressUpdate, Some("a"), None))
            .collect();
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        let rate = get(&r, "events_per_minute").unwrap();
        assert!((rate - 48.0 / 1440.0).abs() < 1e-9);
        assert!(get(&r, "task_completion_rate").is_none());
    }
}
