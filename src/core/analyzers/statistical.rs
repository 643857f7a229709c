// ConvStream - core/analyzers/statistical.rs
//
// Volume and composition of the event stream: totals, counts by type and by
// agent, decision confidence and blocker severity.

use super::AnalysisContext;
use crate::core::model::{AnalysisResult, ConversationEvent, EventType};
use crate::util::constants::{HIGH_CONFIDENCE, MEDIUM_CONFIDENCE};
use std::collections::{BTreeMap, BTreeSet};

pub const NAME: &str = "statistical";

pub fn analyze(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut by_type: BTreeMap<&str, u64> = BTreeMap::new();
    let mut by_agent: BTreeMap<&str, u64> = BTreeMap::new();
    let mut agents: BTreeSet<&str> = BTreeSet::new();
    let mut blockers_by_severity: BTreeMap<String, u64> = BTreeMap::new();
    let mut confidences: Vec<f64> = Vec::new();
    let (mut decisions, mut blockers, mut completions) = (0u64, 0u64, 0u64);

    for e in events {
        *by_type.entry(e.event_type.as_str()).or_default() += 1;
        if let Some(actor) = e.actor() {
            *by_agent.entry(actor).or_default() += 1;
            agents.insert(actor);
        }
        match e.event_type {
            EventType::CoordinatorDecision => {
                decisions += 1;
                if let Some(c) = e.metadata_f64("confidence").filter(|c| c.is_finite()) {
                    confidences.push(c);
                }
            }
            EventType::Blocker => {
                blockers += 1;
                let severity = e
                    .metadata_str("severity")
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_else(|| "unknown".to_string());
                *blockers_by_severity.entry(severity).or_default() += 1;
            }
            EventType::TaskCompleted => completions += 1,
            _ => {}
        }
    }

    let mut out = vec![
        ctx.result("total_events", events.len() as f64, &[]),
        ctx.result("unique_agents", agents.len() as f64, &[]),
        ctx.result("decision_count", decisions as f64, &[]),
        ctx.result("blocker_count", blockers as f64, &[]),
        ctx.result("completion_count", completions as f64, &[]),
    ];
    for (t, n) in &by_type {
        out.push(ctx.result("events_by_type", *n as f64, &[("type", *t)]));
    }
    for (a, n) in &by_agent {
        out.push(ctx.result("events_by_agent", *n as f64, &[("agent", *a)]));
    }
    for (s, n) in &blockers_by_severity {
        out.push(ctx.result("blockers_by_severity", *n as f64, &[("severity", s.as_str())]));
    }

    if !confidences.is_empty() {
        let avg = confidences.iter().sum::<f64>() / confidences.len() as f64;
        out.push(ctx.result("avg_decision_confidence", avg, &[]));
        let high = confidences.iter().filter(|c| **c >= HIGH_CONFIDENCE).count();
        let medium = confidences
            .iter()
            .filter(|c| **c >= MEDIUM_CONFIDENCE && **c < HIGH_CONFIDENCE)
            .count();
        let low = confidences.len() - high - medium;
        for (band, n) in [("high", high), ("medium", medium), ("low", low)] {
            out.push(ctx.result("decision_confidence", n as f64, &[("band", band)]));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{day_window, ev, with_meta};
    use super::*;
    use serde_json::json;

    fn value(results: &[AnalysisResult], metric: &str, tag: Option<(&str, &str)>) -> Option<f64> {
        results
            .iter()
            .find(|r| {
                r.metric_name == metric
                    && match tag {
                        Some((k, v)) => r.tags.get(k).map(String::as_str) == Some(v),
                        None => r.tags.is_empty(),
                    }
            })
            .map(|r| r.value)
    }

    #[test]
    fn test_counts() {
        let events = vec![
            ev(1, 0, EventType::TaskAssignment, Some("a1"), Some("T1")),
            ev(2, 5, EventType::Blocker, Some("a2"), Some("T2")),
            with_meta(
                ev(3, 6, EventType::Blocker, Some("a2"), Some("T2")),
                "severity",
                json!("HIGH"),
            ),
            ev(4, 9, EventType::TaskCompleted, Some("a1"), Some("T1")),
        ];
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        assert_eq!(value(&r, "total_events", None), Some(4.0));
        assert_eq!(value(&r, "unique_agents", None), Some(2.0));
        assert_eq!(value(&r, "blocker_count", None), Some(2.0));
        assert_eq!(value(&r, "completion_count", None), Some(1.0));
        assert_eq!(value(&r, "events_by_type", Some(("type", "blocker"))), Some(2.0));
        assert_eq!(value(&r, "events_by_agent", Some(("agent", "a1"))), Some(2.0));
        assert_eq!(
            value(&r, "blockers_by_severity", Some(("severity", "high"))),
            Some(1.0)
        );
        assert_eq!(
            value(&r, "blockers_by_severity", Some(("severity", "unknown"))),
            Some(1.0)
        );
        assert!(r.iter().all(|x| x.analyzer_name == NAME));
    }

    #[test]
    fn test_decision_confidence_distribution() {
        let events = vec![
            with_meta(ev(1, 0, EventType::CoordinatorDecision, None, None), "confidence", json!(0.9)),
            with_meta(ev(2, 1, EventType::CoordinatorDecision, None, None), "confidence", json!(0.6)),
            with_meta(ev(3, 2, EventType::CoordinatorDecision, None, None), "confidence", json!("0.3")),
            ev(4, 3, EventType::CoordinatorDecision, None, None),
        ];
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);
        assert_eq!(value(&r, "decision_count", None), Some(4.0));
        let avg = value(&r, "avg_decision_confidence", None).unwrap();
        assert!((avg - 0.6).abs() < 1e-9);
        for band in ["high", "medium", "low"] {
            assert_eq!(value(&r, "decision_confidence", Some(("band", band))), Some(1.0));
        }
    }
}
