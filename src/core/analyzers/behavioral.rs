// ConvStream - core/analyzers/behavioral.rs
//
// Per-agent behaviour and collaboration.
//
// Two agents collaborate when both produced events carrying the same
// `task_id` inside the window. The pair is reported once, in name order.

use super::AnalysisContext;
use crate::core::model::{AnalysisResult, ConversationEvent, EventType};
use std::collections::{BTreeMap, BTreeSet};

pub const NAME: &str = "behavioral";

#[derive(Default)]
struct AgentActivity<'a> {
    events: u64,
    tasks: BTreeSet<&'a str>,
    blockers: u64,
    progress_reports: u64,
}

pub fn analyze(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
    let mut agents: BTreeMap<&str, AgentActivity<'_>> = BTreeMap::new();
    let mut task_agents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for e in events {
        let Some(actor) = e.actor() else { continue };
        let a = agents.entry(actor).or_default();
        a.events += 1;
        match e.event_type {
            EventType::Blocker => a.blockers += 1,
            EventType::ProgressUpdate => a.progress_reports += 1,
            _ => {}
        }
        if let Some(task) = e.task_id.as_deref() {
            a.tasks.insert(task);
            task_agents.entry(task).or_default().insert(actor);
        }
    }

    if agents.is_empty() {
        return Vec::new();
    }

    let mut pairs: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    let mut collaborators: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for members in task_agents.values() {
        let list: Vec<&str> = members.iter().copied().collect();
        for (i, a) in list.iter().enumerate() {
            for b in &list[i + 1..] {
                *pairs.entry((*a, *b)).or_default() += 1;
                collaborators.entry(*a).or_default().insert(*b);
                collaborators.entry(*b).or_default().insert(*a);
            }
        }
    }

    let mut out = vec![ctx.result("active_agents", agents.len() as f64, &[])];
    for (agent, act) in &agents {
        let tag = [("agent", *agent)];
        out.push(ctx.result("agent_events", act.events as f64, &tag));
        out.push(ctx.result("agent_tasks", act.tasks.len() as f64, &tag));
        out.push(ctx.result("agent_blockers", act.blockers as f64, &tag));
        out.push(ctx.result("agent_progress_reports", act.progress_reports as f64, &tag));
        let n = collaborators.get(agent).map_or(0, BTreeSet::len);
        out.push(ctx.result("agent_collaborators", n as f64, &tag));
    }
    out.push(ctx.result("collaboration_pairs", pairs.len() as f64, &[]));
    for ((a, b), shared) in &pairs {
        let pair = format!("{a}|{b}");
        out.push(ctx.result(
            "shared_tasks",
            *shared as f64,
            &[("pair", pair.as_str())],
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{day_window, ev};
    use super::*;

    fn get(r: &[AnalysisResult], metric: &str, tag: (&str, &str)) -> Option<f64> {
        r.iter()
            .find(|x| x.metric_name == metric && x.tags.get(tag.0).map(String::as_str) == Some(tag.1))
            .map(|x| x.value)
    }

    #[test]
    fn test_agent_activity_and_pairs() {
        let events = vec![
            ev(1, 0, EventType::TaskAssignment, Some("a1"), Some("T1")),
            ev(2, 1, EventType::ProgressUpdate, Some("a1"), Some("T1")),
            ev(3, 2, EventType::Blocker, Some("a2"), Some("T1")),
            ev(4, 3, EventType::ProgressUpdate, Some("a2"), Some("T2")),
            ev(5, 4, EventType::ProgressUpdate, Some("a3"), Some("T2")),
            ev(6, 5, EventType::ProgressUpdate, Some("a3"), None),
            ev(7, 6, EventType::SystemState, None, None),
        ];
        let ctx = AnalysisContext::new(NAME, day_window());
        let r = analyze(&events, &ctx);

        assert_eq!(r[0].metric_name, "active_agents");
        assert_eq!(r[0].value, 3.0);
        assert_eq!(get(&r, "agent_events", ("agent", "a1")), Some(2.0));
        assert_eq!(get(&r, "agent_tasks", ("agent", "a2")), Some(2.0));
        assert_eq!(get(&r, "agent_blockers", ("agent", "a2")), Some(1.0));
        assert_eq!(get(&r, "agent_progress_reports", ("agent", "a3")), Some(2.0));
        assert_eq!(get(&r, "agent_collaborators", ("agent", "a2")), Some(2.0));
        assert_eq!(get(&r, "agent_collaborators", ("agent", "a1")), Some(1.0));
        assert_eq!(get(&r, "shared_tasks", ("pair", "a1|a2")), Some(1.0));
        assert_eq!(get(&r, "shared_tasks", ("pair", "a2|a3")), Some(1.0));
        assert_eq!(get(&r, "shared_tasks", ("pair", "a1|a3")), None);
    }

    #[test]
    fn test_events_without_agents_yield_nothing() {
        let events = vec![ev(1, 0, EventType::SystemState, None, None)];
        let ctx = AnalysisContext::new(NAME, day_window());
        assert!(analyze(&events, &ctx).is_empty());
    }
}
