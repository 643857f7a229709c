// ConvStream - core/analyzers/mod.rs
//
// Analyzer registry. Analyzers are plain functions
// `(events, context) -> Vec<AnalysisResult>` registered by name; there is no
// trait hierarchy and no runtime discovery.
//
// Analyzers are pure: they read an immutable slice of events already
// restricted to the analysis window and never perform I/O. Empty input yields
// an empty result set. Panics are contained by the app-layer pipeline.

pub mod behavioral;
pub mod performance;
pub mod statistical;
pub mod temporal;

use crate::core::model::{AnalysisResult, ConversationEvent, TimeWindow};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Signature every analyzer implements.
pub type AnalyzerFn = fn(&[ConversationEvent], &AnalysisContext) -> Vec<AnalysisResult>;

/// Per-run information handed to an analyzer.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub analyzer_name: String,
    pub window: TimeWindow,
    pub computed_at: DateTime<Utc>,
}

impl AnalysisContext {
    pub fn new(analyzer_name: &str, window: TimeWindow) -> Self {
        Self {
            analyzer_name: analyzer_name.to_string(),
            window,
            computed_at: Utc::now(),
        }
    }

    /// Build a result attributed to this run.
    pub fn result(&self, metric_name: &str, value: f64, tags: &[(&str, &str)]) -> AnalysisResult {
        AnalysisResult {
            analyzer_name: self.analyzer_name.clone(),
            metric_name: metric_name.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            window: self.window,
            computed_at: self.computed_at,
        }
    }

    /// Window length in hours, at least one minute's worth.
    pub fn window_hours(&self) -> f64 {
        let secs = (self.window.end - self.window.start).num_seconds().max(60);
        secs as f64 / 3600.0
    }
}

/// Name -> analyzer function table.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<String, AnalyzerFn>,
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry")
            .field("analyzers", &self.analyzers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AnalyzerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the four built-in analyzers.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register(statistical::NAME, statistical::analyze);
        reg.register(temporal::NAME, temporal::analyze);
        reg.register(behavioral::NAME, behavioral::analyze);
        reg.register(performance::NAME, performance::analyze);
        reg
    }

    /// Register (or replace) an analyzer.
    pub fn register(&mut self, name: &str, analyzer: AnalyzerFn) {
        if self.analyzers.insert(name.to_string(), analyzer).is_some() {
            tracing::debug!(analyzer = name, "Analyzer replaced in registry");
        }
    }

    pub fn get(&self, name: &str) -> Option<AnalyzerFn> {
        self.analyzers.get(name).copied()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.analyzers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

/// Nearest-rank percentile of an ascending slice. `p` in `[0, 1]`.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::model::{ConversationEvent, EventKey, EventType, TimeWindow};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::path::PathBuf;

    pub fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    pub fn day_window() -> TimeWindow {
        TimeWindow::new(base(), base() + Duration::hours(24))
    }

    /// Event `minutes` after midnight on the test day.
    pub fn ev(
        line: u64,
        minutes: i64,
        event_type: EventType,
        agent: Option<&str>,
        task: Option<&str>,
    ) -> ConversationEvent {
        ConversationEvent {
            timestamp: (base() + Duration::minutes(minutes)).fixed_offset(),
            event_type,
            agent_id: agent.map(str::to_string),
            worker_id: None,
            task_id: task.map(str::to_string),
            message: String::new(),
            metadata: serde_json::Map::new(),
            key: EventKey {
                file: "test".to_string(),
                generation: 0,
                line,
            },
            source: PathBuf::from("test.jsonl"),
        }
    }

    pub fn with_meta(mut e: ConversationEvent, key: &str, value: serde_json::Value) -> ConversationEvent {
        e.metadata.insert(key.to_string(), value);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_names() {
        let reg = AnalyzerRegistry::with_builtin();
        assert_eq!(
            reg.names(),
            vec!["behavioral", "performance", "statistical", "temporal"]
        );
        assert!(reg.get("statistical").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn test_every_builtin_tolerates_empty_input() {
        let reg = AnalyzerRegistry::with_builtin();
        let ctx = AnalysisContext::new("x", test_support::day_window());
        for name in reg.names() {
            let f = reg.get(&name).unwrap();
            assert!(f(&[], &ctx).is_empty(), "{name} produced output for no events");
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let v: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&v, 0.5), Some(10.0));
        assert_eq!(percentile(&v, 0.95), Some(19.0));
        assert_eq!(percentile(&v, 1.0), Some(20.0));
        assert_eq!(percentile(&[], 0.5), None);
    }
}
