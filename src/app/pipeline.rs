// ConvStream - app/pipeline.rs
//
// Analyzer pipeline: runs registered analyzers over snapshots of the replay
// buffer on a dedicated rayon pool, memoised by (analyzer, filter, window).
//
// - Only the analyzer computation runs inside `pool.install`. Cache lookups and
//   waits on another caller's in-flight computation happen on the calling
//   thread; `run_all` fans out on scoped threads, never on pool workers, so a
//   waiting caller can never hold the worker its leader needs.
// - A panicking analyzer is contained and yields an empty result set; its
//   siblings are unaffected.
// - A report is incomplete when a tailed file is degraded or the replay buffer
//   has evicted events that could fall inside the window.
// - `spawn_analysis_loop` re-runs every analyzer over the trailing window on a
//   fixed interval, publishes fresh results on `analysis.<analyzer>`, and feeds
//   them to the anomaly detector.

use crate::app::bus::EventBus;
use crate::app::cache::{CacheStats, TtlCache};
use crate::app::detector::AnomalyDetector;
use crate::app::tail::TailerStatus;
use crate::core::analyzers::{AnalysisContext, AnalyzerFn, AnalyzerRegistry};
use crate::core::filter::EventFilter;
use crate::core::model::{AnalysisResult, BusPayload, ConversationEvent, TimeWindow};
use crate::util::cancel::CancelToken;
use crate::util::constants::{
    DEFAULT_ANALYSIS_INTERVAL_SECS, DEFAULT_ANALYSIS_WINDOW_HOURS, DEFAULT_ANALYSIS_WORKERS,
    DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_SECS,
};
use crate::util::error::AnalysisError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Period of the analysis loop.
    pub interval: Duration,
    /// Trailing window analysed by the loop.
    pub window_hours: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_ANALYSIS_WORKERS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            interval: Duration::from_secs(DEFAULT_ANALYSIS_INTERVAL_SECS),
            window_hours: DEFAULT_ANALYSIS_WINDOW_HOURS,
        }
    }
}

// =============================================================================
// Keys and reports
// =============================================================================

/// Cache key: analyzer name, filter fingerprint, window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    pub analyzer: String,
    pub filter_hash: u64,
    pub window: TimeWindow,
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}/{}", self.analyzer, self.filter_hash, self.window)
    }
}

/// Results of one analyzer over one window.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub analyzer_name: String,
    pub window: TimeWindow,
    pub results: Arc<Vec<AnalysisResult>>,
    /// False when the input may be missing events (degraded file, evicted
    /// buffer entries).
    pub complete: bool,
    /// True when served from cache rather than computed for this call.
    pub cached: bool,
}

// =============================================================================
// AnalyzerPipeline
// =============================================================================

pub struct AnalyzerPipeline {
    config: PipelineConfig,
    registry: AnalyzerRegistry,
    pool: rayon::ThreadPool,
    cache: TtlCache<AnalysisKey, Arc<Vec<AnalysisResult>>>,
    bus: Arc<EventBus>,
    tailer_status: Arc<RwLock<TailerStatus>>,
}

impl fmt::Debug for AnalyzerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerPipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("workers", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl AnalyzerPipeline {
    pub fn new(
        config: PipelineConfig,
        registry: AnalyzerRegistry,
        bus: Arc<EventBus>,
        tailer_status: Arc<RwLock<TailerStatus>>,
    ) -> Result<Self, AnalysisError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("convstream-analyzer-{i}"))
            .build()
            .map_err(AnalysisError::Pool)?;
        tracing::debug!(
            workers = config.workers,
            analyzers = registry.len(),
            "Analyzer pipeline created"
        );
        Ok(Self {
            cache: TtlCache::new(config.cache_capacity),
            config,
            registry,
            pool,
            bus,
            tailer_status,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn analyzer_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop expired cache entries.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Whether the buffer can be trusted to hold every event in `window`.
    pub fn is_complete(&self, window: &TimeWindow) -> bool {
        let degraded = match self.tailer_status.read() {
            Ok(s) => s.any_degraded(),
            Err(p) => p.into_inner().any_degraded(),
        };
        !degraded && !self.bus.has_evicted_within(window)
    }

    /// Run (or fetch from cache) one analyzer over `window`.
    pub fn analyze(
        &self,
        analyzer_name: &str,
        window: TimeWindow,
        filter: &EventFilter,
    ) -> Result<AnalysisReport, AnalysisError> {
        if !window.is_valid() {
            return Err(AnalysisError::InvalidWindow {
                start: window.start,
                end: window.end,
            });
        }
        let analyzer = self
            .registry
            .get(analyzer_name)
            .ok_or_else(|| AnalysisError::UnknownAnalyzer {
                name: analyzer_name.to_string(),
            })?;

        let key = AnalysisKey {
            analyzer: analyzer_name.to_string(),
            filter_hash: filter.fingerprint(),
            window,
        };

        let mut computed = false;
        let results = self.cache.get_or_compute(key, self.config.cache_ttl, || {
            computed = true;
            let events = self.bus.conversations_in(&window, filter);
            let ctx = AnalysisContext::new(analyzer_name, window);
            let results = self
                .pool
                .install(|| run_isolated(analyzer_name, analyzer, &events, &ctx));
            tracing::debug!(
                analyzer = analyzer_name,
                events = events.len(),
                results = results.len(),
                "Analyzer ran"
            );
            Ok::<_, AnalysisError>(Arc::new(results))
        })?;

        Ok(AnalysisReport {
            analyzer_name: analyzer_name.to_string(),
            window,
            results,
            complete: self.is_complete(&window),
            cached: !computed,
        })
    }

    /// Run every registered analyzer over `window` in parallel.
    ///
    /// One scoped thread per analyzer; each computes on the pool through
    /// `analyze`. Results come back in registry order.
    pub fn run_all(&self, window: TimeWindow, filter: &EventFilter) -> Vec<AnalysisReport> {
        let names = self.registry.names();
        std::thread::scope(|scope| {
            let pending: Vec<_> = names
                .iter()
                .map(|name| {
                    let spawned = std::thread::Builder::new()
                        .name(format!("convstream-run-{name}"))
                        .spawn_scoped(scope, move || self.analyze(name, window, filter));
                    match spawned {
                        Ok(handle) => (name, Some(handle)),
                        Err(e) => {
                            tracing::warn!(analyzer = %name, error = %e, "Spawn failed; running inline");
                            (name, None)
                        }
                    }
                })
                .collect();

            pending
                .into_iter()
                .filter_map(|(name, handle)| {
                    let outcome = match handle {
                        Some(h) => match h.join() {
                            Ok(outcome) => outcome,
                            Err(_) => {
                                tracing::error!(analyzer = %name, "Analysis thread panicked");
                                return None;
                            }
                        },
                        None => self.analyze(name, window, filter),
                    };
                    match outcome {
                        Ok(report) => Some(report),
                        Err(e) => {
                            tracing::warn!(analyzer = %name, error = %e, "Analysis failed");
                            None
                        }
                    }
                })
                .collect()
        })
    }
}

/// Run an analyzer, converting a panic into an empty result set.
fn run_isolated(
    name: &str,
    analyzer: AnalyzerFn,
    events: &[ConversationEvent],
    ctx: &AnalysisContext,
) -> Vec<AnalysisResult> {
    match catch_unwind(AssertUnwindSafe(|| analyzer(events, ctx))) {
        Ok(results) => results,
        Err(_) => {
            tracing::error!(analyzer = name, "Analyzer panicked; returning no results");
            Vec::new()
        }
    }
}

// =============================================================================
// Periodic loop
// =============================================================================

/// One pass of the periodic loop: analyse the trailing window ending at
/// `now`, publish fresh results and any anomalies they trigger.
///
/// Returns the reports. Cached reports are neither republished nor fed to the
/// detector.
pub fn run_analysis_pass(
    pipeline: &AnalyzerPipeline,
    detector: &AnomalyDetector,
    bus: &EventBus,
    now: DateTime<Utc>,
) -> Vec<AnalysisReport> {
    let window = TimeWindow::trailing(now, pipeline.config.window_hours);
    let reports = pipeline.run_all(window, &EventFilter::default());

    let mut published = 0usize;
    let mut anomalies = 0usize;
    for report in reports.iter().filter(|r| !r.cached) {
        for result in report.results.iter() {
            bus.emit(BusPayload::Analysis(result.clone()));
            published += 1;
        }
        for record in detector.observe(&report.results) {
            bus.emit(BusPayload::Anomaly(record));
            anomalies += 1;
        }
        if !report.complete {
            tracing::warn!(
                analyzer = %report.analyzer_name,
                window = %report.window,
                "Analysis report incomplete"
            );
        }
    }
    pipeline.purge_cache();

    tracing::debug!(
        reports = reports.len(),
        published,
        anomalies,
        "Analysis pass finished"
    );
    reports
}

/// Run `run_analysis_pass` every `interval` until `cancel` fires.
pub fn spawn_analysis_loop(
    pipeline: Arc<AnalyzerPipeline>,
    detector: Arc<AnomalyDetector>,
    bus: Arc<EventBus>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("convstream-analysis".to_string())
        .spawn(move || {
            let interval = pipeline.config.interval;
            tracing::info!(
                interval_secs = interval.as_secs(),
                window_hours = pipeline.config.window_hours,
                "Analysis loop started"
            );
            while !cancel.sleep(interval) {
                run_analysis_pass(&pipeline, &detector, &bus, Utc::now());
            }
            tracing::info!("Analysis loop stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analyzers::statistical;
    use crate::core::model::{EventKey, EventType};
    use crate::core::topic::TopicPattern;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTED_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counted(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
        COUNTED_CALLS.fetch_add(1, Ordering::SeqCst);
        vec![ctx.result("n", events.len() as f64, &[])]
    }

    fn exploding(_: &[ConversationEvent], _: &AnalysisContext) -> Vec<AnalysisResult> {
        panic!("analyzer bug");
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    fn publish(bus: &EventBus, line: u64, minutes: i64, event_type: EventType) {
        bus.emit(BusPayload::Conversation(ConversationEvent {
            timestamp: (base() + chrono::Duration::minutes(minutes)).fixed_offset(),
            event_type,
            agent_id: Some("a1".to_string()),
            worker_id: None,
            task_id: None,
            message: String::new(),
            metadata: serde_json::Map::new(),
            key: EventKey {
                file: "f".to_string(),
                generation: 1,
                line,
            },
            source: PathBuf::from("f"),
        }));
    }

    fn slow(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
        std::thread::sleep(Duration::from_millis(300));
        vec![ctx.result("n", events.len() as f64, &[])]
    }

    fn quick(events: &[ConversationEvent], ctx: &AnalysisContext) -> Vec<AnalysisResult> {
        std::thread::sleep(Duration::from_millis(50));
        vec![ctx.result("n", events.len() as f64, &[])]
    }

    fn pipeline(registry: AnalyzerRegistry) -> (AnalyzerPipeline, Arc<EventBus>) {
        pipeline_with(PipelineConfig::default(), registry)
    }

    fn pipeline_with(
        config: PipelineConfig,
        registry: AnalyzerRegistry,
    ) -> (AnalyzerPipeline, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let p = AnalyzerPipeline::new(
            config,
            registry,
            Arc::clone(&bus),
            Arc::new(RwLock::new(TailerStatus::default())),
        )
        .unwrap();
        (p, bus)
    }

    fn day() -> TimeWindow {
        TimeWindow::new(base(), base() + chrono::Duration::hours(24))
    }

    #[test]
    fn test_unknown_analyzer_and_bad_window() {
        let (p, _bus) = pipeline(AnalyzerRegistry::with_builtin());
        assert!(matches!(
            p.analyze("nope", day(), &EventFilter::default()),
            Err(AnalysisError::UnknownAnalyzer { .. })
        ));
        let backwards = TimeWindow::new(day().end, day().start);
        assert!(matches!(
            p.analyze(statistical::NAME, backwards, &EventFilter::default()),
            Err(AnalysisError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_results_are_cached_per_filter_and_window() {
        let mut registry = AnalyzerRegistry::new();
        registry.register("counted", counted);
        let (p, bus) = pipeline(registry);
        publish(&bus, 1, 10, EventType::Blocker);
        publish(&bus, 2, 20, EventType::ProgressUpdate);

        let before = COUNTED_CALLS.load(Ordering::SeqCst);
        let first = p.analyze("counted", day(), &EventFilter::default()).unwrap();
        let second = p.analyze("counted", day(), &EventFilter::default()).unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.results[0].value, 2.0);

        let blockers = p
            .analyze("counted", day(), &EventFilter::of_type(EventType::Blocker))
            .unwrap();
        assert!(!blockers.cached);
        assert_eq!(blockers.results[0].value, 1.0);
        assert_eq!(COUNTED_CALLS.load(Ordering::SeqCst) - before, 2);
        assert!(first.complete);
    }

    #[test]
    fn test_panicking_analyzer_is_isolated() {
        let mut registry = AnalyzerRegistry::with_builtin();
        registry.register("exploding", exploding);
        let (p, bus) = pipeline(registry);
        publish(&bus, 1, 10, EventType::Blocker);

        let reports = p.run_all(day(), &EventFilter::default());
        assert_eq!(reports.len(), 5);
        let boom = reports.iter().find(|r| r.analyzer_name == "exploding").unwrap();
        assert!(boom.results.is_empty());
        let stats = reports
            .iter()
            .find(|r| r.analyzer_name == statistical::NAME)
            .unwrap();
        assert!(!stats.results.is_empty());
    }

    /// A direct caller racing `run_all` on the same key, with a single pool
    /// worker, must not leave either side waiting forever.
    #[test]
    fn test_concurrent_run_all_and_analyze_single_worker() {
        let mut registry = AnalyzerRegistry::new();
        registry.register("a_slow", slow);
        registry.register("b_quick", quick);
        let config = PipelineConfig {
            workers: 1,
            ..PipelineConfig::default()
        };
        let (p, bus) = pipeline_with(config, registry);
        publish(&bus, 1, 10, EventType::Blocker);
        let p = Arc::new(p);
        let (tx, rx) = std::sync::mpsc::channel();

        let all = {
            let p = Arc::clone(&p);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let reports = p.run_all(day(), &EventFilter::default());
                tx.send(("run_all", reports.len())).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        let single = {
            let p = Arc::clone(&p);
            std::thread::spawn(move || {
                let report = p.analyze("b_quick", day(), &EventFilter::default()).unwrap();
                tx.send(("analyze", report.results.len())).unwrap();
            })
        };

        let mut finished = Vec::new();
        for _ in 0..2 {
            finished.push(rx.recv_timeout(Duration::from_secs(5)).expect("no deadlock"));
        }
        finished.sort();
        assert_eq!(finished, vec![("analyze", 1), ("run_all", 2)]);
        all.join().unwrap();
        single.join().unwrap();
    }

    #[test]
    fn test_degraded_file_marks_report_incomplete() {
        let bus = Arc::new(EventBus::default());
        let status = Arc::new(RwLock::new(TailerStatus::default()));
        let p = AnalyzerPipeline::new(
            PipelineConfig::default(),
            AnalyzerRegistry::with_builtin(),
            Arc::clone(&bus),
            Arc::clone(&status),
        )
        .unwrap();
        status.write().unwrap().files.push(crate::app::tail::FileHealth {
            path: PathBuf::from("f"),
            identity: "f|1".to_string(),
            generation: 1,
            byte_offset: 0,
            line_number: 0,
            events: 0,
            parse_errors: 0,
            io_errors: 9,
            rotations: 0,
            consecutive_failures: 9,
            degraded: true,
            last_error: Some("gone".to_string()),
        });
        let r = p.analyze(statistical::NAME, day(), &EventFilter::default()).unwrap();
        assert!(!r.complete);
    }

    #[test]
    fn test_analysis_pass_publishes_fresh_results() {
        let (p, bus) = pipeline(AnalyzerRegistry::with_builtin());
        let now = base() + chrono::Duration::hours(12);
        publish(&bus, 1, 10, EventType::TaskAssignment);
        publish(&bus, 2, 70, EventType::TaskCompleted);
        let sub = bus.subscribe(TopicPattern::new("analysis.#"));
        let detector = AnomalyDetector::new(Default::default());

        let reports = run_analysis_pass(&p, &detector, &bus, now);
        assert_eq!(reports.len(), 4);
        let published = sub.drain();
        assert!(!published.is_empty());
        assert!(published.iter().any(|e| e.topic == "analysis.statistical"));

        // Same window again: served from cache, nothing republished.
        run_analysis_pass(&p, &detector, &bus, now);
        assert!(sub.drain().is_empty());
    }
}
