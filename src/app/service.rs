// ConvStream - app/service.rs
//
// Engine facade. Builds every component explicitly, wires them through
// shared `Arc`s, and owns the background threads:
//
//   tailer thread    -> discovery + polling, publishes onto the bus
//   analysis thread  -> periodic analyzer pass + anomaly detection
//   dispatcher(s)    -> one per handler subscription, owned by the caller
//
// The facade is also usable without threads: `ingest_once` drains every
// watched file synchronously, which is what one-shot analysis and the tests
// use.

use crate::app::bus::{BusConfig, EventBus, HandlerError, HandlerSubscription, Subscription};
use crate::app::detector::AnomalyDetector;
use crate::app::health::{self, HealthReport, HealthThresholds};
use crate::app::pipeline::{self, AnalysisReport, AnalyzerPipeline, PipelineConfig};
use crate::app::positions::PositionStore;
use crate::app::tail::{self, LogTailer, PollOutcome, TailerConfig, TailerStatus};
use crate::core::analyzers::AnalyzerRegistry;
use crate::core::anomaly::AnomalyConfig;
use crate::core::filter::EventFilter;
use crate::core::model::{BusEnvelope, ConversationEvent, TimeWindow};
use crate::core::topic::TopicPattern;
use crate::platform::config::AppConfig;
use crate::util::cancel::CancelToken;
use crate::util::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Validated configuration for every engine component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tailer: TailerConfig,
    /// Cursor table location. `None` keeps cursors in memory only.
    pub positions_file: Option<PathBuf>,
    pub bus: BusConfig,
    pub pipeline: PipelineConfig,
    pub anomaly: AnomalyConfig,
    pub health: HealthThresholds,
}

impl EngineConfig {
    /// Defaults for `watch_dir` with an in-memory position store.
    pub fn new(watch_dir: PathBuf) -> Self {
        Self {
            tailer: TailerConfig::new(watch_dir),
            positions_file: None,
            bus: BusConfig::default(),
            pipeline: PipelineConfig::default(),
            anomaly: AnomalyConfig::default(),
            health: HealthThresholds::default(),
        }
    }

    /// Map the validated config file onto engine components.
    ///
    /// `default_positions` is used when the config file names no position
    /// file; pass `None` for an in-memory store.
    pub fn from_app_config(
        app: &AppConfig,
        watch_dir: PathBuf,
        default_positions: Option<PathBuf>,
    ) -> Self {
        let mut tailer = TailerConfig::new(watch_dir);
        tailer.discovery.max_depth = app.max_depth;
        tailer.discovery.max_files = app.max_files;
        tailer.discovery.include_patterns = app.include_patterns.clone();
        tailer.discovery.exclude_patterns = app.exclude_patterns.clone();
        tailer.poll_interval = Duration::from_millis(app.poll_interval_ms);
        tailer.discover_interval = Duration::from_millis(app.discover_interval_ms);
        tailer.retry_base = Duration::from_millis(app.retry_base_ms);
        tailer.retry_max = Duration::from_millis(app.retry_max_ms);
        tailer.degraded_after_failures = app.degraded_after_failures;
        tailer.cursor_retention = chrono::Duration::hours(app.cursor_retention_hours);

        Self {
            tailer,
            positions_file: app.positions_file.clone().or(default_positions),
            bus: BusConfig {
                retention: chrono::Duration::hours(app.retention_hours),
                max_buffered: app.max_buffered_events,
                queue_capacity: app.subscriber_queue_capacity,
            },
            pipeline: PipelineConfig {
                workers: app.analysis_workers,
                cache_capacity: app.cache_capacity,
                cache_ttl: Duration::from_secs(app.cache_ttl_secs),
                interval: Duration::from_secs(app.analysis_interval_secs),
                window_hours: app.analysis_window_hours,
            },
            anomaly: AnomalyConfig {
                z_threshold: app.z_threshold,
                z_high_threshold: app.z_high_threshold,
                history_days: app.history_days,
                short_window_days: app.short_window_days,
                long_window_days: app.long_window_days,
                decline_ratio: app.decline_ratio,
                min_samples: app.min_samples,
            },
            health: HealthThresholds {
                parse_error_alert: app.parse_error_alert,
                dead_letter_alert: app.dead_letter_alert,
            },
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Result of `Engine::query_recent`.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEvents {
    /// Matching events, oldest first.
    pub events: Vec<ConversationEvent>,
    /// False when a tailed file is degraded, or when fewer than `limit`
    /// events matched and the buffer has evicted older ones.
    pub complete: bool,
}

pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    store: Arc<PositionStore>,
    tailer: Arc<Mutex<LogTailer>>,
    tailer_status: Arc<RwLock<TailerStatus>>,
    pipeline: Arc<AnalyzerPipeline>,
    detector: Arc<AnomalyDetector>,
    cancel: CancelToken,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("watch_dir", &self.config.tailer.watch_dir)
            .field("positions_file", &self.config.positions_file)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine with the built-in analyzers.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_registry(config, AnalyzerRegistry::with_builtin())
    }

    pub fn with_registry(config: EngineConfig, registry: AnalyzerRegistry) -> Result<Self> {
        let store = match &config.positions_file {
            // A corrupt table is logged by the store and replaced with an
            // empty one; re-reading from the start is safe.
            Some(path) => PositionStore::open_or_reset(path).0,
            None => PositionStore::in_memory(),
        };
        let store = Arc::new(store);
        let bus = Arc::new(EventBus::new(config.bus.clone()));
        let tailer = LogTailer::new(config.tailer.clone(), Arc::clone(&store), Arc::clone(&bus));
        let tailer_status = tailer.status_handle();
        let pipeline = AnalyzerPipeline::new(
            config.pipeline.clone(),
            registry,
            Arc::clone(&bus),
            Arc::clone(&tailer_status),
        )?;
        let detector = AnomalyDetector::new(config.anomaly.clone());

        tracing::info!(
            watch_dir = %config.tailer.watch_dir.display(),
            positions = ?config.positions_file,
            cursors = store.len(),
            "Engine created"
        );

        Ok(Self {
            config,
            bus,
            store,
            tailer: Arc::new(Mutex::new(tailer)),
            tailer_status,
            pipeline: Arc::new(pipeline),
            detector: Arc::new(detector),
            cancel: CancelToken::new(),
            threads: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn positions(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Start the tailer and analysis threads. No-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.cancel = CancelToken::new();

        let tailer = tail::spawn_tailer(Arc::clone(&self.tailer), self.cancel.clone())
            .map_err(|source| self.spawn_error("spawn tailer thread", source))?;
        self.threads.push(tailer);

        match pipeline::spawn_analysis_loop(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.detector),
            Arc::clone(&self.bus),
            self.cancel.clone(),
        ) {
            Ok(handle) => self.threads.push(handle),
            Err(source) => {
                let err = self.spawn_error("spawn analysis thread", source);
                self.shutdown();
                return Err(err);
            }
        }

        tracing::info!("Engine started");
        Ok(())
    }

    fn spawn_error(&self, operation: &'static str, source: std::io::Error) -> CoreError {
        CoreError::Io {
            path: self.config.tailer.watch_dir.clone(),
            operation,
            source,
        }
    }

    fn lock_tailer(&self) -> MutexGuard<'_, LogTailer> {
        self.tailer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Discover and read every watched file to its current end, on the
    /// calling thread.
    pub fn ingest_once(&self) -> Result<PollOutcome> {
        let outcome = self.lock_tailer().ingest_all()?;
        tracing::debug!(
            events = outcome.events,
            parse_errors = outcome.parse_errors,
            bytes = outcome.bytes,
            "Ingest pass finished"
        );
        Ok(outcome)
    }

    /// Live subscription to topics matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.bus.subscribe(TopicPattern::new(pattern))
    }

    /// Buffered envelopes since `since`, then live delivery with no gap.
    pub fn subscribe_with_replay(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
    ) -> (Vec<Arc<BusEnvelope>>, Subscription) {
        self.bus.subscribe_with_replay(TopicPattern::new(pattern), since)
    }

    /// Subscription driven by `handler` on its own dispatcher thread.
    pub fn subscribe_with_handler<F>(&self, pattern: &str, handler: F) -> Result<HandlerSubscription>
    where
        F: FnMut(&BusEnvelope) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.bus
            .subscribe_with_handler(TopicPattern::new(pattern), handler)
            .map_err(|source| self.spawn_error("spawn subscriber thread", source))
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.bus.unsubscribe(subscription);
    }

    /// Most recent conversation events matching `filter`, oldest first.
    pub fn query_recent(&self, limit: usize, filter: &EventFilter) -> RecentEvents {
        let events = self.bus.query_recent(limit, filter);
        let degraded = match self.tailer_status.read() {
            Ok(s) => s.any_degraded(),
            Err(p) => p.into_inner().any_degraded(),
        };
        let truncated = events.len() < limit && self.bus.evicted_count() > 0;
        RecentEvents {
            complete: !degraded && !truncated,
            events,
        }
    }

    /// Results of one analyzer over `window`, from cache when fresh.
    pub fn get_analysis(
        &self,
        analyzer_name: &str,
        window: TimeWindow,
        filter: &EventFilter,
    ) -> Result<AnalysisReport> {
        Ok(self.pipeline.analyze(analyzer_name, window, filter)?)
    }

    /// Every registered analyzer over `window`.
    pub fn analyze_all(&self, window: TimeWindow, filter: &EventFilter) -> Vec<AnalysisReport> {
        self.pipeline.run_all(window, filter)
    }

    pub fn analyzer_names(&self) -> Vec<String> {
        self.pipeline.analyzer_names()
    }

    /// One periodic analysis pass ending at `now`: publishes fresh results and
    /// the anomalies they trigger.
    pub fn run_analysis_pass(&self, now: DateTime<Utc>) -> Vec<AnalysisReport> {
        pipeline::run_analysis_pass(&self.pipeline, &self.detector, &self.bus, now)
    }

    /// Window covering every buffered conversation event, if any. Windows are
    /// end-exclusive, so the end sits one second past the latest event.
    pub fn buffered_window(&self) -> Option<TimeWindow> {
        self.bus
            .conversation_span()
            .map(|(start, end)| TimeWindow::new(start, end + chrono::Duration::seconds(1)))
    }

    pub fn health(&self) -> HealthReport {
        // Synchronous callers never hit the loop's refresh.
        if !self.is_running() {
            self.lock_tailer().refresh_status();
        }
        let status = match self.tailer_status.read() {
            Ok(s) => s.clone(),
            Err(p) => p.into_inner().clone(),
        };
        health::evaluate(
            &status,
            &self.bus.stats(),
            self.pipeline.cache_stats(),
            &self.config.health,
        )
    }

    /// Cursor table location, if persisted.
    pub fn positions_file(&self) -> Option<&Path> {
        self.store.path()
    }

    /// Stop the background threads, wait for them, and persist cursors.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            self.lock_tailer().persist();
            return;
        }
        self.cancel.cancel();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "Background thread panicked");
            }
        }
        tracing::info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::health::HealthStatus;
    use crate::core::model::BusPayload;
    use crate::platform::config::RawConfig;
    use std::io::Write;

    const LINES: &str = concat!(
        "{\"timestamp\":\"2025-01-15T10:00:00+00:00\",\"type\":\"task_assignment\",\"agent_id\":\"coordinator\",\"worker_id\":\"w1\",\"task_id\":\"t1\",\"message\":\"assign\"}\n",
        "{\"timestamp\":\"2025-01-15T10:05:00+00:00\",\"type\":\"progress_update\",\"agent_id\":\"w1\",\"task_id\":\"t1\",\"message\":\"half way\"}\n",
        "{\"timestamp\":\"2025-01-15T10:10:00+00:00\",\"type\":\"task_completed\",\"agent_id\":\"w1\",\"task_id\":\"t1\",\"message\":\"done\"}\n",
    );

    fn engine_with(lines: &str) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("conversations_2025_01_15.jsonl")).unwrap();
        f.write_all(lines.as_bytes()).unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path().to_path_buf())).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_from_app_config_maps_sections() {
        let (app, _) = crate::platform::config::validate(RawConfig::default());
        let cfg = EngineConfig::from_app_config(
            &app,
            PathBuf::from("/logs"),
            Some(PathBuf::from("/data/positions.json")),
        );
        assert_eq!(cfg.tailer.watch_dir, PathBuf::from("/logs"));
        assert_eq!(cfg.positions_file, Some(PathBuf::from("/data/positions.json")));
        assert_eq!(cfg.pipeline.workers, app.analysis_workers);
        assert_eq!(cfg.anomaly, AnomalyConfig::default());
        assert_eq!(cfg.health, HealthThresholds::default());
        assert_eq!(
            cfg.tailer.cursor_retention,
            chrono::Duration::hours(app.cursor_retention_hours)
        );
    }

    #[test]
    fn test_query_recent_flags_evicted_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("conversations_2025_01_15.jsonl")).unwrap();
        f.write_all(LINES.as_bytes()).unwrap();
        let mut config = EngineConfig::new(dir.path().to_path_buf());
        config.bus.max_buffered = 2;
        let engine = Engine::new(config).unwrap();
        engine.ingest_once().unwrap();

        // The oldest event was evicted; asking for more than remain is partial.
        let all = engine.query_recent(10, &EventFilter::default());
        assert_eq!(all.events.len(), 2);
        assert!(!all.complete);

        let latest = engine.query_recent(2, &EventFilter::default());
        assert!(latest.complete);
        assert_eq!(latest.events[0].message, "half way");
    }

    #[test]
    fn test_ingest_then_query_and_analyze() {
        let (_dir, engine) = engine_with(LINES);
        let sub = engine.subscribe("conversation.#");

        let outcome = engine.ingest_once().unwrap();
        assert_eq!(outcome.events, 3);
        assert_eq!(sub.drain().len(), 3);

        let recent = engine.query_recent(2, &EventFilter::default());
        assert!(recent.complete);
        assert_eq!(recent.events.len(), 2);
        assert_eq!(recent.events[1].message, "done");

        let window = engine.buffered_window().unwrap();
        let report = engine
            .get_analysis("statistical", window, &EventFilter::default())
            .unwrap();
        assert!(report.complete);
        assert!(!report.cached);
        let again = engine
            .get_analysis("statistical", window, &EventFilter::default())
            .unwrap();
        assert!(again.cached);
    }

    #[test]
    fn test_unknown_analyzer_is_error() {
        let (_dir, engine) = engine_with(LINES);
        engine.ingest_once().unwrap();
        let window = engine.buffered_window().unwrap();
        assert!(matches!(
            engine.get_analysis("nope", window, &EventFilter::default()),
            Err(CoreError::Analysis(_))
        ));
    }

    #[test]
    fn test_health_counts_parse_errors() {
        let mut lines = LINES.to_string();
        lines.push_str("not json\n");
        let (_dir, mut engine) = engine_with(&lines);
        engine.config.health.parse_error_alert = 1;
        engine.ingest_once().unwrap();

        let report = engine.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.parse_errors_total, 1);
        assert_eq!(report.events_total, 3);
    }

    #[test]
    fn test_start_and_shutdown_threads() {
        let (dir, mut engine) = engine_with("");
        engine.start().unwrap();
        assert!(engine.is_running());

        let sub = engine.subscribe("conversation.#");
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("conversations_2025_01_15.jsonl"))
            .unwrap();
        f.write_all(LINES.as_bytes()).unwrap();

        let first = sub.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(first.payload, BusPayload::Conversation(_)));

        engine.shutdown();
        assert!(!engine.is_running());
    }
}
