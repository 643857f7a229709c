// ConvStream - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.
// Every bound enforced anywhere in the crate is named here so it can be
// audited in one place.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "ConvStream";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "ConvStream";

/// Current application version (updated by release script).
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Discovery
// =============================================================================

/// Default include glob patterns (filename only) for watched log files.
pub const DEFAULT_INCLUDE_PATTERNS: &[&str] = &["conversations_*.jsonl", "realtime_*.jsonl"];

/// Default exclude glob patterns (file or directory name).
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["*.tmp", "*.gz", ".git"];

/// Default directory recursion depth. 1 = the watched directory only.
pub const DEFAULT_MAX_DEPTH: usize = 1;

/// Hard upper bound on recursion depth.
pub const ABSOLUTE_MAX_DEPTH: usize = 16;

/// Maximum number of files tracked at once. Discovery stops adding files
/// beyond this and logs a warning.
pub const DEFAULT_MAX_TRACKED_FILES: usize = 1_000;

/// Hard upper bound on the tracked-file limit.
pub const ABSOLUTE_MAX_TRACKED_FILES: usize = 20_000;

// =============================================================================
// Tailer
// =============================================================================

/// How often each tracked file is polled for new content (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Minimum user-configurable poll interval (ms).
pub const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Maximum user-configurable poll interval (ms).
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;

/// How often the watched directory is re-listed for new files (ms).
pub const DEFAULT_DISCOVER_INTERVAL_MS: u64 = 2_000;

/// Minimum user-configurable discovery interval (ms).
pub const MIN_DISCOVER_INTERVAL_MS: u64 = 100;

/// Maximum user-configurable discovery interval (ms).
pub const MAX_DISCOVER_INTERVAL_MS: u64 = 60_000;

/// How often cancellable sleeps wake up to check their token (ms).
pub const CANCEL_CHECK_INTERVAL_MS: u64 = 50;

/// Maximum bytes read from a single file in one poll tick.
pub const MAX_TAIL_READ_BYTES_PER_TICK: usize = 512 * 1_024; // 512 KiB

/// Longest single line the tailer will buffer while waiting for its newline.
/// Longer lines are skipped and counted as one parse error.
pub const MAX_TAIL_PARTIAL_BYTES: usize = MAX_TAIL_READ_BYTES_PER_TICK * 4; // 2 MiB

/// First retry delay after a transient I/O failure (ms).
pub const DEFAULT_RETRY_BASE_MS: u64 = 250;

/// Upper bound of the exponential retry delay (ms).
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Consecutive I/O failures after which a file is reported as degraded.
pub const DEFAULT_DEGRADED_AFTER_FAILURES: u32 = 5;

/// How long the cursor of a file that is no longer present is kept, so a
/// file that comes back resumes where it left off (hours).
pub const DEFAULT_CURSOR_RETENTION_HOURS: i64 = 24 * 7;

/// Maximum length of an offending log line included in log output.
pub const DEBUG_MAX_LINE_PREVIEW: usize = 200;

// =============================================================================
// Event bus
// =============================================================================

/// Replay buffer time retention (hours).
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Replay buffer count cap.
pub const DEFAULT_MAX_BUFFERED_EVENTS: usize = 50_000;

/// Hard upper bound on the replay buffer count cap.
pub const ABSOLUTE_MAX_BUFFERED_EVENTS: usize = 2_000_000;

/// Per-subscription delivery queue capacity.
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1_024;

/// Hard upper bound on the per-subscription queue capacity.
pub const ABSOLUTE_MAX_SUBSCRIBER_QUEUE_CAPACITY: usize = 1_000_000;

// =============================================================================
// Topics
// =============================================================================

/// Prefix of conversation event topics (`conversation.<type>`).
pub const TOPIC_CONVERSATION_PREFIX: &str = "conversation";

/// Topic of rotation / truncation markers.
pub const TOPIC_ROTATION: &str = "tailer.rotation";

/// Prefix of analysis result topics (`analysis.<analyzer>`).
pub const TOPIC_ANALYSIS_PREFIX: &str = "analysis";

/// Prefix of anomaly topics (`anomaly.<method>`).
pub const TOPIC_ANOMALY_PREFIX: &str = "anomaly";

// =============================================================================
// Analysis
// =============================================================================

/// Interval of the periodic analysis loop (seconds).
pub const DEFAULT_ANALYSIS_INTERVAL_SECS: u64 = 60;

/// Minimum user-configurable analysis interval (seconds).
pub const MIN_ANALYSIS_INTERVAL_SECS: u64 = 1;

/// Maximum user-configurable analysis interval (seconds).
pub const MAX_ANALYSIS_INTERVAL_SECS: u64 = 86_400;

/// Trailing window analysed by the periodic loop (hours).
pub const DEFAULT_ANALYSIS_WINDOW_HOURS: i64 = 24;

/// Worker threads in the analyzer pool.
pub const DEFAULT_ANALYSIS_WORKERS: usize = 2;

/// Hard upper bound on analyzer worker threads.
pub const MAX_ANALYSIS_WORKERS: usize = 64;

/// Number of standard deviations above the mean hourly count that marks a burst.
pub const BURST_SIGMA: f64 = 2.0;

/// Decision confidence at or above which a decision counts as high confidence.
pub const HIGH_CONFIDENCE: f64 = 0.8;

/// Decision confidence at or above which a decision counts as medium confidence.
pub const MEDIUM_CONFIDENCE: f64 = 0.5;

// =============================================================================
// Cache
// =============================================================================

/// Maximum number of cached analysis results.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Hard upper bound on cache capacity.
pub const ABSOLUTE_MAX_CACHE_CAPACITY: usize = 100_000;

/// Default time-to-live of cached analysis results (seconds).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

// =============================================================================
// Anomaly detection
// =============================================================================

/// |z| above which a value is anomalous.
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;

/// |z| above which an anomaly is high severity.
pub const DEFAULT_Z_HIGH_THRESHOLD: f64 = 4.0;

/// Rolling history window for z-score statistics (days).
pub const DEFAULT_HISTORY_DAYS: i64 = 30;

/// Short moving-average window (days).
pub const DEFAULT_SHORT_WINDOW_DAYS: i64 = 7;

/// Long moving-average window (days).
pub const DEFAULT_LONG_WINDOW_DAYS: i64 = 30;

/// Short/long ratio below which a decline is reported.
pub const DEFAULT_DECLINE_RATIO: f64 = 0.5;

/// Minimum history samples before either method evaluates a metric.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// Width of one history bucket (seconds). Observations falling in the same
/// bucket are averaged into one history point.
pub const SERIES_BUCKET_SECS: i64 = 3_600;

/// Maximum buckets retained per metric series (one year of hourly buckets).
pub const MAX_SERIES_BUCKETS: usize = 8_784;

// =============================================================================
// Health
// =============================================================================

/// Total parse errors at or above which health is reported as degraded.
pub const DEFAULT_PARSE_ERROR_ALERT: u64 = 1_000;

/// Dead letters on any subscription at or above which health is degraded.
pub const DEFAULT_DEAD_LETTER_ALERT: u64 = 1_000;

// =============================================================================
// Export
// =============================================================================

/// Maximum number of rows that can be exported in a single operation.
pub const MAX_EXPORT_ROWS: usize = 5_000_000;

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

// =============================================================================
// Configuration & persistence
// =============================================================================

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Cursor table file name (stored in the platform data directory).
pub const POSITIONS_FILE_NAME: &str = "positions.json";
