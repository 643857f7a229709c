// ConvStream - platform/config.rs
//
// Platform-specific data directory resolution, and config.toml loading with
// startup validation.
//
// Uses the `directories` crate for XDG (Linux), AppData (Windows),
// Library (macOS) compliance.
//
// Every value is checked against the bounds in util::constants. Out-of-range
// values produce an actionable warning and fall back to the default; only an
// unusable watch directory is fatal.

use crate::util::constants;
use crate::util::error::ConfigError;
use directories::ProjectDirs;
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Resolved platform paths for ConvStream configuration and state.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// Configuration directory (e.g. ~/.config/convstream/)
    pub config_dir: PathBuf,

    /// Data directory for the persisted cursor table.
    pub data_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve platform-appropriate paths.
    ///
    /// Falls back to current directory if platform dirs cannot be determined.
    pub fn resolve() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("", "", constants::APP_ID) {
            let config_dir = proj_dirs.config_dir().to_path_buf();
            let data_dir = proj_dirs.data_dir().to_path_buf();

            tracing::debug!(
                config = %config_dir.display(),
                data = %data_dir.display(),
                "Platform paths resolved"
            );

            Self {
                config_dir,
                data_dir,
            }
        } else {
            tracing::warn!("Could not determine platform directories, using current directory");
            let fallback = PathBuf::from(".");
            Self {
                config_dir: fallback.clone(),
                data_dir: fallback,
            }
        }
    }

    /// Default location of the cursor table.
    pub fn positions_file(&self) -> PathBuf {
        self.data_dir.join(constants::POSITIONS_FILE_NAME)
    }

    /// Default location of config.toml.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(constants::CONFIG_FILE_NAME)
    }
}

// =============================================================================
// config.toml shape
// =============================================================================

/// Raw deserialisable shape of config.toml.
///
/// Unknown keys are silently ignored for forward compatibility.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub watch: WatchSection,
    pub tailer: TailerSection,
    pub bus: BusSection,
    pub analysis: AnalysisSection,
    pub anomaly: AnomalySection,
    pub health: HealthSection,
    pub logging: LoggingSection,
}

/// `[watch]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Directory holding the conversation logs.
    pub directory: Option<String>,
    /// Maximum directory recursion depth.
    pub max_depth: Option<usize>,
    /// Maximum files tailed at once.
    pub max_files: Option<usize>,
    /// Include glob patterns (file name only).
    pub include_patterns: Option<Vec<String>>,
    /// Exclude glob patterns.
    pub exclude_patterns: Option<Vec<String>>,
}

/// `[tailer]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct TailerSection {
    pub poll_interval_ms: Option<u64>,
    pub discover_interval_ms: Option<u64>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    pub degraded_after_failures: Option<u32>,
    /// Hours a vanished file's cursor is kept before it is pruned.
    pub cursor_retention_hours: Option<i64>,
    /// Cursor table location (default: platform data dir).
    pub positions_file: Option<String>,
}

/// `[bus]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub retention_hours: Option<i64>,
    pub max_buffered_events: Option<usize>,
    pub subscriber_queue_capacity: Option<usize>,
}

/// `[analysis]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub interval_secs: Option<u64>,
    pub window_hours: Option<i64>,
    pub workers: Option<usize>,
    pub cache_capacity: Option<usize>,
    pub cache_ttl_secs: Option<u64>,
}

/// `[anomaly]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct AnomalySection {
    pub z_threshold: Option<f64>,
    pub z_high_threshold: Option<f64>,
    pub history_days: Option<i64>,
    pub short_window_days: Option<i64>,
    pub long_window_days: Option<i64>,
    pub decline_ratio: Option<f64>,
    pub min_samples: Option<usize>,
}

/// `[health]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub parse_error_alert: Option<u64>,
    pub dead_letter_alert: Option<u64>,
}

/// `[logging]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: Option<String>,
    /// Log file path (empty = stderr only).
    pub file: Option<String>,
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Validated configuration derived from `config.toml`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // -- Watch --
    pub watch_dir: Option<PathBuf>,
    pub max_depth: usize,
    pub max_files: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,

    // -- Tailer --
    pub poll_interval_ms: u64,
    pub discover_interval_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub degraded_after_failures: u32,
    pub cursor_retention_hours: i64,
    pub positions_file: Option<PathBuf>,

    // -- Bus --
    pub retention_hours: i64,
    pub max_buffered_events: usize,
    pub subscriber_queue_capacity: usize,

    // -- Analysis --
    pub analysis_interval_secs: u64,
    pub analysis_window_hours: i64,
    pub analysis_workers: usize,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,

    // -- Anomaly --
    pub z_threshold: f64,
    pub z_high_threshold: f64,
    pub history_days: i64,
    pub short_window_days: i64,
    pub long_window_days: i64,
    pub decline_ratio: f64,
    pub min_samples: usize,

    // -- Health --
    pub parse_error_alert: u64,
    pub dead_letter_alert: u64,

    // -- Logging --
    /// Logging level string (for init before tracing is available).
    pub log_level: Option<String>,
    pub log_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| (*s).to_string()).collect();
        Self {
            watch_dir: None,
            max_depth: constants::DEFAULT_MAX_DEPTH,
            max_files: constants::DEFAULT_MAX_TRACKED_FILES,
            include_patterns: owned(constants::DEFAULT_INCLUDE_PATTERNS),
            exclude_patterns: owned(constants::DEFAULT_EXCLUDE_PATTERNS),
            poll_interval_ms: constants::DEFAULT_POLL_INTERVAL_MS,
            discover_interval_ms: constants::DEFAULT_DISCOVER_INTERVAL_MS,
            retry_base_ms: constants::DEFAULT_RETRY_BASE_MS,
            retry_max_ms: constants::DEFAULT_RETRY_MAX_MS,
            degraded_after_failures: constants::DEFAULT_DEGRADED_AFTER_FAILURES,
            cursor_retention_hours: constants::DEFAULT_CURSOR_RETENTION_HOURS,
            positions_file: None,
            retention_hours: constants::DEFAULT_RETENTION_HOURS,
            max_buffered_events: constants::DEFAULT_MAX_BUFFERED_EVENTS,
            subscriber_queue_capacity: constants::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            analysis_interval_secs: constants::DEFAULT_ANALYSIS_INTERVAL_SECS,
            analysis_window_hours: constants::DEFAULT_ANALYSIS_WINDOW_HOURS,
            analysis_workers: constants::DEFAULT_ANALYSIS_WORKERS,
            cache_capacity: constants::DEFAULT_CACHE_CAPACITY,
            cache_ttl_secs: constants::DEFAULT_CACHE_TTL_SECS,
            z_threshold: constants::DEFAULT_Z_THRESHOLD,
            z_high_threshold: constants::DEFAULT_Z_HIGH_THRESHOLD,
            history_days: constants::DEFAULT_HISTORY_DAYS,
            short_window_days: constants::DEFAULT_SHORT_WINDOW_DAYS,
            long_window_days: constants::DEFAULT_LONG_WINDOW_DAYS,
            decline_ratio: constants::DEFAULT_DECLINE_RATIO,
            min_samples: constants::DEFAULT_MIN_SAMPLES,
            parse_error_alert: constants::DEFAULT_PARSE_ERROR_ALERT,
            dead_letter_alert: constants::DEFAULT_DEAD_LETTER_ALERT,
            log_level: None,
            log_file: None,
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load and validate `config.toml` from the given config directory.
///
/// Returns validated values and a list of non-fatal warnings.
/// If the file does not exist, returns defaults with no warnings (first-run).
/// If the file is unreadable or unparseable, returns defaults with a warning.
pub fn load_config(config_dir: &Path) -> (AppConfig, Vec<String>) {
    let config_path = config_dir.join(constants::CONFIG_FILE_NAME);

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "No config.toml found; using defaults");
        return (AppConfig::default(), Vec::new());
    }

    match load_config_file(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            let msg = format!(
                "{e}. Using defaults. See config.example.toml for the expected format."
            );
            tracing::warn!("{}", msg);
            (AppConfig::default(), vec![msg])
        }
    }
}

/// Load and validate an explicitly named config file.
///
/// Unlike [`load_config`], a missing or malformed file is an error: the user
/// asked for this file by name.
pub fn load_config_file(path: &Path) -> Result<(AppConfig, Vec<String>), ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "Loaded config.toml");
    Ok(validate(raw))
}

/// Check `value` against `[min, max]`; out-of-range values warn and yield the default.
fn bounded<T>(
    key: &str,
    value: Option<T>,
    min: T,
    max: T,
    default: T,
    warnings: &mut Vec<String>,
) -> T
where
    T: PartialOrd + Display + Copy,
{
    match value {
        None => default,
        Some(v) if v >= min && v <= max => v,
        Some(v) => {
            warnings.push(format!(
                "{key} = {v} is out of range ({min}-{max}). Using default ({default})."
            ));
            default
        }
    }
}

/// Keep the patterns that compile; fall back to `defaults` if none do.
fn patterns(
    key: &str,
    value: Option<Vec<String>>,
    defaults: &[String],
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let Some(list) = value else {
        return defaults.to_vec();
    };
    let mut valid = Vec::with_capacity(list.len());
    for p in list {
        match glob::Pattern::new(&p) {
            Ok(_) => valid.push(p),
            Err(source) => {
                let e = ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                };
                warnings.push(format!("{key}: {e}. Pattern ignored."));
            }
        }
    }
    valid
}

/// Validate every field of `raw`, accumulating warnings.
pub fn validate(raw: RawConfig) -> (AppConfig, Vec<String>) {
    let mut w: Vec<String> = Vec::new();
    let d = AppConfig::default();

    let watch_dir = raw
        .watch
        .directory
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);

    let include_patterns = patterns(
        "[watch] include_patterns",
        raw.watch.include_patterns,
        &d.include_patterns,
        &mut w,
    );
    let exclude_patterns = patterns(
        "[watch] exclude_patterns",
        raw.watch.exclude_patterns,
        &d.exclude_patterns,
        &mut w,
    );

    let retry_base_ms = bounded(
        "[tailer] retry_base_ms",
        raw.tailer.retry_base_ms,
        1,
        constants::DEFAULT_RETRY_MAX_MS,
        d.retry_base_ms,
        &mut w,
    );
    let mut retry_max_ms = bounded(
        "[tailer] retry_max_ms",
        raw.tailer.retry_max_ms,
        1,
        constants::DEFAULT_RETRY_MAX_MS * 10,
        d.retry_max_ms,
        &mut w,
    );
    if retry_max_ms < retry_base_ms {
        w.push(format!(
            "[tailer] retry_max_ms = {retry_max_ms} is below retry_base_ms = {retry_base_ms}. \
             Using retry_base_ms."
        ));
        retry_max_ms = retry_base_ms;
    }

    let z_threshold = bounded(
        "[anomaly] z_threshold",
        raw.anomaly.z_threshold,
        0.5,
        20.0,
        d.z_threshold,
        &mut w,
    );
    let mut z_high_threshold = bounded(
        "[anomaly] z_high_threshold",
        raw.anomaly.z_high_threshold,
        0.5,
        40.0,
        d.z_high_threshold,
        &mut w,
    );
    if z_high_threshold < z_threshold {
        w.push(format!(
            "[anomaly] z_high_threshold = {z_high_threshold} is below z_threshold = {z_threshold}. \
             Using z_threshold."
        ));
        z_high_threshold = z_threshold;
    }

    let short_window_days = bounded(
        "[anomaly] short_window_days",
        raw.anomaly.short_window_days,
        1,
        365,
        d.short_window_days,
        &mut w,
    );
    let mut long_window_days = bounded(
        "[anomaly] long_window_days",
        raw.anomaly.long_window_days,
        1,
        365,
        d.long_window_days,
        &mut w,
    );
    if long_window_days <= short_window_days {
        w.push(format!(
            "[anomaly] long_window_days = {long_window_days} must exceed short_window_days = \
             {short_window_days}. Using {}.",
            short_window_days * 2
        ));
        long_window_days = short_window_days * 2;
    }

    let log_level = match raw.logging.level {
        Some(level) => {
            let valid = ["error", "warn", "info", "debug", "trace"];
            if valid.contains(&level.to_lowercase().as_str()) {
                Some(level)
            } else {
                w.push(format!(
                    "[logging] level = \"{level}\" is not recognised. \
                     Valid values: error, warn, info, debug, trace. Using default (info).",
                ));
                None
            }
        }
        None => None,
    };

    let config = AppConfig {
        watch_dir,
        max_depth: bounded(
            "[watch] max_depth",
            raw.watch.max_depth,
            1,
            constants::ABSOLUTE_MAX_DEPTH,
            d.max_depth,
            &mut w,
        ),
        max_files: bounded(
            "[watch] max_files",
            raw.watch.max_files,
            1,
            constants::ABSOLUTE_MAX_TRACKED_FILES,
            d.max_files,
            &mut w,
        ),
        include_patterns,
        exclude_patterns,
        poll_interval_ms: bounded(
            "[tailer] poll_interval_ms",
            raw.tailer.poll_interval_ms,
            constants::MIN_POLL_INTERVAL_MS,
            constants::MAX_POLL_INTERVAL_MS,
            d.poll_interval_ms,
            &mut w,
        ),
        discover_interval_ms: bounded(
            "[tailer] discover_interval_ms",
            raw.tailer.discover_interval_ms,
            constants::MIN_DISCOVER_INTERVAL_MS,
            constants::MAX_DISCOVER_INTERVAL_MS,
            d.discover_interval_ms,
            &mut w,
        ),
        retry_base_ms,
        retry_max_ms,
        degraded_after_failures: bounded(
            "[tailer] degraded_after_failures",
            raw.tailer.degraded_after_failures,
            1,
            1_000,
            d.degraded_after_failures,
            &mut w,
        ),
        cursor_retention_hours: bounded(
            "[tailer] cursor_retention_hours",
            raw.tailer.cursor_retention_hours,
            1,
            24 * 365,
            d.cursor_retention_hours,
            &mut w,
        ),
        positions_file: raw
            .tailer
            .positions_file
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        retention_hours: bounded(
            "[bus] retention_hours",
            raw.bus.retention_hours,
            1,
            24 * 30,
            d.retention_hours,
            &mut w,
        ),
        max_buffered_events: bounded(
            "[bus] max_buffered_events",
            raw.bus.max_buffered_events,
            1,
            constants::ABSOLUTE_MAX_BUFFERED_EVENTS,
            d.max_buffered_events,
            &mut w,
        ),
        subscriber_queue_capacity: bounded(
            "[bus] subscriber_queue_capacity",
            raw.bus.subscriber_queue_capacity,
            1,
            constants::ABSOLUTE_MAX_SUBSCRIBER_QUEUE_CAPACITY,
            d.subscriber_queue_capacity,
            &mut w,
        ),
        analysis_interval_secs: bounded(
            "[analysis] interval_secs",
            raw.analysis.interval_secs,
            constants::MIN_ANALYSIS_INTERVAL_SECS,
            constants::MAX_ANALYSIS_INTERVAL_SECS,
            d.analysis_interval_secs,
            &mut w,
        ),
        analysis_window_hours: bounded(
            "[analysis] window_hours",
            raw.analysis.window_hours,
            1,
            24 * 30,
            d.analysis_window_hours,
            &mut w,
        ),
        analysis_workers: bounded(
            "[analysis] workers",
            raw.analysis.workers,
            1,
            constants::MAX_ANALYSIS_WORKERS,
            d.analysis_workers,
            &mut w,
        ),
        cache_capacity: bounded(
            "[analysis] cache_capacity",
            raw.analysis.cache_capacity,
            1,
            constants::ABSOLUTE_MAX_CACHE_CAPACITY,
            d.cache_capacity,
            &mut w,
        ),
        cache_ttl_secs: bounded(
            "[analysis] cache_ttl_secs",
            raw.analysis.cache_ttl_secs,
            1,
            86_400,
            d.cache_ttl_secs,
            &mut w,
        ),
        z_threshold,
        z_high_threshold,
        history_days: bounded(
            "[anomaly] history_days",
            raw.anomaly.history_days,
            1,
            365,
            d.history_days,
            &mut w,
        ),
        short_window_days,
        long_window_days,
        decline_ratio: bounded(
            "[anomaly] decline_ratio",
            raw.anomaly.decline_ratio,
            0.01,
            1.0,
            d.decline_ratio,
            &mut w,
        ),
        min_samples: bounded(
            "[anomaly] min_samples",
            raw.anomaly.min_samples,
            1,
            constants::MAX_SERIES_BUCKETS,
            d.min_samples,
            &mut w,
        ),
        parse_error_alert: bounded(
            "[health] parse_error_alert",
            raw.health.parse_error_alert,
            1,
            u64::MAX,
            d.parse_error_alert,
            &mut w,
        ),
        dead_letter_alert: bounded(
            "[health] dead_letter_alert",
            raw.health.dead_letter_alert,
            1,
            u64::MAX,
            d.dead_letter_alert,
            &mut w,
        ),
        log_level,
        log_file: raw.logging.file.filter(|f| !f.is_empty()),
    };

    if !w.is_empty() {
        tracing::warn!(count = w.len(), "Config validation produced warnings");
    }

    (config, w)
}

/// Check that `path` is an existing, listable directory and return it in
/// canonical form. Fatal at startup.
pub fn validate_watch_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidWatchPath {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    std::fs::read_dir(path).map_err(|e| invalid(format!("cannot list: {e}")))?;
    std::fs::canonicalize(path).map_err(|e| invalid(e.to_string()))
}
