// ConvStream - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// No string-based error propagation in library code.
// All errors preserve the causal chain for diagnostic logging.

use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all ConvStream operations.
/// Errors are categorised by the subsystem that produced them.
#[derive(Debug)]
pub enum CoreError {
    /// Log line parsing failed.
    Parse(ParseError),

    /// Transient file-system fault while tailing.
    Tail(TailError),

    /// Position store could not be read or written.
    Store(StoreError),

    /// Analyzer pipeline failure.
    Analysis(AnalysisError),

    /// Cached computation failure.
    Cache(CacheError),

    /// Event filter construction failed.
    Filter(FilterError),

    /// Export operation failed.
    Export(ExportError),

    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "Parse error: {e}"),
            Self::Tail(e) => write!(f, "Tail error: {e}"),
            Self::Store(e) => write!(f, "Position store error: {e}"),
            Self::Analysis(e) => write!(f, "Analysis error: {e}"),
            Self::Cache(e) => write!(f, "Cache error: {e}"),
            Self::Filter(e) => write!(f, "Filter error: {e}"),
            Self::Export(e) => write!(f, "Export error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Tail(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Analysis(e) => Some(e),
            Self::Cache(e) => Some(e),
            Self::Filter(e) => Some(e),
            Self::Export(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io { source, .. } => Some(source),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// A single log line could not be turned into a `ConversationEvent`.
///
/// Always recoverable: the tailer counts it, logs a preview and moves on.
#[derive(Debug)]
pub enum ParseError {
    /// The line is not valid JSON.
    InvalidJson {
        file: PathBuf,
        line_number: u64,
        source: serde_json::Error,
    },

    /// The line is JSON but not an object.
    NotAnObject { file: PathBuf, line_number: u64 },

    /// A required field is missing or has the wrong JSON type.
    MissingField {
        file: PathBuf,
        line_number: u64,
        field: &'static str,
    },

    /// The timestamp is not ISO-8601.
    InvalidTimestamp {
        file: PathBuf,
        line_number: u64,
        raw_timestamp: String,
    },

    /// The line exceeded the partial-line buffer cap and was skipped.
    LineTooLong {
        file: PathBuf,
        line_number: u64,
        max_bytes: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson {
                file,
                line_number,
                source,
            } => write!(
                f,
                "'{}' line {line_number}: invalid JSON: {source}",
                file.display()
            ),
            Self::NotAnObject { file, line_number } => write!(
                f,
                "'{}' line {line_number}: expected a JSON object",
                file.display()
            ),
            Self::MissingField {
                file,
                line_number,
                field,
            } => write!(
                f,
                "'{}' line {line_number}: missing or invalid field '{field}'",
                file.display()
            ),
            Self::InvalidTimestamp {
                file,
                line_number,
                raw_timestamp,
            } => write!(
                f,
                "'{}' line {line_number}: cannot parse timestamp '{raw_timestamp}'",
                file.display()
            ),
            Self::LineTooLong {
                file,
                line_number,
                max_bytes,
            } => write!(
                f,
                "'{}' line {line_number}: line exceeds {max_bytes} bytes, skipped",
                file.display()
            ),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ParseError> for CoreError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// Tail errors
// ---------------------------------------------------------------------------

/// Transient file-system faults met while tailing a file.
///
/// Retried with exponential backoff; repeated failures mark the file degraded.
#[derive(Debug)]
pub enum TailError {
    /// Metadata of the file could not be read (missing, permission race).
    Stat { path: PathBuf, source: io::Error },

    /// Reading new bytes failed.
    Read { path: PathBuf, source: io::Error },

    /// The watched directory could not be listed.
    Discover {
        path: PathBuf,
        source: walkdir::Error,
    },
}

impl TailError {
    /// Path of the file or directory that failed.
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Stat { path, .. } | Self::Read { path, .. } | Self::Discover { path, .. } => path,
        }
    }
}

impl fmt::Display for TailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stat { path, source } => {
                write!(f, "cannot stat '{}': {source}", path.display())
            }
            Self::Read { path, source } => {
                write!(f, "cannot read '{}': {source}", path.display())
            }
            Self::Discover { path, source } => {
                write!(f, "cannot list '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stat { source, .. } | Self::Read { source, .. } => Some(source),
            Self::Discover { source, .. } => Some(source),
        }
    }
}

impl From<TailError> for CoreError {
    fn from(e: TailError) -> Self {
        Self::Tail(e)
    }
}

// ---------------------------------------------------------------------------
// Rotation notices
// ---------------------------------------------------------------------------

/// A detected truncation or replacement of a tailed file.
///
/// Not an outage: the tailer resets the cursor, bumps the generation and
/// publishes a rotation marker. Kept in the taxonomy so it can be logged and
/// counted like the other per-file conditions.
#[derive(Debug, Clone)]
pub enum RotationError {
    /// The file shrank below the cursor offset.
    Truncated {
        path: PathBuf,
        previous_offset: u64,
        new_size: u64,
    },

    /// A different file (new identity) now lives at the tracked path.
    Replaced {
        path: PathBuf,
        old_identity: String,
        new_identity: String,
    },
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                path,
                previous_offset,
                new_size,
            } => write!(
                f,
                "'{}' truncated from offset {previous_offset} to size {new_size}",
                path.display()
            ),
            Self::Replaced {
                path,
                old_identity,
                new_identity,
            } => write!(
                f,
                "'{}' replaced ({old_identity} -> {new_identity})",
                path.display()
            ),
        }
    }
}

impl std::error::Error for RotationError {}

// ---------------------------------------------------------------------------
// Subscriber errors
// ---------------------------------------------------------------------------

/// A subscription handler failed. Isolated to that subscription.
#[derive(Debug, Clone)]
pub enum SubscriberError {
    /// The handler returned an error.
    Handler { subscription: u64, reason: String },

    /// The handler panicked.
    Panicked { subscription: u64, message: String },
}

impl SubscriberError {
    /// Convenience constructor for handlers that fail with a message.
    pub fn handler(subscription: u64, reason: impl Into<String>) -> Self {
        Self::Handler {
            subscription,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler {
                subscription,
                reason,
            } => write!(f, "subscription {subscription}: handler failed: {reason}"),
            Self::Panicked {
                subscription,
                message,
            } => write!(f, "subscription {subscription}: handler panicked: {message}"),
        }
    }
}

impl std::error::Error for SubscriberError {}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors reading or writing the persisted cursor table.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error on the store file or its temp sibling.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },

    /// The table could not be serialised or deserialised.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The file was written by an incompatible version.
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
            Self::Json { path, source } => {
                write!(f, "malformed cursor table '{}': {source}", path.display())
            }
            Self::VersionMismatch {
                path,
                found,
                expected,
            } => write!(
                f,
                "cursor table '{}' has version {found}, expected {expected}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            Self::VersionMismatch { .. } => None,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Analysis errors
// ---------------------------------------------------------------------------

/// Errors raised by the analyzer pipeline itself (never by an analyzer).
#[derive(Debug)]
pub enum AnalysisError {
    /// No analyzer is registered under this name.
    UnknownAnalyzer { name: String },

    /// The window end precedes its start.
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// The worker pool could not be created.
    Pool(rayon::ThreadPoolBuildError),

    /// The cached computation failed or was abandoned.
    Cache(CacheError),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAnalyzer { name } => write!(f, "unknown analyzer '{name}'"),
            Self::InvalidWindow { start, end } => {
                write!(f, "window end {end} precedes start {start}")
            }
            Self::Pool(e) => write!(f, "cannot build analyzer pool: {e}"),
            Self::Cache(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pool(e) => Some(e),
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for AnalysisError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<AnalysisError> for CoreError {
    fn from(e: AnalysisError) -> Self {
        Self::Analysis(e)
    }
}

// ---------------------------------------------------------------------------
// Cache errors
// ---------------------------------------------------------------------------

/// A cached computation failed. Shared by every caller waiting on the key,
/// hence `Clone`. Failures are never stored in the cache.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// The compute function returned an error.
    ComputeFailed { key: String, reason: String },

    /// The computing caller panicked before producing a value.
    Abandoned { key: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComputeFailed { key, reason } => {
                write!(f, "computation for '{key}' failed: {reason}")
            }
            Self::Abandoned { key } => {
                write!(f, "computation for '{key}' was abandoned")
            }
        }
    }
}

impl std::error::Error for CacheError {}

impl From<CacheError> for CoreError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

// ---------------------------------------------------------------------------
// Filter errors
// ---------------------------------------------------------------------------

/// Errors related to filter operations.
#[derive(Debug)]
pub enum FilterError {
    /// Invalid regex pattern.
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegex { pattern, source } => {
                write!(f, "Invalid regex '{pattern}': {source}")
            }
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
        }
    }
}

impl From<FilterError> for CoreError {
    fn from(e: FilterError) -> Self {
        Self::Filter(e)
    }
}

// ---------------------------------------------------------------------------
// Export errors
// ---------------------------------------------------------------------------

/// Errors related to export operations.
#[derive(Debug)]
pub enum ExportError {
    /// I/O error writing the export file.
    Io { path: PathBuf, source: io::Error },

    /// CSV serialisation error.
    Csv { path: PathBuf, source: csv::Error },

    /// JSON serialisation error.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Export would exceed maximum row count.
    TooManyRows { count: usize, max: usize },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Export I/O error '{}': {source}", path.display())
            }
            Self::Csv { path, source } => {
                write!(f, "CSV export error '{}': {source}", path.display())
            }
            Self::Json { path, source } => {
                write!(f, "JSON export error '{}': {source}", path.display())
            }
            Self::TooManyRows { count, max } => write!(
                f,
                "Export of {count} rows exceeds maximum of {max}. \
                 Apply filters to reduce the result set."
            ),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Csv { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExportError> for CoreError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading and startup validation.
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing failed.
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A config value is out of the allowed range.
    ValueOutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    /// The watched directory is missing or unusable. Fatal at startup.
    InvalidWatchPath { path: PathBuf, reason: String },

    /// A glob pattern in the configuration does not compile.
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },

    /// I/O error reading config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TomlParse { path, source } => {
                write!(f, "Config parse error '{}': {source}", path.display())
            }
            Self::ValueOutOfRange {
                field,
                value,
                expected,
            } => write!(
                f,
                "Config '{field}' = '{value}' is out of range. Expected: {expected}"
            ),
            Self::InvalidWatchPath { path, reason } => {
                write!(f, "Watch path '{}' is not usable: {reason}", path.display())
            }
            Self::InvalidPattern { pattern, source } => {
                write!(f, "Invalid glob pattern '{pattern}': {source}")
            }
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TomlParse { source, .. } => Some(source),
            Self::InvalidPattern { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Convenience type alias for ConvStream results.
pub type Result<T> = std::result::Result<T, CoreError>;
