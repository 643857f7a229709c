// ConvStream - core/model.rs
//
// Core data model types. Pure data definitions with no I/O and no
// platform dependencies.
//
// These types are the shared vocabulary across all layers: the tailer
// produces them, the bus carries them, analyzers and the detector consume
// them, and the export module writes them out.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// Conversation events (normalised output of parsing)
// =============================================================================

/// One parsed log line. Immutable once constructed; shared read-only through
/// the replay buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationEvent {
    /// Instant the event was logged, with the offset it was written in.
    pub timestamp: DateTime<FixedOffset>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub agent_id: Option<String>,

    pub worker_id: Option<String>,

    pub task_id: Option<String>,

    pub message: String,

    /// Open key/value map carried verbatim from the line.
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Idempotency key `(file identity, generation, line number)`.
    pub key: EventKey,

    /// Path of the file the line was read from.
    pub source: PathBuf,
}

impl ConversationEvent {
    /// Timestamp normalised to UTC.
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }

    /// Bus topic for this event: `conversation.<type>`.
    pub fn topic(&self) -> String {
        format!(
            "{}.{}",
            crate::util::constants::TOPIC_CONVERSATION_PREFIX,
            self.event_type.as_str()
        )
    }

    /// Numeric metadata value, accepting numbers and numeric strings.
    pub fn metadata_f64(&self, field: &str) -> Option<f64> {
        match self.metadata.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String metadata value.
    pub fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field)?.as_str()
    }

    /// The agent this event is attributed to: `agent_id`, else `worker_id`.
    pub fn actor(&self) -> Option<&str> {
        self.agent_id.as_deref().or(self.worker_id.as_deref())
    }
}

// =============================================================================
// Event type
// =============================================================================

/// Kind of conversation event. Unknown strings are kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    WorkerToCoordinator,
    CoordinatorToWorker,
    CoordinatorThinking,
    CoordinatorDecision,
    KanbanRequest,
    KanbanResponse,
    TaskAssignment,
    TaskUpdate,
    ProgressUpdate,
    TaskCompleted,
    Blocker,
    SystemState,
    Other(String),
}

impl EventType {
    /// Returns all named variants in display order.
    pub fn all() -> &'static [EventType] {
        &[
            EventType::WorkerToCoordinator,
            EventType::CoordinatorToWorker,
            EventType::CoordinatorThinking,
            EventType::CoordinatorDecision,
            EventType::KanbanRequest,
            EventType::KanbanResponse,
            EventType::TaskAssignment,
            EventType::TaskUpdate,
            EventType::ProgressUpdate,
            EventType::TaskCompleted,
            EventType::Blocker,
            EventType::SystemState,
        ]
    }

    /// Parse a type string. Case-insensitive, `-` and `_` are equivalent,
    /// and the aliases written by older loggers map onto the named variants.
    pub fn parse(raw: &str) -> EventType {
        let norm = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "worker_to_coordinator" | "worker_to_pm" | "worker_message" => {
                EventType::WorkerToCoordinator
            }
            "coordinator_to_worker" | "pm_to_worker" => EventType::CoordinatorToWorker,
            "coordinator_thinking" | "pm_thinking" => EventType::CoordinatorThinking,
            "coordinator_decision" | "pm_decision" | "decision" => EventType::CoordinatorDecision,
            "kanban_request" | "pm_to_kanban" => EventType::KanbanRequest,
            "kanban_response" | "kanban_to_pm" => EventType::KanbanResponse,
            "task_assignment" | "task_assigned" => EventType::TaskAssignment,
            "task_update" | "task_status_update" => EventType::TaskUpdate,
            "progress_update" | "progress" => EventType::ProgressUpdate,
            "task_completed" | "task_complete" | "task_completion" => EventType::TaskCompleted,
            "blocker" | "blocker_report" | "blocker_reported" => EventType::Blocker,
            "system_state" => EventType::SystemState,
            // Topic segments cannot contain dots.
            _ => EventType::Other(norm.replace('.', "_")),
        }
    }

    /// Canonical snake_case name, also used as the topic segment.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::WorkerToCoordinator => "worker_to_coordinator",
            EventType::CoordinatorToWorker => "coordinator_to_worker",
            EventType::CoordinatorThinking => "coordinator_thinking",
            EventType::CoordinatorDecision => "coordinator_decision",
            EventType::KanbanRequest => "kanban_request",
            EventType::KanbanResponse => "kanban_response",
            EventType::TaskAssignment => "task_assignment",
            EventType::TaskUpdate => "task_update",
            EventType::ProgressUpdate => "progress_update",
            EventType::TaskCompleted => "task_completed",
            EventType::Blocker => "blocker",
            EventType::SystemState => "system_state",
            EventType::Other(s) => s,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// =============================================================================
// File identity, idempotency key, cursor
// =============================================================================

/// A tailed file: its path plus a marker that survives renames and changes
/// when a different file is placed at the same path (inode on Unix,
/// creation time elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub marker: String,
}

impl FileIdentity {
    /// Stable string key used in the cursor table and in event keys.
    pub fn key(&self) -> String {
        format!("{}|{}", self.path.display(), self.marker)
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Idempotency key of a delivered event. Unique across generations of a file,
/// stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub file: String,
    pub generation: u64,
    pub line: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}:{}", self.file, self.generation, self.line)
    }
}

/// Read position within a tailed file.
///
/// `byte_offset` is always the first byte after a newline (or 0), and never
/// decreases within a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    pub identity: FileIdentity,
    pub byte_offset: u64,
    /// Number of complete lines consumed so far in this generation.
    pub line_number: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub generation: u64,
    /// When the file was last found missing; `None` while it is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached_at: Option<DateTime<Utc>>,
}

impl FileCursor {
    /// Fresh cursor at the start of a file.
    pub fn new(identity: FileIdentity, generation: u64) -> Self {
        Self {
            identity,
            byte_offset: 0,
            line_number: 0,
            last_modified: None,
            generation,
            detached_at: None,
        }
    }

    /// Start a new generation at offset 0.
    pub fn reset(&mut self) {
        self.byte_offset = 0;
        self.line_number = 0;
        self.generation += 1;
    }
}

// =============================================================================
// Rotation markers
// =============================================================================

/// Why a file's cursor was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// The file shrank below the cursor.
    Truncated,
    /// A new file (different identity) appeared at the tracked path.
    Replaced,
}

/// Published on `tailer.rotation` whenever a file starts a new generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationMarker {
    pub file_identity: String,
    pub path: PathBuf,
    pub previous_generation: u64,
    pub new_generation: u64,
    pub reason: RotationReason,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Analysis results
// =============================================================================

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` leading up to `end`.
    pub fn trailing(end: DateTime<Utc>, hours: i64) -> Self {
        Self {
            start: end - Duration::hours(hours),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.end >= self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One metric produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub analyzer_name: String,
    pub metric_name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub window: TimeWindow,
    pub computed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Identifies the metric series this result belongs to: metric name plus
    /// its tags in sorted order.
    pub fn series_key(&self) -> String {
        series_key(&self.metric_name, &self.tags)
    }
}

/// `metric{k=v,k2=v2}` with tags in key order; bare metric name when untagged.
pub fn series_key(metric_name: &str, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return metric_name.to_string();
    }
    let joined: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{metric_name}{{{}}}", joined.join(","))
}

// =============================================================================
// Anomalies
// =============================================================================

/// Severity of a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

impl AnomalySeverity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// The detection method that produced an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ZScore,
    MovingAverageRatio,
}

impl DetectionMethod {
    /// Topic segment and display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZScore => "z_score",
            Self::MovingAverageRatio => "moving_average_ratio",
        }
    }

    /// Bus topic: `anomaly.<method>`.
    pub fn topic(&self) -> String {
        format!(
            "{}.{}",
            crate::util::constants::TOPIC_ANOMALY_PREFIX,
            self.as_str()
        )
    }
}

/// Range of values considered normal by the detection method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExpectedRange {
    pub low: f64,
    pub high: f64,
}

/// One detection. Published once on `anomaly.<method>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRecord {
    pub metric_name: String,
    pub tags: BTreeMap<String, String>,
    pub severity: AnomalySeverity,
    pub observed_value: f64,
    pub expected_range: ExpectedRange,
    pub method: DetectionMethod,
    /// z for the z-score method, short/long ratio for the moving average.
    pub score: f64,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Bus envelopes
// =============================================================================

/// Anything that travels over the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BusPayload {
    Conversation(ConversationEvent),
    Rotation(RotationMarker),
    Analysis(AnalysisResult),
    Anomaly(AnomalyRecord),
}

impl BusPayload {
    /// The payload's own timestamp, used by replay.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BusPayload::Conversation(e) => e.timestamp_utc(),
            BusPayload::Rotation(r) => r.detected_at,
            BusPayload::Analysis(a) => a.computed_at,
            BusPayload::Anomaly(a) => a.detected_at,
        }
    }

    /// Default topic for this payload.
    pub fn topic(&self) -> String {
        use crate::util::constants::{TOPIC_ANALYSIS_PREFIX, TOPIC_ROTATION};
        match self {
            BusPayload::Conversation(e) => e.topic(),
            BusPayload::Rotation(_) => TOPIC_ROTATION.to_string(),
            BusPayload::Analysis(a) => format!("{TOPIC_ANALYSIS_PREFIX}.{}", a.analyzer_name),
            BusPayload::Anomaly(a) => a.method.topic(),
        }
    }

    pub fn as_conversation(&self) -> Option<&ConversationEvent> {
        match self {
            BusPayload::Conversation(e) => Some(e),
            _ => None,
        }
    }
}

/// A payload as stored in the replay buffer and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEnvelope {
    /// Bus-wide publish sequence, starting at 1.
    pub sequence: u64,
    pub topic: String,
    pub published_at: DateTime<Utc>,
    pub payload: BusPayload,
}
