// ConvStream - core/parser.rs
//
// Conversion of one raw log line into a `ConversationEvent`.
// Core layer: accepts `&str` lines, never touches the filesystem directly.
//
// Two line formats are accepted:
//   - primary: `{timestamp, type, agent_id?, worker_id?, task_id?, message, metadata?}`
//   - legacy:  `{timestamp, event, ...event-specific fields}` as written by the
//     older conversation logger (pm_thinking, kanban_interaction, ...)

use crate::core::model::{ConversationEvent, EventKey, EventType};
use crate::util::error::ParseError;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::{Map, Value};
use std::path::Path;

/// Position of the line being parsed. Becomes the event's idempotency key.
#[derive(Debug, Clone, Copy)]
pub struct LineContext<'a> {
    pub file: &'a Path,
    pub identity_key: &'a str,
    pub generation: u64,
    /// 1-based line number within the current generation.
    pub line_number: u64,
}

impl LineContext<'_> {
    fn key(&self) -> EventKey {
        EventKey {
            file: self.identity_key.to_string(),
            generation: self.generation,
            line: self.line_number,
        }
    }
}

/// Fields consumed by the primary format; everything else at the top level is
/// folded into `metadata`.
const PRIMARY_FIELDS: &[&str] = &[
    "timestamp",
    "type",
    "agent_id",
    "worker_id",
    "task_id",
    "message",
    "metadata",
];

/// Parse one line (without its trailing newline).
///
/// A missing or unparseable timestamp is an error: the event could not be
/// placed in any analysis window.
pub fn parse_line(line: &str, ctx: &LineContext<'_>) -> Result<ConversationEvent, ParseError> {
    let value: Value =
        serde_json::from_str(line.trim_end_matches('\r')).map_err(|source| {
            ParseError::InvalidJson {
                file: ctx.file.to_path_buf(),
                line_number: ctx.line_number,
                source,
            }
        })?;

    let Value::Object(obj) = value else {
        return Err(ParseError::NotAnObject {
            file: ctx.file.to_path_buf(),
            line_number: ctx.line_number,
        });
    };

    let raw_ts = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(ctx, "timestamp"))?;
    let timestamp = parse_timestamp(raw_ts).ok_or_else(|| ParseError::InvalidTimestamp {
        file: ctx.file.to_path_buf(),
        line_number: ctx.line_number,
        raw_timestamp: raw_ts.to_string(),
    })?;

    if obj.contains_key("event") && !obj.contains_key("type") {
        parse_legacy(obj, timestamp, ctx)
    } else {
        parse_primary(obj, timestamp, ctx)
    }
}

fn parse_primary(
    mut obj: Map<String, Value>,
    timestamp: DateTime<FixedOffset>,
    ctx: &LineContext<'_>,
) -> Result<ConversationEvent, ParseError> {
    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .map(EventType::parse)
        .ok_or_else(|| missing(ctx, "type"))?;

    let mut metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m,
        Some(_) => return Err(missing(ctx, "metadata")),
    };
    for (k, v) in obj.iter() {
        if !PRIMARY_FIELDS.contains(&k.as_str()) {
            metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    Ok(ConversationEvent {
        timestamp,
        event_type,
        agent_id: opt_string(&obj, "agent_id"),
        worker_id: opt_string(&obj, "worker_id"),
        task_id: opt_string(&obj, "task_id"),
        message: opt_string(&obj, "message").unwrap_or_default(),
        metadata,
        key: ctx.key(),
        source: ctx.file.to_path_buf(),
    })
}

fn parse_legacy(
    obj: Map<String, Value>,
    timestamp: DateTime<FixedOffset>,
    ctx: &LineContext<'_>,
) -> Result<ConversationEvent, ParseError> {
    let event_name = obj
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(ctx, "event"))?
        .to_string();
    let direction = opt_string(&obj, "conversation_type").unwrap_or_default();
    let task_id = opt_string(&obj, "task_id");

    // (type, field holding the message text)
    let (event_type, message) = match event_name.as_str() {
        "worker_communication" => {
            let t = if direction.contains("worker_to_pm") {
                EventType::WorkerToCoordinator
            } else {
                EventType::CoordinatorToWorker
            };
            (t, opt_string(&obj, "message").unwrap_or_default())
        }
        "pm_thinking" => (
            EventType::CoordinatorThinking,
            opt_string(&obj, "thought").unwrap_or_default(),
        ),
        "pm_decision" => (
            EventType::CoordinatorDecision,
            opt_string(&obj, "decision").unwrap_or_default(),
        ),
        "kanban_interaction" => {
            let t = if direction.contains("pm_to_kanban") {
                EventType::KanbanRequest
            } else {
                EventType::KanbanResponse
            };
            (t, opt_string(&obj, "action").unwrap_or_default())
        }
        "task_assignment" => (
            EventType::TaskAssignment,
            format!("Task {} assigned", task_id.as_deref().unwrap_or("unknown")),
        ),
        "progress_update" => {
            let progress = obj
                .get("progress")
                .map(value_text)
                .unwrap_or_else(|| "0".to_string());
            let msg = opt_string(&obj, "message").unwrap_or_default();
            (EventType::ProgressUpdate, format!("{progress}% - {msg}"))
        }
        "blocker_reported" => (
            EventType::Blocker,
            opt_string(&obj, "blocker_description").unwrap_or_default(),
        ),
        "system_state" => (EventType::SystemState, "System state update".to_string()),
        other => (
            EventType::parse(other),
            opt_string(&obj, "message").unwrap_or_default(),
        ),
    };

    let mut metadata = Map::new();
    if let Some(Value::Object(m)) = obj.get("metadata") {
        metadata.extend(m.clone());
    }
    if let Some(Value::Object(m)) = obj.get("context") {
        metadata.extend(m.clone());
    }
    for (k, v) in obj.iter() {
        match k.as_str() {
            "timestamp" | "event" | "agent_id" | "worker_id" | "task_id" | "metadata"
            | "context" => {}
            "confidence_score" => {
                metadata.insert("confidence".to_string(), v.clone());
            }
            _ => {
                metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
    }

    Ok(ConversationEvent {
        timestamp,
        event_type,
        agent_id: opt_string(&obj, "agent_id"),
        worker_id: opt_string(&obj, "worker_id"),
        task_id,
        message,
        metadata,
        key: ctx.key(),
        source: ctx.file.to_path_buf(),
    })
}

/// Parse an ISO-8601 timestamp.
///
/// Offset-carrying forms are kept as written. Naive forms (no offset) are
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt);
    }
    // RFC 3339 requires the `T`; loggers sometimes write a space instead.
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt);
    }

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(trimmed, fmt)
            .ok()
            .map(|ndt| ndt.and_utc().fixed_offset())
    })
}

fn missing(ctx: &LineContext<'_>, field: &'static str) -> ParseError {
    ParseError::MissingField {
        file: ctx.file.to_path_buf(),
        line_number: ctx.line_number,
        field,
    }
}

/// String field; numbers are accepted and rendered, null and empty are `None`.
fn opt_string(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx(line_number: u64) -> LineContext<'static> {
        LineContext {
            file: Path::new("/logs/conversations_2025_01_15.jsonl"),
            identity_key: "id-1",
            generation: 2,
            line_number,
        }
    }

    #[test]
    fn test_parse_primary_line() {
        let line = r#"{"timestamp":"2025-01-15T10:00:00+02:00","type":"task_assignment","agent_id":"agent_1","task_id":"T-1","message":"assigned","metadata":{"priority":"high"}}"#;
        let e = parse_line(line, &ctx(7)).unwrap();
        assert_eq!(e.event_type, EventType::TaskAssignment);
        assert_eq!(e.agent_id.as_deref(), Some("agent_1"));
        assert_eq!(e.task_id.as_deref(), Some("T-1"));
        assert_eq!(e.message, "assigned");
        assert_eq!(e.metadata_str("priority"), Some("high"));
        assert_eq!(
            e.timestamp_utc(),
            Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
        );
        assert_eq!(e.key.generation, 2);
        assert_eq!(e.key.line, 7);
        assert_eq!(e.key.file, "id-1");
    }

    #[test]
    fn test_extra_top_level_fields_fold_into_metadata() {
        let line = r#"{"timestamp":"2025-01-15T10:00:00Z","type":"coordinator_decision","message":"go","confidence":0.9,"metadata":{"confidence":0.4}}"#;
        let e = parse_line(line, &ctx(1)).unwrap();
        // Explicit metadata wins over a top-level duplicate.
        assert_eq!(e.metadata_f64("confidence"), Some(0.4));
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let line = r#"{"timestamp":"2025-01-15T10:00:00Z","type":"ping_request","message":"hi"}"#;
        let e = parse_line(line, &ctx(1)).unwrap();
        assert_eq!(e.event_type, EventType::Other("ping_request".to_string()));
        assert_eq!(e.topic(), "conversation.ping_request");
    }

    #[test]
    fn test_invalid_json_is_error() {
        let err = parse_line("{not json", &ctx(3)).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson { line_number: 3, .. }));
    }

    #[test]
    fn test_non_object_is_error() {
        let err = parse_line("[1,2,3]", &ctx(1)).unwrap_err();
        assert!(matches!(err, ParseError::NotAnObject { .. }));
    }

    #[test]
    fn test_missing_timestamp_is_error() {
        let err = parse_line(r#"{"type":"blocker","message":"x"}"#, &ctx(1)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField {
                field: "timestamp",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_type_is_error() {
        let err = parse_line(r#"{"timestamp":"2025-01-15T10:00:00Z"}"#, &ctx(1)).unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "type", .. }));
    }

    #[test]
    fn test_bad_timestamp_is_error() {
        let err = parse_line(
            r#"{"timestamp":"yesterday","type":"blocker","message":"x"}"#,
            &ctx(1),
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let ts = parse_timestamp("2025-01-15T10:00:00.123456").unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 0);
        let ts = parse_timestamp("2025-01-15 10:00:00").unwrap();
        assert_eq!(
            ts.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_crlf_line_accepted() {
        let line = "{\"timestamp\":\"2025-01-15T10:00:00Z\",\"type\":\"blocker\",\"message\":\"x\"}\r";
        assert!(parse_line(line, &ctx(1)).is_ok());
    }

    #[test]
    fn test_legacy_decision_line() {
        let line = r#"{"timestamp":"2025-01-15T10:00:00","event":"pm_decision","decision":"Assign T-2 to agent_2","rationale":"free","confidence_score":0.85}"#;
        let e = parse_line(line, &ctx(1)).unwrap();
        assert_eq!(e.event_type, EventType::CoordinatorDecision);
        assert_eq!(e.message, "Assign T-2 to agent_2");
        assert_eq!(e.metadata_f64("confidence"), Some(0.85));
        assert_eq!(e.metadata_str("rationale"), Some("free"));
    }

    #[test]
    fn test_legacy_worker_direction() {
        let up = r#"{"timestamp":"2025-01-15T10:00:00Z","event":"worker_communication","conversation_type":"worker_to_pm","worker_id":"w1","message":"ready"}"#;
        let down = r#"{"timestamp":"2025-01-15T10:00:00Z","event":"worker_communication","conversation_type":"pm_to_worker","worker_id":"w1","message":"go"}"#;
        assert_eq!(
            parse_line(up, &ctx(1)).unwrap().event_type,
            EventType::WorkerToCoordinator
        );
        let e = parse_line(down, &ctx(2)).unwrap();
        assert_eq!(e.event_type, EventType::CoordinatorToWorker);
        assert_eq!(e.actor(), Some("w1"));
    }

    #[test]
    fn test_legacy_kanban_and_blocker() {
        let kanban = r#"{"timestamp":"2025-01-15T10:00:00Z","event":"kanban_interaction","conversation_type":"kanban_to_pm","action":"list_tasks"}"#;
        let e = parse_line(kanban, &ctx(1)).unwrap();
        assert_eq!(e.event_type, EventType::KanbanResponse);
        assert_eq!(e.message, "list_tasks");

        let blocker = r#"{"timestamp":"2025-01-15T10:00:00Z","event":"blocker_reported","worker_id":"w2","task_id":"T-9","blocker_description":"db down","severity":"high"}"#;
        let e = parse_line(blocker, &ctx(2)).unwrap();
        assert_eq!(e.event_type, EventType::Blocker);
        assert_eq!(e.message, "db down");
        assert_eq!(e.metadata_str("severity"), Some("high"));
        assert_eq!(e.task_id.as_deref(), Some("T-9"));
    }

    #[test]
    fn test_legacy_progress_message() {
        let line = r#"{"timestamp":"2025-01-15T10:00:00Z","event":"progress_update","worker_id":"w1","task_id":"T-1","progress":50,"message":"halfway"}"#;
        let e = parse_line(line, &ctx(1)).unwrap();
        assert_eq!(e.event_type, EventType::ProgressUpdate);
        assert_eq!(e.message, "50% - halfway");
    }
}
