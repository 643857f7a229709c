// ConvStream - core/export.rs
//
// CSV and JSON export of conversation events and analysis results, for
// hand-off to an external long-term store.
// Core layer: writes to any Write trait object.

use crate::core::model::{AnalysisResult, ConversationEvent};
use crate::util::constants::MAX_EXPORT_ROWS;
use crate::util::error::ExportError;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Output format, chosen from the target file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    /// `.csv` -> CSV; everything else -> JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::Json,
        }
    }
}

fn check_rows(count: usize) -> Result<(), ExportError> {
    if count > MAX_EXPORT_ROWS {
        return Err(ExportError::TooManyRows {
            count,
            max: MAX_EXPORT_ROWS,
        });
    }
    Ok(())
}

/// Export events to CSV.
///
/// Writes: timestamp, type, agent_id, worker_id, task_id, message, metadata,
/// source_file, generation, line
pub fn export_events_csv<W: Write>(
    events: &[ConversationEvent],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    check_rows(events.len())?;
    let csv_err = |e: csv::Error| ExportError::Csv {
        path: export_path.to_path_buf(),
        source: e,
    };
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer
        .write_record([
            "timestamp",
            "type",
            "agent_id",
            "worker_id",
            "task_id",
            "message",
            "metadata",
            "source_file",
            "generation",
            "line",
        ])
        .map_err(csv_err)?;

    for e in events {
        let metadata = serde_json::Value::Object(e.metadata.clone()).to_string();
        csv_writer
            .write_record([
                e.timestamp.to_rfc3339().as_str(),
                e.event_type.as_str(),
                e.agent_id.as_deref().unwrap_or(""),
                e.worker_id.as_deref().unwrap_or(""),
                e.task_id.as_deref().unwrap_or(""),
                e.message.as_str(),
                metadata.as_str(),
                e.source.display().to_string().as_str(),
                e.key.generation.to_string().as_str(),
                e.key.line.to_string().as_str(),
            ])
            .map_err(csv_err)?;
    }

    csv_writer.flush().map_err(|e| ExportError::Io {
        path: export_path.to_path_buf(),
        source: e,
    })?;

    Ok(events.len())
}

/// Export events to JSON (array of objects).
pub fn export_events_json<W: Write>(
    events: &[ConversationEvent],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    check_rows(events.len())?;
    serde_json::to_writer_pretty(writer, events).map_err(|e| ExportError::Json {
        path: export_path.to_path_buf(),
        source: e,
    })?;
    Ok(events.len())
}

/// Export analysis results to CSV. Tags are written as `k=v;k2=v2`.
pub fn export_results_csv<W: Write>(
    results: &[AnalysisResult],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    check_rows(results.len())?;
    let csv_err = |e: csv::Error| ExportError::Csv {
        path: export_path.to_path_buf(),
        source: e,
    };
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer
        .write_record([
            "analyzer",
            "metric",
            "value",
            "tags",
            "window_start",
            "window_end",
            "computed_at",
        ])
        .map_err(csv_err)?;

    for r in results {
        let tags: Vec<String> = r.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        csv_writer
            .write_record([
                r.analyzer_name.as_str(),
                r.metric_name.as_str(),
                r.value.to_string().as_str(),
                tags.join(";").as_str(),
                r.window.start.to_rfc3339().as_str(),
                r.window.end.to_rfc3339().as_str(),
                r.computed_at.to_rfc3339().as_str(),
            ])
            .map_err(csv_err)?;
    }

    csv_writer.flush().map_err(|e| ExportError::Io {
        path: export_path.to_path_buf(),
        source: e,
    })?;

    Ok(results.len())
}

/// Export analysis results to JSON (array of objects).
pub fn export_results_json<W: Write>(
    results: &[AnalysisResult],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    check_rows(results.len())?;
    serde_json::to_writer_pretty(writer, results).map_err(|e| ExportError::Json {
        path: export_path.to_path_buf(),
        source: e,
    })?;
    Ok(results.len())
}

/// Write `results` to `path`, picking the format from the extension.
pub fn write_results_file(results: &[AnalysisResult], path: &Path) -> Result<usize, ExportError> {
    let file = create(path)?;
    let writer = std::io::BufWriter::new(file);
    match ExportFormat::from_path(path) {
        ExportFormat::Csv => export_results_csv(results, writer, path),
        ExportFormat::Json => export_results_json(results, writer, path),
    }
}

/// Write `events` to `path`, picking the format from the extension.
pub fn write_events_file(events: &[ConversationEvent], path: &Path) -> Result<usize, ExportError> {
    let file = create(path)?;
    let writer = std::io::BufWriter::new(file);
    match ExportFormat::from_path(path) {
        ExportFormat::Csv => export_events_csv(events, writer, path),
        ExportFormat::Json => export_events_json(events, writer, path),
    }
}

fn create(path: &Path) -> Result<std::fs::File, ExportError> {
    std::fs::File::create(path).map_err(|e| ExportError::Io {
        path: PathBuf::from(path),
        source: e,
    })
}
