// ConvStream - app/tail.rs
//
// Log tailer: discovers conversation logs, reads newly appended complete
// lines, parses them and publishes events to the bus.
//
// Architecture:
//   - `LogTailer` holds per-file state and is driven by one thread at a time
//     (`spawn_tailer` for the live loop, or `ingest_all` for one-shot runs).
//   - A cursor's `byte_offset` always sits on a line boundary. A trailing
//     fragment without `\n` is simply not consumed; it is re-read on the next
//     tick once the writer finishes the line.
//   - After each batch the cursor is stored and the table saved atomically.
//     Events are published before the cursor is saved, so a crash between the
//     two re-delivers (at-least-once); consumers dedupe on `EventKey`.
//
// Failure handling:
//   - Malformed lines are counted, previewed in the log, and skipped.
//   - Stat/read failures back off exponentially per file; after
//     `degraded_after_failures` consecutive failures the file is reported as
//     degraded while polling continues.
//   - Size below the read position means truncation: new generation from
//     offset 0.
//     A new identity at a tracked path means replacement: the old cursor is
//     retired and the new file starts at generation + 1.
//   - A file that disappears keeps its cursor for `cursor_retention`, so a
//     return under the same identity resumes; older cursors are pruned.
//   - MAX_TAIL_READ_BYTES_PER_TICK caps bytes consumed per file per tick.
//     A single line longer than MAX_TAIL_PARTIAL_BYTES is skipped as one
//     parse error.

use crate::app::bus::EventBus;
use crate::app::positions::PositionStore;
use crate::core::discovery::{self, DiscoveryConfig};
use crate::core::model::{BusPayload, FileCursor, FileIdentity, RotationMarker, RotationReason};
use crate::core::parser::{self, LineContext};
use crate::platform::fs as pfs;
use crate::util::cancel::CancelToken;
use crate::util::constants::{
    DEBUG_MAX_LINE_PREVIEW, DEFAULT_CURSOR_RETENTION_HOURS, DEFAULT_DEGRADED_AFTER_FAILURES,
    DEFAULT_DISCOVER_INTERVAL_MS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_MS,
    MAX_TAIL_PARTIAL_BYTES, MAX_TAIL_READ_BYTES_PER_TICK,
};
use crate::util::error::{ParseError, RotationError, TailError};
use crate::util::logging::preview;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Directory holding the conversation logs.
    pub watch_dir: PathBuf,
    pub discovery: DiscoveryConfig,
    pub poll_interval: Duration,
    pub discover_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub degraded_after_failures: u32,
    /// How long a vanished file's cursor is kept for a possible return.
    pub cursor_retention: chrono::Duration,
}

impl TailerConfig {
    /// Defaults for `watch_dir`.
    pub fn new(watch_dir: PathBuf) -> Self {
        Self {
            watch_dir,
            discovery: DiscoveryConfig::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            discover_interval: Duration::from_millis(DEFAULT_DISCOVER_INTERVAL_MS),
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            degraded_after_failures: DEFAULT_DEGRADED_AFTER_FAILURES,
            cursor_retention: chrono::Duration::hours(DEFAULT_CURSOR_RETENTION_HOURS),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures:
    /// `base * 2^(failures-1)`, capped at `retry_max`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.retry_base
            .checked_mul(factor)
            .map_or(self.retry_max, |d| d.min(self.retry_max))
    }
}

// =============================================================================
// Status (shared with health reporting)
// =============================================================================

/// Per-file counters exposed through health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHealth {
    pub path: PathBuf,
    pub identity: String,
    pub generation: u64,
    pub byte_offset: u64,
    pub line_number: u64,
    pub events: u64,
    pub parse_errors: u64,
    pub io_errors: u64,
    pub rotations: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
}

/// Snapshot of the tailer, refreshed after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TailerStatus {
    pub files: Vec<FileHealth>,
    pub events_total: u64,
    pub parse_errors_total: u64,
    pub last_discovery_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl TailerStatus {
    pub fn any_degraded(&self) -> bool {
        self.files.iter().any(|f| f.degraded)
    }
}

/// What a single `poll` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Events published.
    pub events: usize,
    /// Lines that failed to parse.
    pub parse_errors: usize,
    /// Bytes consumed (cursor advance).
    pub bytes: u64,
    /// Set when the file was found truncated.
    pub rotation: Option<RotationReason>,
    /// The file is waiting out a retry delay and was not read.
    pub backing_off: bool,
    /// More complete data remained beyond the per-tick cap.
    pub more_pending: bool,
}

// =============================================================================
// Per-file state
// =============================================================================

#[derive(Debug)]
struct TrackedFile {
    cursor: FileCursor,
    identity_key: String,
    /// Scan position inside a line longer than MAX_TAIL_PARTIAL_BYTES. The
    /// cursor stays at the line start until its newline is found.
    skip_from: Option<u64>,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    events: u64,
    parse_errors: u64,
    io_errors: u64,
    rotations: u64,
    last_error: Option<String>,
}

impl TrackedFile {
    fn new(cursor: FileCursor) -> Self {
        Self {
            identity_key: cursor.identity.key(),
            cursor,
            skip_from: None,
            consecutive_failures: 0,
            retry_at: None,
            events: 0,
            parse_errors: 0,
            io_errors: 0,
            rotations: 0,
            last_error: None,
        }
    }

    fn health(&self, degraded_after: u32) -> FileHealth {
        FileHealth {
            path: self.cursor.identity.path.clone(),
            identity: self.identity_key.clone(),
            generation: self.cursor.generation,
            byte_offset: self.cursor.byte_offset,
            line_number: self.cursor.line_number,
            events: self.events,
            parse_errors: self.parse_errors,
            io_errors: self.io_errors,
            rotations: self.rotations,
            consecutive_failures: self.consecutive_failures,
            degraded: self.consecutive_failures >= degraded_after,
            last_error: self.last_error.clone(),
        }
    }
}

// =============================================================================
// LogTailer
// =============================================================================

#[derive(Debug)]
pub struct LogTailer {
    config: TailerConfig,
    store: Arc<PositionStore>,
    bus: Arc<EventBus>,
    files: BTreeMap<PathBuf, TrackedFile>,
    status: Arc<RwLock<TailerStatus>>,
    last_discovery_error: Option<String>,
}

impl LogTailer {
    pub fn new(config: TailerConfig, store: Arc<PositionStore>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            store,
            bus,
            files: BTreeMap::new(),
            status: Arc::new(RwLock::new(TailerStatus::default())),
            last_discovery_error: None,
        }
    }

    pub fn config(&self) -> &TailerConfig {
        &self.config
    }

    /// Shared handle to the status snapshot.
    pub fn status_handle(&self) -> Arc<RwLock<TailerStatus>> {
        Arc::clone(&self.status)
    }

    /// Paths currently tracked, in path order.
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    /// Current cursor of a tracked path.
    pub fn cursor(&self, path: &Path) -> Option<&FileCursor> {
        self.files.get(path).map(|f| &f.cursor)
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    /// List the watched directory and start tracking new files.
    ///
    /// New files resume from a persisted cursor for their identity, or start
    /// at offset 0. Tracked paths that now hold a different file are treated
    /// as replaced. Returns the number of newly tracked files.
    pub fn discover(&mut self) -> Result<usize, TailError> {
        let outcome = match discovery::discover_files(&self.config.watch_dir, &self.config.discovery)
        {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "Discovery failed");
                self.last_discovery_error = Some(e.to_string());
                return Err(e);
            }
        };
        self.last_discovery_error = None;
        for w in &outcome.warnings {
            tracing::warn!("{}", w);
        }

        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        let mut added = 0usize;

        for found in outcome.files {
            let meta = match std::fs::metadata(&found.path) {
                Ok(m) => m,
                Err(e) => {
                    // Vanished between listing and stat; next round will tell.
                    tracing::debug!(file = %found.path.display(), error = %e, "Discovery: stat failed");
                    continue;
                }
            };
            let identity = FileIdentity {
                path: found.path.clone(),
                marker: pfs::identity_marker(&meta),
            };
            seen.insert(found.path.clone());

            match self.files.get(&found.path) {
                Some(tracked) if tracked.cursor.identity == identity => {}
                Some(_) => self.replace(&found.path, identity),
                None => {
                    self.track(identity);
                    added += 1;
                }
            }
        }

        let gone: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| !seen.contains(*p))
            .cloned()
            .collect();
        for path in gone {
            if let Some(f) = self.files.remove(&path) {
                // Cursor stays in the store so a reappearing file resumes.
                self.store.upsert(f.cursor);
                tracing::info!(file = %path.display(), "File no longer present; stopped tracking");
            }
        }

        let tracked: BTreeSet<String> = self.files.values().map(|f| f.identity_key.clone()).collect();
        let pruned = self
            .store
            .prune_detached(&tracked, Utc::now(), self.config.cursor_retention);
        if pruned > 0 {
            tracing::info!(pruned, "Dropped cursors of files gone longer than the retention period");
        }

        if added > 0 {
            tracing::info!(
                added,
                tracked = self.files.len(),
                total_found = outcome.total_found,
                "Discovery: new files tracked"
            );
        }
        Ok(added)
    }

    /// Start tracking `identity`, resuming a persisted cursor when one exists.
    fn track(&mut self, identity: FileIdentity) {
        let key = identity.key();
        let path = identity.path.clone();

        let cursor = if let Some(mut saved) = self.store.get(&key) {
            tracing::info!(
                file = %path.display(),
                offset = saved.byte_offset,
                line = saved.line_number,
                generation = saved.generation,
                "Resuming from persisted cursor"
            );
            saved.detached_at = None;
            saved
        } else if let Some(previous) = self.store.latest_for_path(&path) {
            // Same path, different file: replaced while we were not looking.
            let cursor = FileCursor::new(identity, previous.generation + 1);
            self.store.remove(&previous.identity.key());
            self.announce_rotation(&previous, &cursor, RotationReason::Replaced);
            cursor
        } else {
            tracing::info!(file = %path.display(), "Tracking new file");
            FileCursor::new(identity, 1)
        };

        self.store.upsert(cursor.clone());
        self.files.insert(path, TrackedFile::new(cursor));
    }

    /// Retire the tracked file at `path` and start `identity` at the next
    /// generation.
    fn replace(&mut self, path: &Path, identity: FileIdentity) {
        let Some(old) = self.files.remove(path) else {
            self.track(identity);
            return;
        };
        let cursor = FileCursor::new(identity, old.cursor.generation + 1);
        self.store.remove(&old.identity_key);
        self.announce_rotation(&old.cursor, &cursor, RotationReason::Replaced);

        let mut tracked = TrackedFile::new(cursor.clone());
        tracked.events = old.events;
        tracked.parse_errors = old.parse_errors;
        tracked.io_errors = old.io_errors;
        tracked.rotations = old.rotations + 1;
        self.store.upsert(cursor);
        self.files.insert(path.to_path_buf(), tracked);
    }

    fn announce_rotation(&self, old: &FileCursor, new: &FileCursor, reason: RotationReason) {
        let notice = match reason {
            RotationReason::Truncated => RotationError::Truncated {
                path: new.identity.path.clone(),
                previous_offset: old.byte_offset,
                new_size: 0,
            },
            RotationReason::Replaced => RotationError::Replaced {
                path: new.identity.path.clone(),
                old_identity: old.identity.marker.clone(),
                new_identity: new.identity.marker.clone(),
            },
        };
        tracing::info!(
            notice = %notice,
            previous_generation = old.generation,
            new_generation = new.generation,
            "Rotation detected; starting new generation"
        );
        self.bus.emit(BusPayload::Rotation(RotationMarker {
            file_identity: new.identity.key(),
            path: new.identity.path.clone(),
            previous_generation: old.generation,
            new_generation: new.generation,
            reason,
            detected_at: Utc::now(),
        }));
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// Read and publish whatever complete lines were appended to `path` since
    /// its cursor.
    pub fn poll(&mut self, path: &Path) -> Result<PollOutcome, TailError> {
        let now = Instant::now();
        match self.files.get(path) {
            None => return Ok(PollOutcome::default()),
            Some(f) if f.retry_at.is_some_and(|t| now < t) => {
                return Ok(PollOutcome {
                    backing_off: true,
                    ..PollOutcome::default()
                })
            }
            Some(_) => {}
        }

        let result = self.poll_inner(path);
        match &result {
            Ok(_) => self.record_success(path),
            Err(e) => self.record_failure(path, e),
        }
        result
    }

    fn poll_inner(&mut self, path: &Path) -> Result<PollOutcome, TailError> {
        let meta = std::fs::metadata(path).map_err(|source| TailError::Stat {
            path: path.to_path_buf(),
            source,
        })?;

        // Rename-based rotation between discovery rounds.
        let marker = pfs::identity_marker(&meta);
        let replaced = self
            .files
            .get(path)
            .is_some_and(|f| f.cursor.identity.marker != marker);
        if replaced {
            self.replace(
                path,
                FileIdentity {
                    path: path.to_path_buf(),
                    marker,
                },
            );
        }

        let size = meta.len();
        let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::<Utc>::from);
        let mut outcome = PollOutcome::default();

        if replaced {
            outcome.rotation = Some(RotationReason::Replaced);
        }

        // Truncation: size dropped below the furthest position already read,
        // which is the skip position while an oversized line is being skipped.
        let truncated = self
            .files
            .get(path)
            .is_some_and(|f| size < f.skip_from.unwrap_or(f.cursor.byte_offset));
        if truncated {
            if let Some(f) = self.files.get_mut(path) {
                let old = f.cursor.clone();
                let previous_offset = f.skip_from.unwrap_or(old.byte_offset);
                f.cursor.reset();
                f.skip_from = None;
                f.rotations += 1;
                let notice = RotationError::Truncated {
                    path: path.to_path_buf(),
                    previous_offset,
                    new_size: size,
                };
                tracing::info!(notice = %notice, "Truncation detected");
                let new = f.cursor.clone();
                self.store.upsert(new.clone());
                self.announce_rotation(&old, &new, RotationReason::Truncated);
            }
            outcome.rotation = Some(RotationReason::Truncated);
        }

        let Some(file) = self.files.get_mut(path) else {
            return Ok(outcome);
        };
        file.cursor.last_modified = modified;

        let read_start = file.skip_from.unwrap_or(file.cursor.byte_offset);
        if size <= read_start {
            self.store.upsert(file.cursor.clone());
            return Ok(outcome);
        }

        let mut chunk = read_chunk(path, read_start, MAX_TAIL_READ_BYTES_PER_TICK)?;
        if file.skip_from.is_none()
            && chunk.len() == MAX_TAIL_READ_BYTES_PER_TICK
            && !chunk.contains(&b'\n')
        {
            // A line longer than one tick's read: look further before giving up.
            chunk = read_chunk(path, read_start, MAX_TAIL_PARTIAL_BYTES)?;
            if chunk.len() == MAX_TAIL_PARTIAL_BYTES && !chunk.contains(&b'\n') {
                tracing::warn!(
                    file = %path.display(),
                    line = file.cursor.line_number + 1,
                    max_bytes = MAX_TAIL_PARTIAL_BYTES,
                    "Line exceeds maximum length; skipping it"
                );
                let skip_to = read_start + chunk.len() as u64;
                file.skip_from = Some(skip_to);
                outcome.more_pending = size > skip_to;
                return Ok(outcome);
            }
        }

        let before = file.cursor.byte_offset;
        let mut pos = 0usize;

        // Finish skipping an oversized line.
        if let Some(skip_start) = file.skip_from {
            match chunk.iter().position(|b| *b == b'\n') {
                None => {
                    let skip_to = skip_start + chunk.len() as u64;
                    file.skip_from = Some(skip_to);
                    outcome.more_pending = size > skip_to;
                    return Ok(outcome);
                }
                Some(nl) => {
                    file.skip_from = None;
                    file.cursor.line_number += 1;
                    file.cursor.byte_offset = skip_start + nl as u64 + 1;
                    file.parse_errors += 1;
                    outcome.parse_errors += 1;
                    let err = ParseError::LineTooLong {
                        file: path.to_path_buf(),
                        line_number: file.cursor.line_number,
                        max_bytes: MAX_TAIL_PARTIAL_BYTES,
                    };
                    tracing::warn!(
                        file = %path.display(),
                        line = file.cursor.line_number,
                        error = %err,
                        "Skipped oversized line"
                    );
                    pos = nl + 1;
                }
            }
        }

        let identity_key = file.identity_key.clone();
        let base = read_start;
        while let Some(rel) = chunk[pos..].iter().position(|b| *b == b'\n') {
            let line_bytes = &chunk[pos..pos + rel];
            pos += rel + 1;
            file.cursor.line_number += 1;
            file.cursor.byte_offset = base + pos as u64;

            let text = String::from_utf8_lossy(line_bytes);
            if text.trim().is_empty() {
                continue;
            }

            let ctx = LineContext {
                file: path,
                identity_key: &identity_key,
                generation: file.cursor.generation,
                line_number: file.cursor.line_number,
            };
            match parser::parse_line(&text, &ctx) {
                Ok(event) => {
                    let topic = event.topic();
                    self.bus.publish(&topic, BusPayload::Conversation(event));
                    file.events += 1;
                    outcome.events += 1;
                }
                Err(e) => {
                    file.parse_errors += 1;
                    outcome.parse_errors += 1;
                    tracing::warn!(
                        file = %path.display(),
                        line = file.cursor.line_number,
                        error = %e,
                        preview = %preview(&text, DEBUG_MAX_LINE_PREVIEW),
                        "Skipping unparseable line"
                    );
                }
            }
        }

        outcome.bytes = file.cursor.byte_offset - before;
        outcome.more_pending = size > read_start + chunk.len() as u64;

        if outcome.events > 0 || outcome.parse_errors > 0 {
            tracing::debug!(
                file = %path.display(),
                events = outcome.events,
                parse_errors = outcome.parse_errors,
                offset = file.cursor.byte_offset,
                generation = file.cursor.generation,
                "Tail batch"
            );
        }

        self.store.upsert(file.cursor.clone());
        Ok(outcome)
    }

    fn record_success(&mut self, path: &Path) {
        let degraded_after = self.config.degraded_after_failures;
        if let Some(f) = self.files.get_mut(path) {
            if f.consecutive_failures >= degraded_after {
                tracing::info!(file = %path.display(), "File recovered");
            }
            f.consecutive_failures = 0;
            f.retry_at = None;
        }
    }

    fn record_failure(&mut self, path: &Path, err: &TailError) {
        let Some(f) = self.files.get_mut(path) else {
            return;
        };
        f.consecutive_failures += 1;
        f.io_errors += 1;
        f.last_error = Some(err.to_string());
        let delay = self.config.backoff(f.consecutive_failures);
        f.retry_at = Some(Instant::now() + delay);

        if f.consecutive_failures == self.config.degraded_after_failures {
            tracing::warn!(
                file = %path.display(),
                failures = f.consecutive_failures,
                error = %err,
                "File marked degraded; polling continues"
            );
        } else {
            tracing::debug!(
                file = %path.display(),
                failures = f.consecutive_failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Tail I/O failure; backing off"
            );
        }
    }

    /// Poll every tracked file once, then save the cursor table.
    pub fn poll_all(&mut self) -> PollOutcome {
        let mut total = PollOutcome::default();
        for path in self.tracked_paths() {
            match self.poll(&path) {
                Ok(o) => {
                    total.events += o.events;
                    total.parse_errors += o.parse_errors;
                    total.bytes += o.bytes;
                    total.more_pending |= o.more_pending;
                    if o.rotation.is_some() {
                        total.rotation = o.rotation;
                    }
                }
                Err(_) => {
                    // Recorded in per-file state; the other files carry on.
                }
            }
        }
        self.persist();
        self.refresh_status();
        total
    }

    /// Discover, then poll until every file is drained to its last complete
    /// line. Used for one-shot ingestion.
    pub fn ingest_all(&mut self) -> Result<PollOutcome, TailError> {
        self.discover()?;
        let mut total = PollOutcome::default();
        loop {
            let o = self.poll_all();
            total.events += o.events;
            total.parse_errors += o.parse_errors;
            total.bytes += o.bytes;
            if !o.more_pending {
                break;
            }
        }
        Ok(total)
    }

    /// Save the cursor table. Failures are logged; the next batch retries.
    pub fn persist(&self) {
        if let Err(e) = self.store.save() {
            tracing::warn!(error = %e, "Failed to persist cursor table");
        }
    }

    /// Publish a fresh status snapshot.
    pub fn refresh_status(&self) {
        let degraded_after = self.config.degraded_after_failures;
        let files: Vec<FileHealth> = self
            .files
            .values()
            .map(|f| f.health(degraded_after))
            .collect();
        let snapshot = TailerStatus {
            events_total: files.iter().map(|f| f.events).sum(),
            parse_errors_total: files.iter().map(|f| f.parse_errors).sum(),
            files,
            last_discovery_error: self.last_discovery_error.clone(),
            last_poll_at: Some(Utc::now()),
        };
        match self.status.write() {
            Ok(mut s) => *s = snapshot,
            Err(p) => *p.into_inner() = snapshot,
        }
    }
}

/// Read from `offset`, retrying once on a transient error.
fn read_chunk(path: &Path, offset: u64, max_bytes: usize) -> Result<Vec<u8>, TailError> {
    match pfs::read_from(path, offset, max_bytes) {
        Ok(b) => Ok(b),
        Err(e) if pfs::is_transient(&e) => {
            pfs::read_from(path, offset, max_bytes).map_err(|source| TailError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(TailError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// =============================================================================
// Background loop
// =============================================================================

/// Run the tailer on a background thread until `cancel` fires.
///
/// Discovery runs every `discover_interval`, polling every `poll_interval`.
/// On cancel the current batch finishes, the cursor table is saved, and the
/// thread exits.
pub fn spawn_tailer(
    tailer: Arc<Mutex<LogTailer>>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("convstream-tailer".to_string())
        .spawn(move || run_tailer(&tailer, &cancel))
}

fn run_tailer(tailer: &Mutex<LogTailer>, cancel: &CancelToken) {
    let lock = || tailer.lock().unwrap_or_else(|p| p.into_inner());
    let (poll_interval, discover_interval) = {
        let t = lock();
        (t.config.poll_interval, t.config.discover_interval)
    };
    tracing::info!(
        poll_ms = poll_interval.as_millis() as u64,
        discover_ms = discover_interval.as_millis() as u64,
        "Tailer started"
    );

    let mut last_discovery: Option<Instant> = None;
    loop {
        {
            let mut t = lock();
            if last_discovery.map_or(true, |at| at.elapsed() >= discover_interval) {
                // Errors are logged and reflected in status; polling continues.
                let _ = t.discover();
                last_discovery = Some(Instant::now());
            }
            t.poll_all();
        }
        if cancel.sleep(poll_interval) {
            break;
        }
    }

    let t = lock();
    t.persist();
    t.refresh_status();
    tracing::info!("Tailer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::topic::TopicPattern;
    use std::io::Write;

    fn line(n: u64) -> String {
        format!(
            "{{\"timestamp\":\"2025-01-15T10:{:02}:00+00:00\",\"type\":\"progress_update\",\"agent_id\":\"a1\",\"message\":\"step {n}\"}}\n",
            n % 60
        )
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn setup() -> (tempfile::TempDir, PathBuf, LogTailer, Arc<EventBus>) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conversations_2025_01_15.jsonl");
        let bus = Arc::new(EventBus::default());
        let tailer = LogTailer::new(
            TailerConfig::new(dir.path().to_path_buf()),
            Arc::new(PositionStore::in_memory()),
            Arc::clone(&bus),
        );
        (dir, file, tailer, bus)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = TailerConfig::new(PathBuf::from("."));
        assert_eq!(cfg.backoff(1), Duration::from_millis(250));
        assert_eq!(cfg.backoff(2), Duration::from_millis(500));
        assert_eq!(cfg.backoff(4), Duration::from_millis(2_000));
        assert_eq!(cfg.backoff(20), Duration::from_millis(30_000));
        assert_eq!(cfg.backoff(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_partial_line_withheld_until_complete() {
        let (_dir, file, mut tailer, bus) = setup();
        let sub = bus.subscribe(TopicPattern::all());
        let full = line(1);
        let (head, tail) = full.split_at(20);
        append(&file, head);
        tailer.discover().unwrap();

        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.events, 0);
        assert_eq!(tailer.cursor(&file).unwrap().byte_offset, 0);

        append(&file, tail);
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.events, 1);
        assert_eq!(tailer.cursor(&file).unwrap().byte_offset, full.len() as u64);
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn test_blank_and_malformed_lines() {
        let (_dir, file, mut tailer, _bus) = setup();
        append(&file, &line(1));
        append(&file, "\n");
        append(&file, "{not json}\n");
        append(&file, &line(4));
        tailer.discover().unwrap();
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.events, 2);
        assert_eq!(o.parse_errors, 1);
        assert_eq!(tailer.cursor(&file).unwrap().line_number, 4);
    }

    #[test]
    fn test_truncation_starts_new_generation() {
        let (_dir, file, mut tailer, bus) = setup();
        let rotations = bus.subscribe("tailer.rotation");
        append(&file, &format!("{}{}{}", line(1), line(2), line(3)));
        tailer.discover().unwrap();
        tailer.poll(&file).unwrap();
        assert_eq!(tailer.cursor(&file).unwrap().generation, 1);

        std::fs::write(&file, line(9)).unwrap();
        let events = bus.subscribe("conversation.#");
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.rotation, Some(RotationReason::Truncated));
        assert_eq!(o.events, 1);

        let c = tailer.cursor(&file).unwrap();
        assert_eq!((c.generation, c.line_number), (2, 1));
        let env = events.try_recv().unwrap();
        let ev = env.payload.as_conversation().unwrap();
        assert_eq!((ev.key.generation, ev.key.line), (2, 1));
        assert_eq!(rotations.drain().len(), 1);
    }

    #[test]
    fn test_truncation_while_skipping_oversized_line() {
        let (_dir, file, mut tailer, bus) = setup();
        append(&file, &"x".repeat(MAX_TAIL_PARTIAL_BYTES + 10));
        tailer.discover().unwrap();
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.events, 0);
        assert!(tailer.files[&file].skip_from.is_some());

        // Copy-truncate: same inode, shorter content.
        std::fs::write(&file, format!("{}{}{}", line(1), line(2), line(3))).unwrap();
        let rotations = bus.subscribe("tailer.rotation");
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.rotation, Some(RotationReason::Truncated));
        assert_eq!(o.events, 3);

        let c = tailer.cursor(&file).unwrap();
        assert_eq!((c.generation, c.line_number), (2, 3));
        assert!(tailer.files[&file].skip_from.is_none());
        let marker = rotations.try_recv().unwrap();
        match &marker.payload {
            BusPayload::Rotation(r) => {
                assert_eq!((r.previous_generation, r.new_generation), (1, 2));
            }
            other => panic!("expected rotation marker, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_line_skipped_and_numbering_kept() {
        let (_dir, file, mut tailer, bus) = setup();
        let events = bus.subscribe("conversation.#");
        let huge = "x".repeat(MAX_TAIL_PARTIAL_BYTES + 10);
        append(&file, &format!("{}{huge}\n{}", line(1), line(3)));

        let o = tailer.ingest_all().unwrap();
        assert_eq!(o.events, 2);
        assert_eq!(o.parse_errors, 1);

        let c = tailer.cursor(&file).unwrap();
        assert_eq!(c.line_number, 3);
        assert_eq!(c.byte_offset, std::fs::metadata(&file).unwrap().len());
        let lines: Vec<u64> = events
            .drain()
            .iter()
            .filter_map(|e| e.payload.as_conversation().map(|ev| ev.key.line))
            .collect();
        assert_eq!(lines, vec![1, 3]);
        assert_eq!(tailer.files[&file].parse_errors, 1);
    }

    #[test]
    fn test_rename_replacement_starts_new_generation() {
        let (dir, file, mut tailer, bus) = setup();
        append(&file, &format!("{}{}{}", line(1), line(2), line(3)));
        tailer.discover().unwrap();
        tailer.poll(&file).unwrap();
        let old_key = tailer.cursor(&file).unwrap().identity.key();

        // New file created alongside, then renamed over the tracked path.
        let next = dir.path().join("next.tmp");
        append(&next, &format!("{}{}", line(7), line(8)));
        std::fs::rename(&next, &file).unwrap();

        let rotations = bus.subscribe("tailer.rotation");
        let events = bus.subscribe("conversation.#");
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.rotation, Some(RotationReason::Replaced));
        assert_eq!(o.events, 2);

        let c = tailer.cursor(&file).unwrap();
        assert_eq!((c.generation, c.line_number), (2, 2));
        assert_ne!(c.identity.key(), old_key);
        assert!(tailer.store.get(&old_key).is_none());

        match &rotations.try_recv().unwrap().payload {
            BusPayload::Rotation(r) => {
                assert_eq!(r.reason, RotationReason::Replaced);
                assert_eq!((r.previous_generation, r.new_generation), (1, 2));
            }
            other => panic!("expected rotation marker, got {other:?}"),
        }
        let first = events.try_recv().unwrap();
        let ev = first.payload.as_conversation().unwrap();
        assert_eq!((ev.key.generation, ev.key.line), (2, 1));
        assert_eq!(ev.message, "step 7");
    }

    #[test]
    fn test_file_reappearing_resumes_from_cursor() {
        let (_dir, file, mut tailer, bus) = setup();
        append(&file, &format!("{}{}", line(1), line(2)));
        tailer.discover().unwrap();
        tailer.poll(&file).unwrap();
        let key = tailer.cursor(&file).unwrap().identity.key();

        let parked_dir = tempfile::tempdir().unwrap();
        let parked = parked_dir.path().join("parked.jsonl");
        std::fs::rename(&file, &parked).unwrap();
        tailer.discover().unwrap();
        assert!(tailer.tracked_paths().is_empty());
        let kept = tailer.store.get(&key).unwrap();
        assert_eq!(kept.line_number, 2);
        assert!(kept.detached_at.is_some());

        append(&parked, &line(3));
        std::fs::rename(&parked, &file).unwrap();
        let events = bus.subscribe("conversation.#");
        assert_eq!(tailer.discover().unwrap(), 1);
        let o = tailer.poll(&file).unwrap();
        assert_eq!(o.events, 1);
        assert_eq!(o.rotation, None);

        let ev = events.try_recv().unwrap();
        let ev = ev.payload.as_conversation().unwrap();
        assert_eq!((ev.key.generation, ev.key.line), (1, 3));
        assert!(tailer.store.get(&key).unwrap().detached_at.is_none());
    }

    #[test]
    fn test_vanished_file_cursor_pruned_after_retention() {
        let (_dir, file, mut tailer, _bus) = setup();
        append(&file, &line(1));
        tailer.discover().unwrap();
        tailer.poll(&file).unwrap();
        let key = tailer.cursor(&file).unwrap().identity.key();

        tailer.config.cursor_retention = chrono::Duration::zero();
        std::fs::remove_file(&file).unwrap();
        tailer.discover().unwrap();
        tailer.discover().unwrap();
        assert!(tailer.store.get(&key).is_none());
        assert!(tailer.store.is_empty());
    }

    #[test]
    fn test_missing_file_backs_off_and_degrades() {
        let (_dir, file, mut tailer, _bus) = setup();
        append(&file, &line(1));
        tailer.discover().unwrap();
        std::fs::remove_file(&file).unwrap();

        tailer.config.retry_base = Duration::from_millis(0);
        tailer.config.degraded_after_failures = 2;
        assert!(tailer.poll(&file).is_err());
        assert!(tailer.poll(&file).is_err());
        tailer.refresh_status();
        let status = tailer.status_handle().read().unwrap().clone();
        assert!(status.any_degraded());
        assert_eq!(status.files[0].io_errors, 2);

        tailer.config.retry_base = Duration::from_secs(60);
        tailer.config.retry_max = Duration::from_secs(60);
        assert!(tailer.poll(&file).is_err());
        assert!(tailer.poll(&file).unwrap().backing_off);
    }
}
