// ConvStream - app/positions.rs
//
// Position store: the durable map `file identity -> read cursor`.
//
// Design principles:
// - The table is saved atomically (write temp, rename over final) so a crash
//   during save never corrupts the previous good table.
// - Only the tailer thread mutates cursors; readers (health, tests) take
//   snapshots.
// - Saves are skipped when nothing changed since the last successful save.
// - A store built with `in_memory()` never touches disk (one-shot analysis).

use crate::core::model::FileCursor;
use crate::platform::fs::write_atomic;
use crate::util::error::StoreError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Version stamp of the on-disk table. Bump when the entry shape changes
/// incompatibly.
pub const POSITIONS_VERSION: u32 = 1;

// =============================================================================
// On-disk shape
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTable {
    version: u32,
    /// Keyed by `FileIdentity::key()`.
    #[serde(default)]
    cursors: BTreeMap<String, FileCursor>,
}

#[derive(Debug, Default)]
struct TableState {
    cursors: BTreeMap<String, FileCursor>,
    /// Bumped on every mutation.
    revision: u64,
    /// Revision last written to disk.
    saved_revision: u64,
}

// =============================================================================
// PositionStore
// =============================================================================

/// Durable cursor table keyed by file identity.
#[derive(Debug)]
pub struct PositionStore {
    /// `None` for an in-memory store.
    path: Option<PathBuf>,
    state: Mutex<TableState>,
}

impl PositionStore {
    /// A store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(TableState::default()),
        }
    }

    /// Open the table at `path`. A missing file yields an empty table.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let cursors = load_table(path)?;
        tracing::info!(
            path = %path.display(),
            entries = cursors.len(),
            "Position store opened"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(TableState {
                cursors,
                ..TableState::default()
            }),
        })
    }

    /// Open the table at `path`, starting empty if it is corrupt or from an
    /// incompatible version. Re-reading from offset 0 is safe under
    /// at-least-once delivery, so the error is returned for logging only.
    pub fn open_or_reset(path: &Path) -> (Self, Option<StoreError>) {
        match Self::open(path) {
            Ok(store) => (store, None),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Position store unreadable; starting from an empty table"
                );
                let store = Self {
                    path: Some(path.to_path_buf()),
                    state: Mutex::new(TableState {
                        revision: 1,
                        ..TableState::default()
                    }),
                };
                (store, Some(e))
            }
        }
    }

    /// Location on disk, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        // A poisoned table is still structurally valid: every mutation is a
        // single map operation.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cursor stored for an identity key.
    pub fn get(&self, identity_key: &str) -> Option<FileCursor> {
        self.lock().cursors.get(identity_key).cloned()
    }

    /// Most recent cursor recorded for `path` under any identity.
    ///
    /// Used after a restart to notice that the file at a known path was
    /// replaced while the process was down.
    pub fn latest_for_path(&self, path: &Path) -> Option<FileCursor> {
        self.lock()
            .cursors
            .values()
            .filter(|c| c.identity.path == path)
            .max_by_key(|c| c.generation)
            .cloned()
    }

    /// Insert or replace the cursor for its identity.
    pub fn upsert(&self, cursor: FileCursor) {
        let mut state = self.lock();
        let key = cursor.identity.key();
        if state.cursors.get(&key) != Some(&cursor) {
            state.cursors.insert(key, cursor);
            state.revision += 1;
        }
    }

    /// Forget an identity (retired after replacement).
    pub fn remove(&self, identity_key: &str) -> Option<FileCursor> {
        let mut state = self.lock();
        let removed = state.cursors.remove(identity_key);
        if removed.is_some() {
            state.revision += 1;
        }
        removed
    }

    /// Age out cursors of files that are no longer tracked.
    ///
    /// A cursor whose key is not in `tracked` is stamped `detached_at = now`
    /// the first time it is seen untracked, and removed once it has been
    /// detached for longer than `retention`. Returns the number removed.
    pub fn prune_detached(
        &self,
        tracked: &BTreeSet<String>,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> usize {
        let cutoff = now - retention;
        let mut state = self.lock();
        let mut stamped = 0u64;
        for (key, cursor) in state.cursors.iter_mut() {
            if !tracked.contains(key) && cursor.detached_at.is_none() {
                cursor.detached_at = Some(now);
                stamped += 1;
            }
        }
        let before = state.cursors.len();
        state
            .cursors
            .retain(|key, c| tracked.contains(key) || c.detached_at.map_or(true, |t| t > cutoff));
        let removed = before - state.cursors.len();
        if stamped > 0 || removed > 0 {
            state.revision += 1;
        }
        removed
    }

    /// All cursors, in identity-key order.
    pub fn snapshot(&self) -> Vec<FileCursor> {
        self.lock().cursors.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the table atomically if it changed since the last save.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Serialise under the lock, write outside it.
        let (bytes, revision) = {
            let state = self.lock();
            if state.revision == state.saved_revision {
                return Ok(());
            }
            let table = PersistedTable {
                version: POSITIONS_VERSION,
                cursors: state.cursors.clone(),
            };
            let bytes = serde_json::to_vec_pretty(&table).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?;
            (bytes, state.revision)
        };

        write_atomic(path, &bytes).map_err(|source| StoreError::Io {
            path: path.clone(),
            operation: "atomic write",
            source,
        })?;

        // Mutations made while writing stay pending for the next save.
        let mut state = self.lock();
        state.saved_revision = state.saved_revision.max(revision);
        tracing::debug!(path = %path.display(), entries = state.cursors.len(), "Position store saved");
        Ok(())
    }
}

fn load_table(path: &Path) -> Result<BTreeMap<String, FileCursor>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                operation: "read",
                source,
            })
        }
    };
    let table: PersistedTable =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    if table.version != POSITIONS_VERSION {
        return Err(StoreError::VersionMismatch {
            path: path.to_path_buf(),
            found: table.version,
            expected: POSITIONS_VERSION,
        });
    }
    Ok(table.cursors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::FileIdentity;

    fn cursor(path: &str, marker: &str, offset: u64, generation: u64) -> FileCursor {
        let mut c = FileCursor::new(
            FileIdentity {
                path: PathBuf::from(path),
                marker: marker.to_string(),
            },
            generation,
        );
        c.byte_offset = offset;
        c.line_number = offset / 10;
        c
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let store = PositionStore::open(&path).unwrap();
        assert!(store.is_empty());

        let c = cursor("/logs/a.jsonl", "1:2", 120, 1);
        store.upsert(c.clone());
        store.save().unwrap();

        let reopened = PositionStore::open(&path).unwrap();
        assert_eq!(reopened.get(&c.identity.key()), Some(c));
    }

    #[test]
    fn test_version_mismatch_rejected_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(&path, r#"{"version": 99, "cursors": {}}"#).unwrap();
        assert!(matches!(
            PositionStore::open(&path),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
        let (store, err) = PositionStore::open_or_reset(&path);
        assert!(err.is_some());
        assert!(store.is_empty());
        store.save().unwrap();
        assert!(PositionStore::open(&path).is_ok());
    }

    #[test]
    fn test_corrupt_table_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PositionStore::open(&path),
            Err(StoreError::Json { .. })
        ));
    }

    #[test]
    fn test_latest_for_path_prefers_newest_generation() {
        let store = PositionStore::in_memory();
        store.upsert(cursor("/logs/a.jsonl", "1:2", 10, 1));
        store.upsert(cursor("/logs/a.jsonl", "1:3", 0, 2));
        store.upsert(cursor("/logs/b.jsonl", "1:4", 0, 7));
        let latest = store.latest_for_path(Path::new("/logs/a.jsonl")).unwrap();
        assert_eq!(latest.generation, 2);
        assert_eq!(latest.identity.marker, "1:3");
    }

    #[test]
    fn test_detached_cursors_age_out() {
        let store = PositionStore::in_memory();
        store.upsert(cursor("/logs/a.jsonl", "1:1", 10, 1));
        store.upsert(cursor("/logs/b.jsonl", "1:2", 20, 1));
        let tracked: BTreeSet<String> = [cursor("/logs/a.jsonl", "1:1", 0, 1).identity.key()]
            .into_iter()
            .collect();
        let t0 = chrono::Utc::now();
        let retention = Duration::hours(24);

        assert_eq!(store.prune_detached(&tracked, t0, retention), 0);
        let b = store.latest_for_path(Path::new("/logs/b.jsonl")).unwrap();
        assert_eq!(b.detached_at, Some(t0));

        // Still inside retention: kept, stamp unchanged.
        assert_eq!(store.prune_detached(&tracked, t0 + Duration::hours(23), retention), 0);
        assert_eq!(store.len(), 2);

        assert_eq!(store.prune_detached(&tracked, t0 + Duration::hours(25), retention), 1);
        assert_eq!(store.len(), 1);
        assert!(store.latest_for_path(Path::new("/logs/a.jsonl")).is_some());
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let store = PositionStore::in_memory();
        store.upsert(cursor("/x", "m", 0, 1));
        store.save().unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.remove(&cursor("/x", "m", 0, 1).identity.key()).map(|c| c.generation), Some(1));
        assert!(store.is_empty());
    }
}
