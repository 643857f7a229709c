// ConvStream - core/discovery.rs
//
// Directory traversal and conversation log discovery.
//
// Architecture note: this module uses `walkdir` for directory traversal as an
// OS abstraction. It reads only file *metadata* (size, mtime), never file
// *contents*; reading is owned by the app layer (app::tail).
//
//   - Per-file I/O errors are non-fatal and collected as warnings.
//   - max_files is enforced with an explicit named-constant upper bound.
//   - Exclude patterns short-circuit directory descent via filter_entry so
//     excluded subtrees (e.g. .git/) are never traversed at all.
//   - Results are ordered chronologically by the date embedded in the file
//     name (`conversations_YYYY_MM_DD[_suffix].jsonl`), then by name.

use crate::util::error::TailError;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a discovery operation.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum directory recursion depth. 1 = the root directory only.
    pub max_depth: usize,

    /// Maximum number of matching files to return.
    pub max_files: usize,

    /// Glob patterns (filename-only) that a file MUST match to be included.
    /// An empty list means "include everything that is not excluded".
    pub include_patterns: Vec<String>,

    /// Glob patterns matched against filenames AND directory component names.
    /// Matching files are skipped; matching directories are not descended into.
    pub exclude_patterns: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        use crate::util::constants;
        Self {
            max_depth: constants::DEFAULT_MAX_DEPTH,
            max_files: constants::DEFAULT_MAX_TRACKED_FILES,
            include_patterns: constants::DEFAULT_INCLUDE_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            exclude_patterns: constants::DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// A log file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Date parsed from the file name, if it carries one.
    pub file_date: Option<NaiveDate>,
}

/// Output of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Matching files in chronological order.
    pub files: Vec<DiscoveredFile>,
    /// Non-fatal problems (unreadable entries, truncation).
    pub warnings: Vec<String>,
    /// Number of matching files before the `max_files` cap was applied.
    pub total_found: usize,
}

// =============================================================================
// Discovery
// =============================================================================

/// Discover log files under `root`, applying include/exclude glob patterns.
///
/// Returns `Err` only if the root itself cannot be read. Everything below the
/// root degrades to warnings.
pub fn discover_files(root: &Path, config: &DiscoveryConfig) -> Result<DiscoveryOutcome, TailError> {
    use crate::util::constants;

    let meta = std::fs::metadata(root).map_err(|source| TailError::Stat {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(TailError::Stat {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        });
    }

    let max_files = config.max_files.min(constants::ABSOLUTE_MAX_TRACKED_FILES);
    let max_depth = config.max_depth.min(constants::ABSOLUTE_MAX_DEPTH);

    tracing::trace!(
        root = %root.display(),
        max_depth,
        max_files,
        include = ?config.include_patterns,
        exclude = ?config.exclude_patterns,
        "Discovery starting"
    );

    let include_pats = compile_patterns(&config.include_patterns, "include");
    let exclude_pats = compile_patterns(&config.exclude_patterns, "exclude");

    let mut outcome = DiscoveryOutcome::default();

    let walker = walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.file_type().is_dir() {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_str().unwrap_or("");
                return !is_excluded_component(name, &exclude_pats);
            }
            true
        });

    for entry_result in walker {
        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                let path_str = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unknown>".to_string());
                let msg = format!("Cannot access '{path_str}': {e}");
                tracing::debug!(warning = %msg, "Discovery warning");
                outcome.warnings.push(msg);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            outcome
                .warnings
                .push(format!("Skipping '{}': non-UTF-8 filename", path.display()));
            continue;
        };

        if is_excluded_filename(file_name, &exclude_pats) {
            tracing::trace!(file = file_name, "Excluded by pattern");
            continue;
        }
        if !is_included(file_name, &include_pats) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                let msg = format!("Cannot read metadata for '{}': {e}", path.display());
                tracing::debug!(warning = %msg, "Discovery warning");
                outcome.warnings.push(msg);
                continue;
            }
        };

        outcome.files.push(DiscoveredFile {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            file_date: date_from_file_name(file_name),
        });
    }

    outcome.total_found = outcome.files.len();

    // Over the cap: keep the most recently modified files.
    if outcome.total_found > max_files {
        outcome
            .files
            .sort_unstable_by(|a, b| match (b.modified, a.modified) {
                (Some(bm), Some(am)) => bm.cmp(&am),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
        outcome.files.truncate(max_files);
        outcome.warnings.push(format!(
            "{} log files were found but the tracking limit is {max_files}. \
             Only the {max_files} most recently modified files are tailed.",
            outcome.total_found
        ));
        tracing::warn!(
            total_found = outcome.total_found,
            limit = max_files,
            "File list truncated to most recently modified files"
        );
    }

    // Dated files first in date order, undated files after, ties by path.
    outcome
        .files
        .sort_by(|a, b| {
            (a.file_date.is_none(), a.file_date, &a.path).cmp(&(
                b.file_date.is_none(),
                b.file_date,
                &b.path,
            ))
        });

    tracing::trace!(
        total_found = outcome.total_found,
        files = outcome.files.len(),
        warnings = outcome.warnings.len(),
        "Discovery complete"
    );

    Ok(outcome)
}

/// Extract the calendar date from names such as
/// `conversations_2025_01_15.jsonl`, `conversations_2025_01_15_b.jsonl` or
/// `realtime_20250115_101500.jsonl`.
pub fn date_from_file_name(file_name: &str) -> Option<NaiveDate> {
    static DATE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DATE_RE
        .get_or_init(|| Regex::new(r"(\d{4})[_-]?(\d{2})[_-]?(\d{2})").ok())
        .as_ref()?;
    let caps = re.captures(file_name)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    let day = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

// =============================================================================
// Glob helpers
// =============================================================================

/// Compile a list of glob pattern strings into `glob::Pattern` objects.
/// Patterns that fail to compile are logged as warnings and skipped.
fn compile_patterns(patterns: &[String], kind: &str) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                tracing::warn!(pattern = p, kind, error = %e, "Invalid glob pattern, skipping");
                None
            }
        })
        .collect()
}

/// Returns true if `dir_name` matches any exclude pattern that contains no
/// wildcard characters (directory component exclusions such as ".git").
fn is_excluded_component(dir_name: &str, exclude_pats: &[glob::Pattern]) -> bool {
    exclude_pats.iter().any(|p| {
        let s = p.as_str();
        !s.contains('*') && !s.contains('?') && !s.contains('[') && p.matches(dir_name)
    })
}

fn is_excluded_filename(file_name: &str, exclude_pats: &[glob::Pattern]) -> bool {
    exclude_pats.iter().any(|p| p.matches(file_name))
}

/// An empty include list means "include all".
fn is_included(file_name: &str, include_pats: &[glob::Pattern]) -> bool {
    include_pats.is_empty() || include_pats.iter().any(|p| p.matches(file_name))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_temp_tree() -> TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();

        fs::write(root.join("conversations_2025_01_16.jsonl"), "{}\n").expect("write");
        fs::write(root.join("conversations_2025_01_15.jsonl"), "{}\n").expect("write");
        fs::write(root.join("conversations_2025_01_15_b.jsonl"), "{}\n").expect("write");
        fs::write(root.join("realtime_20250114_090000.jsonl"), "{}\n").expect("write");
        fs::write(root.join("notes.txt"), "not a log\n").expect("write");
        fs::write(root.join("conversations_2025_01_10.jsonl.gz"), "binary").expect("write");

        let sub = root.join("archive");
        fs::create_dir(&sub).expect("mkdir");
        fs::write(sub.join("conversations_2024_12_01.jsonl"), "{}\n").expect("write");

        dir
    }

    fn names(outcome: &DiscoveryOutcome) -> Vec<String> {
        outcome
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_discovers_in_date_order() {
        let dir = make_temp_tree();
        let outcome = discover_files(dir.path(), &DiscoveryConfig::default()).unwrap();
        assert_eq!(
            names(&outcome),
            vec![
                "realtime_20250114_090000.jsonl",
                "conversations_2025_01_15.jsonl",
                "conversations_2025_01_15_b.jsonl",
                "conversations_2025_01_16.jsonl",
            ]
        );
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    }

    #[test]
    fn test_depth_two_descends_into_subdirs() {
        let dir = make_temp_tree();
        let config = DiscoveryConfig {
            max_depth: 2,
            ..Default::default()
        };
        let outcome = discover_files(dir.path(), &config).unwrap();
        assert_eq!(outcome.files.len(), 5);
        assert_eq!(names(&outcome)[0], "conversations_2024_12_01.jsonl");
    }

    #[test]
    fn test_excluded_directory_not_descended() {
        let dir = make_temp_tree();
        let config = DiscoveryConfig {
            max_depth: 2,
            exclude_patterns: vec!["archive".to_string()],
            ..Default::default()
        };
        let outcome = discover_files(dir.path(), &config).unwrap();
        assert_eq!(outcome.files.len(), 4);
    }

    #[test]
    fn test_max_files_truncates_gracefully() {
        let dir = make_temp_tree();
        let config = DiscoveryConfig {
            max_files: 2,
            ..Default::default()
        };
        let outcome = discover_files(dir.path(), &config).unwrap();
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.total_found, 4);
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn test_missing_root_is_error() {
        let result = discover_files(
            Path::new("/nonexistent/path/convstream"),
            &DiscoveryConfig::default(),
        );
        assert!(matches!(result, Err(TailError::Stat { .. })));
    }

    #[test]
    fn test_root_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conversations_2025_01_15.jsonl");
        fs::write(&file, "{}").unwrap();
        assert!(discover_files(&file, &DiscoveryConfig::default()).is_err());
    }

    #[test]
    fn test_date_from_file_name() {
        assert_eq!(
            date_from_file_name("conversations_2025_01_15_worker2.jsonl"),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
        assert_eq!(
            date_from_file_name("realtime_20250114_090000.jsonl"),
            NaiveDate::from_ymd_opt(2025, 1, 14)
        );
        assert_eq!(date_from_file_name("conversations_2025_13_40.jsonl"), None);
        assert_eq!(date_from_file_name("conversations.jsonl"), None);
    }
}
