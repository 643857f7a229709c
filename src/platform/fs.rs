// ConvStream - platform/fs.rs
//
// Filesystem helpers that differ per OS or need care: stable file identity,
// bounded reads from an offset, and atomic replacement of a file.

use std::fs::Metadata;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Marker that stays the same while a file is renamed or appended to, and
/// changes when a different file is put at the same path.
///
/// Unix: `dev:inode`. Elsewhere: creation time in nanoseconds, or `"none"`
/// when the platform reports neither.
pub fn identity_marker(meta: &Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        format!("{}:{}", meta.dev(), meta.ino())
    }
    #[cfg(not(unix))]
    {
        meta.created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| format!("c{}", d.as_nanos()))
            .unwrap_or_else(|| "none".to_string())
    }
}

/// Read at most `max_bytes` starting at `offset`.
///
/// Returns fewer bytes at EOF and an empty buffer when `offset` is at or past
/// the end. The file is opened fresh each call so a replaced file is never
/// read through a stale handle.
pub fn read_from(path: &Path, offset: u64, max_bytes: usize) -> io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(max_bytes.min(64 * 1_024));
    file.take(max_bytes as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Replace `path` with `bytes` atomically: write a sibling temp file, sync it,
/// then rename over the target. Readers see the old or the new content, never
/// a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Returns true for I/O errors worth retrying immediately.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_from_offset_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.jsonl");
        std::fs::write(&p, b"0123456789").unwrap();
        assert_eq!(read_from(&p, 3, 4).unwrap(), b"3456");
        assert_eq!(read_from(&p, 8, 100).unwrap(), b"89");
        assert!(read_from(&p, 50, 10).unwrap().is_empty());
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested").join("positions.json");
        write_atomic(&p, b"first").unwrap();
        write_atomic(&p, b"second").unwrap();
        assert_eq!(std::fs::read(&p).unwrap(), b"second");
        assert!(!dir.path().join("nested").join("positions.json.tmp").exists());
    }

    #[test]
    fn test_identity_changes_on_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.jsonl");
        std::fs::write(&p, b"x").unwrap();
        let before = identity_marker(&std::fs::metadata(&p).unwrap());
        // Keep the old inode alive so the new file cannot reuse it.
        let moved = dir.path().join("a.jsonl.1");
        std::fs::rename(&p, &moved).unwrap();
        std::fs::write(&p, b"y").unwrap();
        let after = identity_marker(&std::fs::metadata(&p).unwrap());
        assert_eq!(before, identity_marker(&std::fs::metadata(&moved).unwrap()));
        if cfg!(unix) {
            assert_ne!(before, after);
        }
    }
}
