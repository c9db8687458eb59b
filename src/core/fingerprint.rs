//! File fingerprinting for cache validity.
//!
//! Large inputs cannot be fully hashed on every cache lookup, so files at or
//! above 1 MiB are hashed over a fixed sample layout
//! (`size || head || middle || tail`) instead of their full bytes. The
//! layout is kept byte-for-byte stable so cache keys computed by different
//! processes (or reimplementations) agree.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Below this size, the whole file is hashed.
const FULL_HASH_THRESHOLD_BYTES: u64 = 1024 * 1024;
/// Upper bound on each of the head/middle/tail sample windows.
const MAX_SAMPLE_WINDOW_BYTES: u64 = 64 * 1024;
/// How long a memoised fingerprint remains valid without re-stat'ing.
const MEMO_TTL: Duration = Duration::from_secs(30);

/// A file's fingerprint: size, modification time, and a checksum computed
/// either over the whole file (small files) or a deterministic sample
/// (large files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, as seconds since the Unix epoch.
    pub mtime_secs: u64,
    /// Hex-encoded MD5 checksum (whole file or sampled, per `size`).
    pub checksum: String,
}

impl Fingerprint {
    /// A fingerprint for an unreadable path; the cache treats any entry
    /// stamped with this as unconditionally stale.
    pub fn sentinel() -> Self {
        Self {
            size: 0,
            mtime_secs: 0,
            checksum: "unknown".to_string(),
        }
    }

    fn is_sentinel(&self) -> bool {
        self.checksum == "unknown"
    }
}

struct MemoEntry {
    fingerprint: Fingerprint,
    computed_at: Instant,
}

/// Computes and memoises file fingerprints.
///
/// One instance is typically shared (behind an `Arc`) across the
/// `ResultCache` and the executor's readiness check, so both observe the
/// same 30s memoisation window instead of re-hashing independently.
pub struct FileIntegrity {
    memo: Mutex<std::collections::HashMap<PathBuf, MemoEntry>>,
}

impl Default for FileIntegrity {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIntegrity {
    /// Create a fresh fingerprinter with an empty memo.
    pub fn new() -> Self {
        Self {
            memo: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Fingerprint `path`, using the memo when `(size, mtime)` match a
    /// recent computation. Returns [`Fingerprint::sentinel`] rather than an
    /// error for unreadable paths.
    pub fn fingerprint(&self, path: &Path) -> Fingerprint {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Fingerprint::sentinel(),
        };
        let size = metadata.len();
        let mtime_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        {
            let memo = self.memo.lock();
            if let Some(entry) = memo.get(path) {
                if entry.fingerprint.size == size
                    && entry.fingerprint.mtime_secs == mtime_secs
                    && entry.computed_at.elapsed() < MEMO_TTL
                {
                    return entry.fingerprint.clone();
                }
            }
        }

        let fingerprint = match Self::compute_checksum(path, size) {
            Ok(checksum) => Fingerprint {
                size,
                mtime_secs,
                checksum,
            },
            Err(_) => Fingerprint::sentinel(),
        };

        if !fingerprint.is_sentinel() {
            let mut memo = self.memo.lock();
            memo.insert(
                path.to_path_buf(),
                MemoEntry {
                    fingerprint: fingerprint.clone(),
                    computed_at: Instant::now(),
                },
            );
        }
        fingerprint
    }

    fn compute_checksum(path: &Path, size: u64) -> std::io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher_input = Vec::new();

        if size < FULL_HASH_THRESHOLD_BYTES {
            file.read_to_end(&mut hasher_input)?;
        } else {
            let window = (size / 100).min(MAX_SAMPLE_WINDOW_BYTES).max(1);
            hasher_input.extend_from_slice(&size.to_le_bytes());

            let mut head = vec![0u8; window as usize];
            file.read_exact(&mut head)?;
            hasher_input.extend_from_slice(&head);

            let middle_start = size / 2 - window / 2;
            file.seek(SeekFrom::Start(middle_start))?;
            let mut middle = vec![0u8; window as usize];
            file.read_exact(&mut middle)?;
            hasher_input.extend_from_slice(&middle);

            let tail_start = size - window;
            file.seek(SeekFrom::Start(tail_start))?;
            let mut tail = vec![0u8; window as usize];
            file.read_exact(&mut tail)?;
            hasher_input.extend_from_slice(&tail);
        }

        let digest = md5::compute(&hasher_input);
        Ok(format!("{digest:x}"))
    }
}

/// Current wall-clock time, as seconds since the Unix epoch. Shared helper
/// so cache TTL/age arithmetic uses one definition of "now".
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn small_file_uses_full_hash_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.csv");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"a,b\n1,2\n").unwrap();
        }
        let integrity = FileIntegrity::new();
        let fp1 = integrity.fingerprint(&path);
        let fp2 = integrity.fingerprint(&path);
        assert_eq!(fp1, fp2);
        assert_ne!(fp1.checksum, "unknown");
    }

    #[test]
    fn unreadable_path_returns_sentinel() {
        let integrity = FileIntegrity::new();
        let fp = integrity.fingerprint(Path::new("/nonexistent/path/does-not-exist.csv"));
        assert_eq!(fp, Fingerprint::sentinel());
    }

    #[test]
    fn content_change_changes_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();
        let integrity = FileIntegrity::new();
        let fp1 = integrity.fingerprint(&path);

        // Force the memo window to be bypassed by writing different bytes.
        std::fs::write(&path, b"a,b\n1,2\n3,4\n").unwrap();
        let integrity2 = FileIntegrity::new();
        let fp2 = integrity2.fingerprint(&path);
        assert_ne!(fp1.checksum, fp2.checksum);
    }
}
