//! Content-addressed, thread-safe artefact cache.
//!
//! Backed by [`dashmap`] for the key→entry map (sharded internally, so
//! `get`/`set` on distinct keys proceed without serialising against each
//! other) plus an explicit LRU order list and size accounting behind one
//! structural lock, separating the in-memory map from a dedicated
//! single-flight eviction/persistence mutex.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::core::artefact::{Artefact, NodeId, NodeSet};
use crate::core::config::Options;
use crate::core::fingerprint::{now_unix_secs, FileIntegrity};

/// How long a per-key lock is held before the reentrant guard logs a
/// warning and releases anyway. Modelled as a soft watchdog rather than a
/// hard kill since there is no portable, safe way to force-unlock another
/// thread's mutex.
const PER_KEY_LOCK_WATCHDOG: Duration = Duration::from_secs(30);

/// Reject new entries once projected usage crosses this fraction of the
/// configured limit.
const MEMORY_REJECT_FRACTION: f64 = 0.95;

/// A stored artefact plus the bookkeeping needed to validate, evict, and
/// (optionally) persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex-encoded SHA-256 key material, serialised as hex for
    /// JSON-friendliness.
    pub key_hex: String,
    /// Source file path this entry was computed against.
    pub file_path: PathBuf,
    /// The cached artefact.
    pub artefact: Artefact,
    /// Serialised size estimate, in bytes.
    pub size_bytes: u64,
    /// Creation timestamp, seconds since the Unix epoch.
    pub created_at: u64,
    /// Last-accessed timestamp, seconds since the Unix epoch.
    pub last_accessed_at: u64,
    /// Number of times this entry has been returned by `get`.
    pub access_count: u64,
    /// File fingerprint checksum at creation time.
    pub file_checksum: String,
    /// Upstream sections whose change invalidates this entry.
    pub dependencies: NodeSet,
    /// Canonical JSON of the cacheable options subset, for diagnostics.
    pub options_fingerprint: String,
    /// Time-to-live, in milliseconds.
    pub ttl_ms: u64,
    /// Cache format/schema version this entry was written under.
    pub cache_version: String,
}

/// Why a looked-up entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// `now - created_at > ttl`.
    TtlExpired,
    /// `cache_version` no longer matches.
    VersionChanged,
    /// The source file's fingerprint no longer matches.
    FileChanged,
}

impl InvalidReason {
    /// The label used in logs and invalidation metadata.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TtlExpired => "ttl_expired",
            Self::VersionChanged => "version_changed",
            Self::FileChanged => "file_changed",
        }
    }
}

/// Observed memory-pressure bucket, used to scale eviction aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// `< 0.5` of the configured limit.
    Low,
    /// `< 0.7`.
    Medium,
    /// `< 0.9`.
    High,
    /// `>= 0.9`.
    Critical,
}

impl PressureLevel {
    fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.5 {
            Self::Low
        } else if ratio < 0.7 {
            Self::Medium
        } else if ratio < 0.9 {
            Self::High
        } else {
            Self::Critical
        }
    }

    fn target_fraction(&self) -> f64 {
        match self {
            Self::Low => 0.0,
            Self::Medium => 0.10,
            Self::High => 0.30,
            Self::Critical => 0.50,
        }
    }
}

struct PerKeyLocks {
    locks: DashMap<String, std::sync::Arc<Mutex<()>>>,
}

impl PerKeyLocks {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn guard(&self, key: &str) -> parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone();
        match lock.try_lock_arc_for(PER_KEY_LOCK_WATCHDOG) {
            Some(guard) => guard,
            None => {
                warn!(key, "per-key cache lock held past watchdog window, forcing acquisition");
                lock.lock_arc()
            }
        }
    }
}

/// Thread-safe, content-addressed artefact cache.
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    lru_order: Mutex<VecDeque<String>>,
    total_size_bytes: AtomicU64,
    memory_limit_bytes: u64,
    cache_version: String,
    cache_dir: Option<PathBuf>,
    cleanup_in_progress: AtomicBool,
    integrity: FileIntegrity,
    locks: PerKeyLocks,
}

impl ResultCache {
    /// Create an in-memory cache with no persistence.
    pub fn new(memory_limit_bytes: u64, cache_version: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            lru_order: Mutex::new(VecDeque::new()),
            total_size_bytes: AtomicU64::new(0),
            memory_limit_bytes,
            cache_version: cache_version.into(),
            cache_dir: None,
            cleanup_in_progress: AtomicBool::new(false),
            integrity: FileIntegrity::new(),
            locks: PerKeyLocks::new(),
        }
    }

    /// Create a cache with on-disk persistence under `cache_dir`, eagerly
    /// reloading whatever entries are already there. Corrupt files are
    /// skipped with a warning rather than treated as fatal.
    pub fn with_persistence(
        memory_limit_bytes: u64,
        cache_version: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let cache_version = cache_version.into();
        let cache_dir = cache_dir.into();
        let cache = Self {
            entries: DashMap::new(),
            lru_order: Mutex::new(VecDeque::new()),
            total_size_bytes: AtomicU64::new(0),
            memory_limit_bytes,
            cache_version,
            cache_dir: Some(cache_dir.clone()),
            cleanup_in_progress: AtomicBool::new(false),
            integrity: FileIntegrity::new(),
            locks: PerKeyLocks::new(),
        };
        cache.reload_from_disk(&cache_dir);
        cache
    }

    fn reload_from_disk(&self, dir: &Path) {
        let Ok(read_dir) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<CacheEntry>(&content).ok())
            {
                Some(cache_entry) => {
                    let key = cache_entry.key_hex.clone();
                    self.total_size_bytes
                        .fetch_add(cache_entry.size_bytes, Ordering::SeqCst);
                    self.lru_order.lock().push_back(key.clone());
                    self.entries.insert(key, cache_entry);
                }
                None => {
                    warn!(file = %path.display(), "ignoring corrupt persisted cache entry");
                }
            }
        }
        info!(count = self.entries.len(), dir = %dir.display(), "reloaded cache entries from disk");
    }

    /// Generate the deterministic lookup key for `(path, section, options,
    /// deps)`.
    pub fn generate_key(
        &self,
        path: &Path,
        section: Option<NodeId>,
        options: &Options,
        deps: &NodeSet,
    ) -> String {
        let section_label = section.map(|s| s.to_string()).unwrap_or_else(|| "combined".to_string());
        let mut sorted_deps: Vec<&NodeId> = deps.iter().collect();
        sorted_deps.sort();
        let deps_label = sorted_deps
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let canonical_opts = options.cacheable().canonical_json();

        let mut hasher = Sha256::new();
        hasher.update(b"file:");
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"|section:");
        hasher.update(section_label.as_bytes());
        hasher.update(b"|deps:");
        hasher.update(deps_label.as_bytes());
        hasher.update(b"|opts:");
        hasher.update(canonical_opts.as_bytes());
        hasher.update(b"|version:");
        hasher.update(options.cache_version.as_bytes());
        let digest = hasher.finalize();
        let hex = format!("{digest:x}");

        let basename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        format!("{section_label}_{basename}_{}", &hex[0..16])
    }

    /// Look up a cached artefact, validating it against the current file
    /// fingerprint, TTL, and cache version before returning it.
    pub fn get(
        &self,
        path: &Path,
        section: Option<NodeId>,
        options: &Options,
        deps: &NodeSet,
    ) -> Option<Artefact> {
        let key = self.generate_key(path, section, options, deps);
        let _guard = self.locks.guard(&key);

        let invalid_reason = {
            let entry = self.entries.get(&key)?;
            self.validate(&entry)
        };

        if let Some(reason) = invalid_reason {
            debug!(key, reason = reason.label(), "cache entry invalid");
            self.remove_entry(&key);
            return None;
        }

        let mut entry = self.entries.get_mut(&key)?;
        entry.last_accessed_at = now_unix_secs();
        entry.access_count += 1;
        let artefact = entry.artefact.clone();
        drop(entry);
        self.touch_lru(&key);
        Some(artefact)
    }

    fn validate(&self, entry: &CacheEntry) -> Option<InvalidReason> {
        let now = now_unix_secs();
        let age_ms = now.saturating_sub(entry.created_at) * 1000;
        if age_ms > entry.ttl_ms {
            return Some(InvalidReason::TtlExpired);
        }
        if entry.cache_version != self.cache_version {
            return Some(InvalidReason::VersionChanged);
        }
        let current = self.integrity.fingerprint(&entry.file_path);
        if current.checksum != entry.file_checksum {
            return Some(InvalidReason::FileChanged);
        }
        None
    }

    /// Store a new artefact, rejecting silently if doing so would exceed
    /// `0.95 * memory_limit_bytes`.
    pub fn set(
        &self,
        path: &Path,
        section: Option<NodeId>,
        options: &Options,
        artefact: Artefact,
        deps: NodeSet,
        ttl_ms: u64,
    ) -> bool {
        let key = self.generate_key(path, section, options, &deps);
        let _guard = self.locks.guard(&key);

        let size_bytes = serde_json::to_vec(&artefact)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);

        let projected = self.total_size_bytes.load(Ordering::SeqCst) + size_bytes;
        if projected as f64 > MEMORY_REJECT_FRACTION * self.memory_limit_bytes as f64 {
            warn!(key, size_bytes, "rejecting cache insert: projected usage exceeds budget");
            return false;
        }

        let file_checksum = self.integrity.fingerprint(path).checksum;
        let entry = CacheEntry {
            key_hex: key.clone(),
            file_path: path.to_path_buf(),
            artefact,
            size_bytes,
            created_at: now_unix_secs(),
            last_accessed_at: now_unix_secs(),
            access_count: 0,
            file_checksum,
            dependencies: deps,
            options_fingerprint: options.cacheable().canonical_json(),
            ttl_ms,
            cache_version: self.cache_version.clone(),
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry.clone()) {
            self.total_size_bytes
                .fetch_sub(previous.size_bytes, Ordering::SeqCst);
        } else {
            self.lru_order.lock().push_front(key.clone());
        }
        self.total_size_bytes.fetch_add(size_bytes, Ordering::SeqCst);

        if let Some(dir) = &self.cache_dir {
            self.persist(dir, &entry);
        }

        self.maybe_cleanup();
        true
    }

    fn persist(&self, dir: &Path, entry: &CacheEntry) {
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let path = dir.join(format!("{}.json", entry.key_hex));
        match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => {
                let tmp = path.with_extension("json.tmp");
                if std::fs::write(&tmp, bytes).is_ok() {
                    let _ = std::fs::rename(&tmp, &path);
                }
            }
            Err(err) => warn!(error = %err, "failed to serialise cache entry for persistence"),
        }
    }

    fn touch_lru(&self, key: &str) {
        let mut order = self.lru_order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_front(key.to_string());
    }

    fn remove_entry(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.total_size_bytes
                .fetch_sub(entry.size_bytes, Ordering::SeqCst);
            if let Some(dir) = &self.cache_dir {
                let _ = std::fs::remove_file(dir.join(format!("{key}.json")));
            }
        }
        let mut order = self.lru_order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
    }

    /// Drop every entry computed against `path`.
    pub fn invalidate_file(&self, path: &Path) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.file_path == path)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.remove_entry(&key);
        }
    }

    /// Drop every entry whose `dependencies` set contains `section`, forcing
    /// downstream recomputation; called after a successful execution and on
    /// any node failure.
    pub fn invalidate_dependents(&self, section: NodeId) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.dependencies.contains(&section))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.remove_entry(key);
        }
        if !keys.is_empty() {
            debug!(section = %section, count = keys.len(), "invalidated dependent cache entries");
        }
    }

    fn maybe_cleanup(&self) {
        if self
            .cleanup_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let ratio = self.total_size_bytes.load(Ordering::SeqCst) as f64 / self.memory_limit_bytes as f64;
        let level = PressureLevel::from_ratio(ratio);
        let fraction = level.target_fraction();
        if fraction > 0.0 {
            self.evict(fraction);
        }
        self.cleanup_in_progress.store(false, Ordering::SeqCst);
    }

    fn evict(&self, fraction: f64) {
        let now = now_unix_secs();
        let mut candidates: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|entry| {
                let age_hours = (now.saturating_sub(entry.created_at)) as f64 / 3600.0;
                let access_term = 1.0 / (entry.access_count as f64 + 1.0);
                let size_mb = entry.size_bytes as f64 / (1024.0 * 1024.0);
                let score = 0.5 * age_hours + 0.3 * access_term + 0.2 * size_mb;
                (entry.key().clone(), score)
            })
            .collect();

        let target_count = ((candidates.len() as f64) * fraction).ceil() as usize;
        if target_count == 0 {
            return;
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (key, _) in candidates.into_iter().take(target_count) {
            self.remove_entry(&key);
        }
        info!(evicted = target_count, "cache eviction cycle completed");
    }

    /// Total number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current total of live entries' `size_bytes`.
    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes.load(Ordering::SeqCst)
    }

    /// Tear down the cache: nothing to flush beyond what `set` already
    /// persisted eagerly, but kept as an explicit lifecycle hook so callers
    /// have one place to release locks and flush persistence on shutdown.
    pub fn dispose(&self) {
        info!(entries = self.entries.len(), "result cache disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artefact::Artefact;

    fn artefact(node: NodeId) -> Artefact {
        Artefact::new(node, serde_json::json!({"ok": true}))
    }

    #[test]
    fn cache_hit_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();

        let cache = ResultCache::new(64 * 1024 * 1024, "1");
        let options = Options::default();
        let deps = NodeSet::new();

        assert!(cache
            .get(&file, Some(NodeId::Section1), &options, &deps)
            .is_none());
        cache.set(
            &file,
            Some(NodeId::Section1),
            &options,
            artefact(NodeId::Section1),
            deps.clone(),
            60_000,
        );
        assert!(cache
            .get(&file, Some(NodeId::Section1), &options, &deps)
            .is_some());
    }

    #[test]
    fn file_change_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();

        let cache = ResultCache::new(64 * 1024 * 1024, "1");
        let options = Options::default();
        let deps = NodeSet::new();
        cache.set(
            &file,
            Some(NodeId::Section1),
            &options,
            artefact(NodeId::Section1),
            deps.clone(),
            60_000,
        );
        assert!(cache
            .get(&file, Some(NodeId::Section1), &options, &deps)
            .is_some());

        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(&file, b"a,b\n1,2\n3,4\n").unwrap();
        assert!(cache
            .get(&file, Some(NodeId::Section1), &options, &deps)
            .is_none());
    }

    #[test]
    fn invalidate_dependents_only_removes_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();

        let cache = ResultCache::new(64 * 1024 * 1024, "1");
        let options = Options::default();
        let dep_on_s1: NodeSet = [NodeId::Section1].into_iter().collect();
        let dep_on_s2: NodeSet = [NodeId::Section2].into_iter().collect();

        cache.set(
            &file,
            Some(NodeId::Section4),
            &options,
            artefact(NodeId::Section4),
            dep_on_s1,
            60_000,
        );
        cache.set(
            &file,
            Some(NodeId::Section5),
            &options,
            artefact(NodeId::Section5),
            dep_on_s2.clone(),
            60_000,
        );

        cache.invalidate_dependents(NodeId::Section1);
        assert!(cache
            .get(&file, Some(NodeId::Section4), &options, &NodeSet::new())
            .is_none());
        assert!(cache
            .get(&file, Some(NodeId::Section5), &options, &dep_on_s2)
            .is_some());
    }

    #[test]
    fn key_generation_is_deterministic() {
        let cache = ResultCache::new(64 * 1024 * 1024, "1");
        let options = Options::default();
        let deps = NodeSet::new();
        let path = Path::new("/tmp/data.csv");
        let k1 = cache.generate_key(path, Some(NodeId::Section1), &options, &deps);
        let k2 = cache.generate_key(path, Some(NodeId::Section1), &options, &deps);
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_changes_with_cacheable_option() {
        let cache = ResultCache::new(64 * 1024 * 1024, "1");
        let mut options_a = Options::default();
        let mut options_b = Options::default();
        options_a.max_rows = Some(10);
        options_b.max_rows = Some(20);
        let deps = NodeSet::new();
        let path = Path::new("/tmp/data.csv");
        let ka = cache.generate_key(path, Some(NodeId::Section1), &options_a, &deps);
        let kb = cache.generate_key(path, Some(NodeId::Section1), &options_b, &deps);
        assert_ne!(ka, kb);
    }
}
