//! Persistent response cache keyed by call identity.
//!
//! Every validated backend result is stored under a [`CallKey`] derived from
//! the operation id and the canonical JSON form of the call arguments, and the
//! whole map is mirrored to a JSON snapshot file through
//! [`AtomicFile`](crate::storage::AtomicFile). A later run (or another worker
//! in the same run) asking for the same call gets the stored result instead of
//! paying for a new remote call.
//!
//! # Hit rules
//!
//! A lookup only counts as a hit when the stored entry is valid and holds a
//! present value. Nulls, empty strings/arrays/objects, `false`, errored
//! entries and the [`BLOCKED_SENTINEL`] are always reported as misses, so a
//! failure can never poison the cache.
//!
//! # Concurrency
//!
//! One mutex guards the map and its "stale" flag. Snapshots are cloned under
//! that lock and written after it is released, so disk I/O never blocks other
//! lookups. Disk writes are serialized by a second lock, and a snapshot older
//! than the last one written to the same file is dropped, so no file ever
//! goes backwards. Async callers should use [`PersistentCache::put_async`],
//! which runs the write on the blocking thread pool.
//! Two workers racing on the same miss may both call the backend; the last
//! `put` wins.
//!
//! # Usage
//!
//! ```ignore
//! use memo_forge::llm::{CallKey, PersistentCache};
//!
//! let cache = PersistentCache::new(".cache-forge.json");
//! let key = CallKey::new("gpt-4o", &serde_json::json!({"prompt": "hi"}))?;
//! if cache.get(&key).is_none() {
//!     cache.put(key, serde_json::json!("hello"))?;
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;
use crate::storage::AtomicFile;

/// Stored in place of a result when the backend refused the content.
pub const BLOCKED_SENTINEL: &str = "[ERROR]";

/// Version written into cache snapshot files.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Identity of a logical remote call.
///
/// Two logically identical calls always produce the same key: arguments are
/// serialized as compact JSON, which is type-tagged, keeps array order and
/// sorts object keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    operation: String,
    arguments: String,
}

impl CallKey {
    /// Derive a key from an operation id and any serializable arguments.
    pub fn new<A>(operation: impl Into<String>, arguments: &A) -> Result<Self, serde_json::Error>
    where
        A: Serialize + ?Sized,
    {
        // Round-trip through Value so map keys come out sorted.
        let canonical = serde_json::to_value(arguments)?;
        Ok(Self {
            operation: operation.into(),
            arguments: serde_json::to_string(&canonical)?,
        })
    }

    /// Build a key from an operation id and already canonical arguments.
    pub fn from_parts(operation: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            arguments: arguments.into(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// Hex-encoded SHA-256 of the key, for logs and audit records.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((self.operation.len() as u64).to_le_bytes());
        hasher.update(self.operation.as_bytes());
        hasher.update(self.arguments.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.operation, self.arguments)
    }
}

/// Whether a stored entry represents a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Valid,
    Errored,
}

/// One cached call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CallKey,
    pub value: Option<Value>,
    pub state: EntryState,
}

impl CacheEntry {
    /// Build an entry, marking sentinel values as errored.
    pub fn new(key: CallKey, value: Value) -> Self {
        let state = if is_blocked_sentinel(&value) {
            EntryState::Errored
        } else {
            EntryState::Valid
        };
        Self {
            key,
            value: Some(value),
            state,
        }
    }

    /// The stored value, if this entry may be served as a cache hit.
    pub fn hit(&self) -> Option<&Value> {
        if self.state != EntryState::Valid {
            return None;
        }
        self.value.as_ref().filter(|v| is_usable(v))
    }
}

/// True for values that may be cached and served: present and not the
/// blocked sentinel.
pub fn is_usable(value: &Value) -> bool {
    is_present(value) && !is_blocked_sentinel(value)
}

/// True for values that carry content: not null, `false`, or empty.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn is_blocked_sentinel(value: &Value) -> bool {
    value.as_str() == Some(BLOCKED_SENTINEL)
}

/// On-disk layout of a cache snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to go to the backend.
    pub misses: u64,
    /// Entries written.
    pub stores: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if there were no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    path: PathBuf,
    /// Set by `set_path`; forces a reload on next access.
    stale: bool,
    entries: Option<HashMap<CallKey, CacheEntry>>,
    /// Bumped on every mutation; orders snapshots.
    generation: u64,
}

impl CacheState {
    fn entries(&mut self) -> &mut HashMap<CallKey, CacheEntry> {
        if self.stale {
            self.entries = None;
            self.stale = false;
        }
        let path = &self.path;
        self.entries.get_or_insert_with(|| load_entries(path))
    }
}

struct Snapshot {
    path: PathBuf,
    generation: u64,
    entries: Vec<CacheEntry>,
}

/// Persistent, thread-safe response cache.
///
/// Share across workers with `Arc<PersistentCache>`.
pub struct PersistentCache {
    state: Mutex<CacheState>,
    /// Generation of the last snapshot written, per backing file.
    persisted: Mutex<HashMap<PathBuf, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl PersistentCache {
    /// Create a cache backed by `path`. Nothing is read until first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                path: path.into(),
                stale: false,
                entries: None,
                generation: 0,
            }),
            persisted: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Switch the backing file. The next `get`/`put` reloads from `path`.
    pub fn set_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.state.lock().expect("cache lock poisoned");
        tracing::info!(path = %path.display(), "Cache path set");
        state.path = path;
        state.stale = true;
    }

    /// Current backing file.
    pub fn path(&self) -> PathBuf {
        self.state.lock().expect("cache lock poisoned").path.clone()
    }

    /// Look up a cached result.
    pub fn get(&self, key: &CallKey) -> Option<Value> {
        let hit = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            state.entries().get(key).and_then(|e| e.hit().cloned())
        };

        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result and persist the full map.
    ///
    /// Null values are ignored and `Ok(false)` is returned. The blocked
    /// sentinel is stored as an errored entry, which never counts as a hit.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the snapshot could not be written. The
    /// in-memory entry is kept either way.
    pub fn put(&self, key: CallKey, value: Value) -> Result<bool, StorageError> {
        if value.is_null() {
            return Ok(false);
        }

        let snapshot = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            let entry = CacheEntry::new(key.clone(), value);
            state.entries().insert(key, entry);
            state.generation += 1;
            let generation = state.generation;
            let path = state.path.clone();
            Snapshot {
                path,
                generation,
                entries: state.entries().values().cloned().collect(),
            }
        };

        self.stores.fetch_add(1, Ordering::Relaxed);
        self.write_snapshot(snapshot)?;
        Ok(true)
    }

    /// [`put`](Self::put) from async code, with the encode and disk write
    /// moved onto the blocking thread pool.
    pub async fn put_async(
        self: &Arc<Self>,
        key: CallKey,
        value: Value,
    ) -> Result<bool, StorageError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.put(key, value))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Number of entries in memory, loading from disk if needed.
    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock poisoned").entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }

    fn write_snapshot(&self, mut snapshot: Snapshot) -> Result<(), StorageError> {
        let mut persisted = self.persisted.lock().expect("cache persist lock poisoned");
        let written = persisted.get(&snapshot.path).copied().unwrap_or(0);
        if snapshot.generation <= written {
            tracing::trace!(
                path = %snapshot.path.display(),
                generation = snapshot.generation,
                "Skipping cache snapshot superseded by a newer one"
            );
            return Ok(());
        }

        snapshot.entries.sort_by(|a, b| a.key.cmp(&b.key));
        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: snapshot.entries,
        };
        let bytes = serde_json::to_vec(&file)?;
        AtomicFile::replace(&snapshot.path, &bytes)?;
        persisted.insert(snapshot.path.clone(), snapshot.generation);

        tracing::debug!(
            path = %snapshot.path.display(),
            entries = file.entries.len(),
            "Cache snapshot written"
        );
        Ok(())
    }
}

fn load_entries(path: &Path) -> HashMap<CallKey, CacheEntry> {
    match read_cache_file(path) {
        Ok(Some(entries)) => {
            tracing::info!(path = %path.display(), entries = entries.len(), "Cache loaded");
            entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect()
        }
        Ok(None) => HashMap::new(),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Error loading cache, starting empty"
            );
            HashMap::new()
        }
    }
}

fn read_cache_file(path: &Path) -> Result<Option<Vec<CacheEntry>>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let file: CacheFile = serde_json::from_slice(&bytes)?;
    Ok(Some(file.entries))
}

/// Entry counts of a cache file, for inspection from the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSummary {
    pub total: usize,
    pub valid: usize,
    pub errored: usize,
    /// Entries that exist but would not be served as hits.
    pub unusable: usize,
    pub by_operation: BTreeMap<String, usize>,
}

impl CacheSummary {
    /// Summarize the cache file at `path`. A missing file is an empty cache.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let entries = read_cache_file(path.as_ref())?.unwrap_or_default();
        let mut summary = Self::default();
        for entry in &entries {
            summary.total += 1;
            match entry.state {
                EntryState::Valid => summary.valid += 1,
                EntryState::Errored => summary.errored += 1,
            }
            if entry.hit().is_none() {
                summary.unusable += 1;
            }
            *summary
                .by_operation
                .entry(entry.key.operation().to_string())
                .or_insert(0) += 1;
        }
        Ok(summary)
    }
}
