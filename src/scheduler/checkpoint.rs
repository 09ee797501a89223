//! Durable snapshots of partial run results.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::storage::AtomicFile;

use super::job::ResultMap;

/// Destination for periodic result snapshots.
///
/// Called outside every pool lock, one write at a time, on the blocking
/// thread pool.
pub trait CheckpointSink: Send + Sync {
    fn write(&self, results: &ResultMap) -> Result<(), StorageError>;
}

/// Writes the result map as a pretty-printed JSON object, atomically
/// replacing the previous snapshot.
#[derive(Debug, Clone)]
pub struct JsonCheckpoint {
    path: PathBuf,
}

impl JsonCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot currently on disk, if any.
    pub fn load(&self) -> Result<Option<ResultMap>, StorageError> {
        load_previous(&self.path)
    }
}

impl CheckpointSink for JsonCheckpoint {
    fn write(&self, results: &ResultMap) -> Result<(), StorageError> {
        let mut bytes = serde_json::to_vec_pretty(results)?;
        bytes.push(b'\n');
        AtomicFile::replace(&self.path, &bytes)
    }
}

/// Load a checkpoint written by [`JsonCheckpoint`]. A missing file yields
/// `None`.
pub fn load_previous(path: impl AsRef<Path>) -> Result<Option<ResultMap>, StorageError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let results: ResultMap = serde_json::from_slice(&bytes)?;
    Ok(Some(results))
}
