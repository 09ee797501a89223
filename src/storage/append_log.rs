//! Append-only JSON Lines sink for raw request/response auditing.
//!
//! Each record is serialized to a single line and appended under one mutex
//! that also guards the file handle, then flushed so that a crash loses at
//! most the record being written. The log has its own lifecycle
//! (`open` / `close`), independent of the response cache.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::StorageError;

struct OpenLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Thread-safe append-only JSON Lines writer.
///
/// At most one file handle is open per instance. Share it across workers
/// with `Arc<AppendLog>`.
#[derive(Default)]
pub struct AppendLog {
    inner: Mutex<Option<OpenLog>>,
}

impl AppendLog {
    /// Create a closed log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log and open it at `path` in one step.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let log = Self::new();
        log.open(path)?;
        Ok(log)
    }

    /// Open `path` for appending, creating parent directories if needed.
    ///
    /// Does nothing if a handle is already open, even for a different path.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let mut guard = self.inner.lock().expect("audit log lock poisoned");
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *guard = Some(OpenLog {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        });

        tracing::debug!(path = %path.display(), "Audit log opened");
        Ok(())
    }

    /// Append one record as a single JSON line and flush it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LogClosed` if the log is not open.
    pub fn write<T: Serialize>(&self, record: &T) -> Result<(), StorageError> {
        // Serialize before taking the lock; serde_json never emits raw newlines.
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.inner.lock().expect("audit log lock poisoned");
        let log = guard.as_mut().ok_or(StorageError::LogClosed)?;
        log.writer.write_all(&line)?;
        log.writer.flush()?;
        Ok(())
    }

    /// Flush and release the file handle. Safe to call when not open.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.inner.lock().expect("audit log lock poisoned");
        if let Some(mut log) = guard.take() {
            log.writer.flush()?;
            tracing::debug!(path = %log.path.display(), "Audit log closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("audit log lock poisoned").is_some()
    }

    /// Path of the currently open file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .expect("audit log lock poisoned")
            .as_ref()
            .map(|log| log.path.clone())
    }
}

impl Drop for AppendLog {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(log) = guard.as_mut() {
                let _ = log.writer.flush();
            }
        }
    }
}
