//! Crash-safe whole-file replacement.
//!
//! Content is first written to a temporary file inside a `temp/` directory
//! next to the target, flushed and synced, and only then renamed over the
//! target. Readers therefore see either the previous complete file or the new
//! complete file, never a partial write. If the process dies before the
//! rename, the target keeps its previous content and the temporary file is
//! left orphaned in `temp/`.
//!
//! # Usage
//!
//! ```ignore
//! use memo_forge::storage::AtomicFile;
//!
//! AtomicFile::replace("results/out.json", b"{}")?;
//! ```

use std::fs::{self, Permissions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::StorageError;

/// Name of the directory, next to the target, that holds in-flight writes.
pub const TEMP_DIR_NAME: &str = "temp";

/// Namespace for atomic replace operations.
pub struct AtomicFile;

impl AtomicFile {
    /// Replace `path` with `content` atomically.
    ///
    /// Pre-existing permissions of `path` are carried over to the new file.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::TempDir` if the sibling temp directory cannot be
    /// created, and `StorageError::Replace` if the write or the final rename
    /// fails. In both cases `path` is left untouched.
    pub fn replace(path: impl AsRef<Path>, content: &[u8]) -> Result<(), StorageError> {
        Self::stage(path, content)?.commit()
    }

    /// Write `content` to a temporary sibling of `path` without touching `path`.
    ///
    /// The returned [`StagedFile`] must be committed to take effect. Dropping
    /// it removes the temporary file.
    pub fn stage(path: impl AsRef<Path>, content: &[u8]) -> Result<StagedFile, StorageError> {
        let target = path.as_ref().to_path_buf();
        let temp_dir = temp_dir_for(&target);

        fs::create_dir_all(&temp_dir).map_err(|source| StorageError::TempDir {
            path: temp_dir.clone(),
            source,
        })?;

        let replace_err = |source| StorageError::Replace {
            path: target.clone(),
            source,
        };

        let mut temp = NamedTempFile::new_in(&temp_dir).map_err(replace_err)?;
        temp.write_all(content).map_err(replace_err)?;
        temp.flush().map_err(replace_err)?;
        temp.as_file().sync_all().map_err(replace_err)?;

        let permissions = match fs::metadata(&target) {
            Ok(meta) => Some(meta.permissions()),
            Err(_) => None,
        };

        Ok(StagedFile {
            temp,
            target,
            permissions,
        })
    }
}

/// A fully written temporary file waiting to be renamed over its target.
pub struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
    permissions: Option<Permissions>,
}

impl StagedFile {
    /// Path of the temporary file holding the staged content.
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Path that will be replaced on commit.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the staged file over the target.
    pub fn commit(self) -> Result<(), StorageError> {
        let StagedFile {
            temp,
            target,
            permissions,
        } = self;

        if let Some(perms) = permissions {
            fs::set_permissions(temp.path(), perms).map_err(|source| StorageError::Replace {
                path: target.clone(),
                source,
            })?;
        }

        temp.persist(&target).map_err(|e| StorageError::Replace {
            path: target.clone(),
            source: e.error,
        })?;

        tracing::trace!(path = %target.display(), "File replaced atomically");
        Ok(())
    }
}

/// Directory that receives temporary files for `target`.
pub fn temp_dir_for(target: &Path) -> PathBuf {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(TEMP_DIR_NAME),
        _ => PathBuf::from(".").join(TEMP_DIR_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_creates_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out.json");

        AtomicFile::replace(&target, b"{\"a\":1}").expect("replace");

        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");
        assert!(dir.path().join(TEMP_DIR_NAME).is_dir());
    }

    #[test]
    fn test_replace_overwrites_existing_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out.json");
        fs::write(&target, "old content that is longer than the new one").unwrap();

        AtomicFile::replace(&target, b"new").expect("replace");

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
    }

    #[test]
    fn test_replace_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out.json");

        AtomicFile::replace(&target, b"one").unwrap();
        AtomicFile::replace(&target, b"two").unwrap();

        let leftovers = fs::read_dir(dir.path().join(TEMP_DIR_NAME)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("cache.json");
        fs::write(&target, "previous").unwrap();

        let staged = AtomicFile::stage(&target, b"half-finished snapshot").unwrap();
        let temp_path = staged.temp_path().to_path_buf();
        // Simulate the process dying between the write and the rename.
        std::mem::forget(staged);

        assert_eq!(fs::read_to_string(&target).unwrap(), "previous");
        assert_eq!(
            fs::read_to_string(&temp_path).unwrap(),
            "half-finished snapshot"
        );
    }

    #[test]
    fn test_dropped_stage_removes_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("cache.json");

        let staged = AtomicFile::stage(&target, b"abandoned").unwrap();
        let temp_path = staged.temp_path().to_path_buf();
        drop(staged);

        assert!(!temp_path.exists());
        assert!(!target.exists());
    }

    #[test]
    fn test_temp_dir_unavailable_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the temp directory should go.
        fs::write(dir.path().join(TEMP_DIR_NAME), "not a directory").unwrap();
        let target = dir.path().join("out.json");

        let err = AtomicFile::replace(&target, b"data").unwrap_err();
        assert!(matches!(err, StorageError::TempDir { .. }));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_replace_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out.json");
        fs::write(&target, "old").unwrap();
        fs::set_permissions(&target, Permissions::from_mode(0o640)).unwrap();

        AtomicFile::replace(&target, b"new").unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_temp_dir_for_bare_file_name() {
        assert_eq!(
            temp_dir_for(Path::new("cache.json")),
            PathBuf::from(".").join(TEMP_DIR_NAME)
        );
        assert_eq!(
            temp_dir_for(Path::new("results/out.json")),
            PathBuf::from("results").join(TEMP_DIR_NAME)
        );
    }
}
