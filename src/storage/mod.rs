//! Durable storage primitives.
//!
//! - [`AtomicFile`]: crash-safe whole-file replace used by the response cache
//!   and by batch checkpoints.
//! - [`AppendLog`]: thread-safe JSON Lines sink for auditing raw backend
//!   exchanges.

pub mod append_log;
pub mod atomic;

pub use append_log::AppendLog;
pub use atomic::{temp_dir_for, AtomicFile, StagedFile, TEMP_DIR_NAME};
