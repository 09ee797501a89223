//! memo-forge: memoized, retrying, checkpointed batch runner for LLM calls.
//!
//! This library lets many concurrent workers call slow, unreliable remote
//! text-generation backends over a large batch of tasks without paying twice
//! for a call that already succeeded and without losing finished work when a
//! run is interrupted.
//!
//! - [`llm`]: the persistent response cache, the retrying caller, backend
//!   routing and reply post-processing
//! - [`scheduler`]: the worker pool, tasks and checkpoints
//! - [`storage`]: atomic file replacement and the append-only audit log

pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod scheduler;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{ConfigError, LlmError, PoolError, StorageError, TaskError};
