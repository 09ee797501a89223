//! Error types for memo-forge operations.
//!
//! Defines error types for the subsystems that are allowed to fail hard:
//! - Durable storage (atomic replace, cache snapshots, audit log)
//! - LLM backend construction and transport
//! - Configuration loading and validation
//! - Task file parsing
//! - Batch runs (checkpoint persistence)
//!
//! Individual call failures never surface here: the retrying caller absorbs
//! them and reports "no result" instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while persisting or loading files.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create temp directory '{path}': {source}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace '{path}': {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Audit log is not open")]
    LogClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during LLM backend operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for backend '{0}'")]
    MissingApiKey(String),

    #[error("No backend registered for operation '{0}'")]
    UnknownOperation(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported config format '{0}': expected .json, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors in task definitions.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Failed to read tasks from '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task record at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Task record {0} has no usable 'id'")]
    MissingId(usize),

    #[error("Duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("Invalid payload for task '{id}': {reason}")]
    InvalidPayload { id: String, reason: String },
}

/// Errors that abort a batch run.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint failed after {completed} completed tasks: {source}")]
    Checkpoint {
        completed: usize,
        #[source]
        source: StorageError,
    },

    #[error("Failed to load previous results: {0}")]
    Resume(#[source] StorageError),
}
