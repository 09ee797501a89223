//! Task definitions for batch runs.
//!
//! This module defines the types flowing through a run:
//!
//! - `Task`: one entity to process, identified by a unique id
//! - `ResultMap`: task id to result, the unit that gets checkpointed
//! - `RunSummary`: counts reported at the end of a run
//!
//! Tasks are read from JSON Lines (one record per line) or from a JSON
//! document holding either an array of records or an object keyed by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::TaskError;
use crate::llm::cache::is_present;
use crate::llm::Message;

/// Results of a run, keyed by task id. `None` marks a task that produced
/// nothing.
pub type ResultMap = BTreeMap<String, Option<Value>>;

/// A unit of work: an id plus an opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier within a run.
    pub id: String,
    /// Whatever the worker needs; the pool never looks inside.
    pub payload: Value,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Task whose payload is a single prompt string.
    pub fn prompt(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(id, serde_json::json!({ "prompt": prompt.into() }))
    }

    /// Chat messages described by the payload.
    ///
    /// Accepts a `messages` array of `{role, content}` objects, or a `prompt`
    /// string (with an optional `system` string) promoted to messages.
    pub fn messages(&self) -> Result<Vec<Message>, TaskError> {
        messages_from_payload(&self.id, &self.payload)
    }

    /// Operation named by the payload, overriding the run default.
    pub fn operation(&self) -> Option<&str> {
        self.payload.get("operation").and_then(Value::as_str)
    }
}

/// Turn a task payload into chat messages.
pub fn messages_from_payload(id: &str, payload: &Value) -> Result<Vec<Message>, TaskError> {
    let invalid = |reason: &str| TaskError::InvalidPayload {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if let Some(messages) = payload.get("messages") {
        let messages: Vec<Message> = serde_json::from_value(messages.clone())
            .map_err(|e| invalid(&format!("bad 'messages': {e}")))?;
        if messages.is_empty() {
            return Err(invalid("'messages' is empty"));
        }
        return Ok(messages);
    }

    let prompt = match payload {
        Value::String(prompt) => prompt.as_str(),
        _ => payload
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("expected 'messages' or 'prompt'"))?,
    };
    if prompt.trim().is_empty() {
        return Err(invalid("'prompt' is empty"));
    }

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = payload.get("system").and_then(Value::as_str) {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));
    Ok(messages)
}

/// Load tasks from a `.jsonl` or `.json` file.
///
/// Each record is an object with an `id` (string or integer); the whole
/// record becomes the payload. Ids must be unique.
///
/// # Errors
///
/// Returns `TaskError` if the file cannot be read or parsed, a record has no
/// id, or an id repeats.
pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>, TaskError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| TaskError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_jsonl = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));

    let tasks = if is_jsonl {
        parse_jsonl(&content)?
    } else {
        parse_json(&content)?
    };

    let mut seen = HashSet::with_capacity(tasks.len());
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(TaskError::DuplicateId(task.id.clone()));
        }
    }

    tracing::info!(path = %path.display(), tasks = tasks.len(), "Tasks loaded");
    Ok(tasks)
}

fn parse_jsonl(content: &str) -> Result<Vec<Task>, TaskError> {
    let mut tasks = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(line).map_err(|source| TaskError::Parse {
            line: index + 1,
            source,
        })?;
        tasks.push(task_from_record(index + 1, record)?);
    }
    Ok(tasks)
}

fn parse_json(content: &str) -> Result<Vec<Task>, TaskError> {
    let document: Value =
        serde_json::from_str(content).map_err(|source| TaskError::Parse { line: 1, source })?;

    match document {
        Value::Array(records) => records
            .into_iter()
            .enumerate()
            .map(|(index, record)| task_from_record(index + 1, record))
            .collect(),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(id, payload)| Task::new(id, payload))
            .collect()),
        _ => Err(TaskError::MissingId(1)),
    }
}

fn task_from_record(index: usize, record: Value) -> Result<Task, TaskError> {
    let id = match record.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(TaskError::MissingId(index)),
    };
    Ok(Task::new(id, record))
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Ids in the final result map.
    pub total: usize,
    /// Ids holding a usable result.
    pub succeeded: usize,
    /// Ids that ended with no result.
    pub failed: usize,
    /// Ids carried over from a previous checkpoint without re-running.
    pub resumed: usize,
}

impl RunSummary {
    pub fn from_results(results: &ResultMap, resumed: usize) -> Self {
        let succeeded = results
            .values()
            .filter(|v| v.as_ref().is_some_and(is_present))
            .count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            resumed,
        }
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / self.total as f64) * 100.0
    }
}
