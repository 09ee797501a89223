//! Task worker that answers each task with one memoized LLM call.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::TaskError;
use crate::llm::{PostProcessor, RetryingCaller};

use super::job::Task;
use super::worker_pool::TaskWorker;

/// Runs every task through a shared [`RetryingCaller`].
///
/// The operation comes from the task payload's `operation` field when
/// present, otherwise from the run default.
pub struct LlmTaskWorker {
    caller: Arc<RetryingCaller>,
    operation: String,
    processors: Vec<Arc<dyn PostProcessor>>,
}

impl LlmTaskWorker {
    pub fn new(caller: Arc<RetryingCaller>, operation: impl Into<String>) -> Self {
        Self {
            caller,
            operation: operation.into(),
            processors: Vec::new(),
        }
    }

    /// Appends a post-processor to the chain applied to every reply.
    pub fn with_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

#[async_trait]
impl TaskWorker for LlmTaskWorker {
    async fn run(&self, task: &Task) -> Result<Option<Value>, TaskError> {
        let messages = task.messages()?;
        let operation = task.operation().unwrap_or(&self.operation);
        Ok(self.caller.call(operation, &messages, &self.processors).await)
    }
}
