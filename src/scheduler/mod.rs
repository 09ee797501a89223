//! Batch execution with a fixed-size worker pool and durable checkpoints.
//!
//! This module provides the infrastructure for running a list of tasks:
//!
//! - **Task**: an id plus an opaque payload, loaded from JSON or JSON Lines
//! - **WorkerPool**: runs tasks with bounded concurrency and isolates failures
//! - **CheckpointSink**: receives periodic snapshots of the result map
//! - **LlmTaskWorker**: answers each task with one memoized LLM call
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Task queue  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │                   │                   │
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      ┌──────────────┐   every K   ┌────────────┐
//!                      │  Result map  │ ──────────▶ │ Checkpoint │
//!                      └──────────────┘             └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use memo_forge::scheduler::{JsonCheckpoint, LlmTaskWorker, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let tasks = memo_forge::scheduler::load_tasks("tasks.jsonl")?;
//! let worker = Arc::new(LlmTaskWorker::new(caller, "gpt-4o"));
//! let sink = Arc::new(JsonCheckpoint::new("results.json"));
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new(3).with_checkpoint_every(10))?;
//! let results = pool.run(tasks, worker, sink).await?;
//! ```

pub mod checkpoint;
pub mod job;
pub mod llm_worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use checkpoint::{load_previous, CheckpointSink, JsonCheckpoint};
pub use job::{load_tasks, messages_from_payload, ResultMap, RunSummary, Task};
pub use llm_worker::LlmTaskWorker;
pub use worker_pool::{ProgressState, TaskWorker, WorkerPool, WorkerPoolConfig};
