//! Fixed-size worker pool with periodic checkpoints.
//!
//! The pool spawns exactly `concurrency` async workers that pull tasks from a
//! shared queue until it is empty. Each result is stored in a shared
//! [`ResultMap`] under the same lock as the completion counter. Every
//! `checkpoint_every` completions a copy of the map is taken under that lock
//! and handed to the [`CheckpointSink`] after releasing it. Sink writes run
//! on the blocking thread pool so disk I/O never stalls the workers.
//!
//! # Features
//!
//! - Bounded concurrency: each worker pulls its next task only after
//!   finishing the previous one
//! - Task isolation: an error or panic in one task records `None` for its id
//! - Monotonic checkpoints: writes are serialized and a snapshot older than
//!   one already written is dropped
//! - Resume: results from a previous checkpoint seed the map, and tasks
//!   that already have a result are not run again. Ids outside the current
//!   task list are dropped
//! - A checkpoint that cannot be written stops the run: workers stop
//!   pulling new tasks, in-flight tasks finish, and the error is returned

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, StorageError, TaskError};
use crate::llm::cache::is_present;

use super::checkpoint::CheckpointSink;
use super::job::{ResultMap, RunSummary, Task};

/// Processes a single task.
///
/// Returning `Ok(None)` means the task ran but produced nothing; errors are
/// logged and also recorded as `None`.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    async fn run(&self, task: &Task) -> Result<Option<Value>, TaskError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub concurrency: usize,
    /// Checkpoint after every this many completed tasks.
    pub checkpoint_every: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            checkpoint_every: 10,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Sets the checkpoint interval.
    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every;
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.checkpoint_every == 0 {
            return Err(PoolError::InvalidConfig(
                "checkpoint_every must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Progress of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    /// Tasks finished in this run, successful or not.
    pub completed: usize,
    /// Tasks scheduled in this run.
    pub total: usize,
}

impl ProgressState {
    /// Completion percentage, 100.0 for an empty run.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }
}

/// Results plus progress, guarded by one lock.
struct RunState {
    results: ResultMap,
    progress: ProgressState,
}

/// State shared by all workers of one run.
struct Shared {
    state: Mutex<RunState>,
    queue: Mutex<VecDeque<Task>>,
    worker: Arc<dyn TaskWorker>,
    sink: Arc<dyn CheckpointSink>,
    checkpoint_every: usize,
    /// Completion count of the last snapshot written.
    last_checkpoint: tokio::sync::Mutex<Option<usize>>,
    failure: Mutex<Option<(usize, StorageError)>>,
    stop: AtomicBool,
    started: Instant,
}

impl Shared {
    fn next_task(&self) -> Option<Task> {
        if self.stop.load(Ordering::SeqCst) {
            return None;
        }
        self.queue.lock().expect("task queue lock poisoned").pop_front()
    }

    /// Record a result and return a snapshot if a checkpoint is due.
    fn complete(&self, id: String, value: Option<Value>) -> Option<(usize, ResultMap)> {
        let mut state = self.state.lock().expect("results lock poisoned");
        state.results.insert(id, value);
        state.progress.completed += 1;
        let completed = state.progress.completed;

        if completed % self.checkpoint_every == 0 {
            Some((completed, state.results.clone()))
        } else {
            None
        }
    }

    fn snapshot(&self) -> (ProgressState, ResultMap) {
        let state = self.state.lock().expect("results lock poisoned");
        (state.progress, state.results.clone())
    }

    /// Write a snapshot unless a newer one is already on disk.
    async fn checkpoint(&self, completed: usize, results: ResultMap, force: bool) {
        let mut last = self.last_checkpoint.lock().await;
        if let Some(written) = *last {
            if completed < written || (completed == written && !force) {
                debug!(completed, written, "Skipping superseded checkpoint");
                return;
            }
        }

        let sink = Arc::clone(&self.sink);
        let written = tokio::task::spawn_blocking(move || sink.write(&results))
            .await
            .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::other(e.to_string()))));

        match written {
            Ok(()) => {
                *last = Some(completed);
                let total = self.state.lock().expect("results lock poisoned").progress.total;
                let progress = ProgressState { completed, total };
                info!(
                    completed,
                    total,
                    progress_pct = %format!("{:.1}", progress.percent()),
                    elapsed_secs = self.started.elapsed().as_secs(),
                    "Checkpoint saved"
                );
            }
            Err(e) => {
                error!(completed, error = %e, "Checkpoint failed, stopping run");
                self.stop.store(true, Ordering::SeqCst);
                let mut failure = self.failure.lock().expect("failure lock poisoned");
                if failure.is_none() {
                    *failure = Some((completed, e));
                }
            }
        }
    }
}

/// Runs a batch of tasks with bounded concurrency and periodic checkpoints.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    previous: ResultMap,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if concurrency or the checkpoint
    /// interval is zero.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            config,
            previous: ResultMap::new(),
        })
    }

    /// Seed the run with results from an earlier checkpoint.
    ///
    /// Ids holding a present result are carried over and their tasks are
    /// skipped; ids holding `None` or an empty value are run again. Ids that
    /// are not in the task list passed to [`run`](Self::run) are ignored.
    pub fn with_previous(mut self, previous: ResultMap) -> Self {
        self.previous = previous;
        self
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Run `tasks` to completion and return every result.
    ///
    /// A final checkpoint is always written after the last task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Checkpoint` if any snapshot could not be written.
    /// Task failures never cause an error.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        worker: Arc<dyn TaskWorker>,
        sink: Arc<dyn CheckpointSink>,
    ) -> Result<ResultMap, PoolError> {
        let (results, resumed) = self.seed(&tasks);
        let pending: VecDeque<Task> = tasks
            .into_iter()
            .filter(|task| !results.contains_key(&task.id))
            .collect();
        let total = pending.len();

        if resumed > 0 {
            info!(resumed, remaining = total, "Resuming from previous results");
        }
        info!(
            tasks = total,
            concurrency = self.config.concurrency,
            checkpoint_every = self.config.checkpoint_every,
            "Starting batch run"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(RunState {
                results,
                progress: ProgressState {
                    completed: 0,
                    total,
                },
            }),
            queue: Mutex::new(pending),
            worker,
            sink,
            checkpoint_every: self.config.checkpoint_every,
            last_checkpoint: tokio::sync::Mutex::new(None),
            failure: Mutex::new(None),
            stop: AtomicBool::new(false),
            started: Instant::now(),
        });

        let handles: Vec<_> = (0..self.config.concurrency)
            .map(|i| tokio::spawn(worker_loop(format!("worker-{i}"), Arc::clone(&shared))))
            .collect();

        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        if let Some((completed, source)) = take_failure(&shared) {
            return Err(PoolError::Checkpoint { completed, source });
        }

        let (progress, results) = shared.snapshot();
        shared.checkpoint(progress.completed, results.clone(), true).await;
        if let Some((completed, source)) = take_failure(&shared) {
            return Err(PoolError::Checkpoint { completed, source });
        }

        let summary = RunSummary::from_results(&results, resumed);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            resumed = summary.resumed,
            elapsed_secs = shared.started.elapsed().as_secs(),
            "Batch run complete"
        );

        Ok(results)
    }

    fn seed(&self, tasks: &[Task]) -> (ResultMap, usize) {
        let ids: HashSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        let results: ResultMap = self
            .previous
            .iter()
            .filter(|(id, _)| ids.contains(id.as_str()))
            .filter(|(_, value)| value.as_ref().is_some_and(is_present))
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        let resumed = results.len();
        (results, resumed)
    }
}

fn take_failure(shared: &Shared) -> Option<(usize, StorageError)> {
    shared.failure.lock().expect("failure lock poisoned").take()
}

async fn worker_loop(worker_id: String, shared: Arc<Shared>) {
    debug!(worker_id = %worker_id, "Worker started");

    while let Some(task) = shared.next_task() {
        let outcome = AssertUnwindSafe(shared.worker.run(&task))
            .catch_unwind()
            .await;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(worker_id = %worker_id, task_id = %task.id, error = %e, "Task failed");
                None
            }
            Err(panic) => {
                error!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    panic = panic_message(panic.as_ref()),
                    "Task panicked"
                );
                None
            }
        };

        debug!(worker_id = %worker_id, task_id = %task.id, success = value.is_some(), "Task finished");

        if let Some((completed, snapshot)) = shared.complete(task.id, value) {
            shared.checkpoint(completed, snapshot, false).await;
        }
    }

    debug!(worker_id = %worker_id, "Worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::checkpoint::JsonCheckpoint;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Echoes the payload, failing or panicking on marked tasks.
    struct EchoWorker {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl EchoWorker {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl TaskWorker for EchoWorker {
        async fn run(&self, task: &Task) -> Result<Option<Value>, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match task.payload.get("mode").and_then(Value::as_str) {
                Some("error") => Err(TaskError::InvalidPayload {
                    id: task.id.clone(),
                    reason: "boom".to_string(),
                }),
                Some("panic") => panic!("worker exploded on {}", task.id),
                _ => Ok(Some(json!(format!("done-{}", task.id)))),
            }
        }
    }

    /// Keeps every snapshot it is handed.
    #[derive(Default)]
    struct RecordingSink {
        snapshots: Mutex<Vec<ResultMap>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn sizes(&self) -> Vec<usize> {
            self.snapshots.lock().unwrap().iter().map(|s| s.len()).collect()
        }
    }

    impl CheckpointSink for RecordingSink {
        fn write(&self, results: &ResultMap) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.snapshots.lock().unwrap().push(results.clone());
            Ok(())
        }
    }

    fn tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| Task::new(format!("t{i:02}"), json!({})))
            .collect()
    }

    async fn run_pool(
        config: WorkerPoolConfig,
        tasks: Vec<Task>,
        worker: Arc<EchoWorker>,
        sink: Arc<RecordingSink>,
    ) -> Result<ResultMap, PoolError> {
        WorkerPool::new(config)
            .unwrap()
            .run(tasks, worker, sink)
            .await
    }

    #[tokio::test]
    async fn test_sequential_checkpoints_at_interval_and_end() {
        let sink = Arc::new(RecordingSink::default());
        let results = run_pool(
            WorkerPoolConfig::new(1).with_checkpoint_every(10),
            tasks(25),
            Arc::new(EchoWorker::new()),
            sink.clone(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 25);
        assert_eq!(sink.sizes(), vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn test_concurrent_checkpoints_are_supersets() {
        let sink = Arc::new(RecordingSink::default());
        run_pool(
            WorkerPoolConfig::new(4).with_checkpoint_every(10),
            tasks(25),
            Arc::new(EchoWorker::with_delay(Duration::from_millis(2))),
            sink.clone(),
        )
        .await
        .unwrap();

        let snapshots = sink.snapshots.lock().unwrap().clone();
        assert_eq!(snapshots.last().map(|s| s.len()), Some(25));
        for pair in snapshots.windows(2) {
            assert!(pair[0].len() <= pair[1].len());
            for id in pair[0].keys() {
                assert!(pair[1].contains_key(id), "snapshot lost {id}");
            }
        }
    }

    #[tokio::test]
    async fn test_final_checkpoint_is_unconditional() {
        let sink = Arc::new(RecordingSink::default());
        run_pool(
            WorkerPoolConfig::new(1).with_checkpoint_every(5),
            tasks(10),
            Arc::new(EchoWorker::new()),
            sink.clone(),
        )
        .await
        .unwrap();

        assert_eq!(sink.sizes(), vec![5, 10, 10]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let mut batch = tasks(10);
        batch[3].payload = json!({"mode": "error"});
        batch[7].payload = json!({"mode": "panic"});
        let worker = Arc::new(EchoWorker::new());

        let results = run_pool(
            WorkerPoolConfig::new(3),
            batch,
            worker.clone(),
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(results["t03"], None);
        assert_eq!(results["t07"], None);
        assert_eq!(results["t00"], Some(json!("done-t00")));
        assert_eq!(results.values().filter(|v| v.is_some()).count(), 8);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let worker = Arc::new(EchoWorker::with_delay(Duration::from_millis(10)));
        run_pool(
            WorkerPoolConfig::new(3),
            tasks(12),
            worker.clone(),
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap();

        let peak = worker.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeds 3");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_empty_run_still_checkpoints() {
        let sink = Arc::new(RecordingSink::default());
        let results = run_pool(
            WorkerPoolConfig::default(),
            Vec::new(),
            Arc::new(EchoWorker::new()),
            sink.clone(),
        )
        .await
        .unwrap();

        assert!(results.is_empty());
        assert_eq!(sink.sizes(), vec![0]);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_stops_run() {
        let worker = Arc::new(EchoWorker::new());
        let err = run_pool(
            WorkerPoolConfig::new(1).with_checkpoint_every(5),
            tasks(20),
            worker.clone(),
            Arc::new(RecordingSink::failing()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PoolError::Checkpoint { completed: 5, .. }));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_tasks() {
        let mut previous = ResultMap::new();
        previous.insert("t00".into(), Some(json!("earlier")));
        previous.insert("t01".into(), None);
        previous.insert("t02".into(), Some(json!("")));
        let worker = Arc::new(EchoWorker::new());

        let results = WorkerPool::new(WorkerPoolConfig::new(2))
            .unwrap()
            .with_previous(previous)
            .run(tasks(4), worker.clone(), Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(results["t00"], Some(json!("earlier")));
        assert_eq!(results["t01"], Some(json!("done-t01")));
        assert_eq!(results["t02"], Some(json!("done-t02")));
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn test_resume_ignores_ids_outside_task_list() {
        let mut previous = ResultMap::new();
        previous.insert("t00".into(), Some(json!("earlier")));
        previous.insert("retired".into(), Some(json!("stale")));
        let worker = Arc::new(EchoWorker::new());
        let sink = Arc::new(RecordingSink::default());

        let results = WorkerPool::new(WorkerPoolConfig::new(2))
            .unwrap()
            .with_previous(previous)
            .run(tasks(3), worker.clone(), sink.clone())
            .await
            .unwrap();

        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
        assert!(!results.contains_key("retired"));
        assert_eq!(results.len(), 3);
        assert_eq!(RunSummary::from_results(&results, 1).total, 3);
        assert!(sink
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .all(|snapshot| !snapshot.contains_key("retired")));
    }

    /// Signals the sink from inside a task after an async sleep.
    struct SignallingWorker {
        signal: Mutex<std::sync::mpsc::Sender<()>>,
    }

    #[async_trait]
    impl TaskWorker for SignallingWorker {
        async fn run(&self, task: &Task) -> Result<Option<Value>, TaskError> {
            if task.id == "slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = self.signal.lock().unwrap().send(());
            }
            Ok(Some(json!(task.id)))
        }
    }

    /// Its first write blocks the calling thread until the worker signals.
    struct BlockingSink {
        signal: Mutex<std::sync::mpsc::Receiver<()>>,
        first_write_saw_signal: Mutex<Option<bool>>,
    }

    impl CheckpointSink for BlockingSink {
        fn write(&self, _results: &ResultMap) -> Result<(), StorageError> {
            let mut seen = self.first_write_saw_signal.lock().unwrap();
            if seen.is_none() {
                let received = self
                    .signal
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(2))
                    .is_ok();
                *seen = Some(received);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_write_does_not_stall_other_workers() {
        // Single-threaded runtime: a sink write on the runtime thread would
        // keep the slow task's timer from ever firing.
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = Arc::new(SignallingWorker {
            signal: Mutex::new(tx),
        });
        let sink = Arc::new(BlockingSink {
            signal: Mutex::new(rx),
            first_write_saw_signal: Mutex::new(None),
        });
        let tasks = vec![
            Task::new("fast", json!({})),
            Task::new("slow", json!({})),
        ];

        let results = WorkerPool::new(WorkerPoolConfig::new(2).with_checkpoint_every(1))
            .unwrap()
            .run(tasks, worker, sink.clone())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(*sink.first_write_saw_signal.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_json_checkpoint_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonCheckpoint::new(dir.path().join("results.json")));

        WorkerPool::new(WorkerPoolConfig::new(2).with_checkpoint_every(3))
            .unwrap()
            .run(tasks(7), Arc::new(EchoWorker::new()), sink.clone())
            .await
            .unwrap();

        let on_disk = sink.load().unwrap().unwrap();
        assert_eq!(on_disk.len(), 7);
        assert_eq!(on_disk["t06"], Some(json!("done-t06")));
    }

    #[test]
    fn test_invalid_config() {
        assert!(WorkerPool::new(WorkerPoolConfig::new(0)).is_err());
        assert!(WorkerPool::new(WorkerPoolConfig::new(1).with_checkpoint_every(0)).is_err());
    }

    #[test]
    fn test_progress_percent() {
        let progress = ProgressState {
            completed: 1,
            total: 4,
        };
        assert_eq!(progress.percent(), 25.0);
        assert_eq!(ProgressState::default().percent(), 100.0);
    }
}
