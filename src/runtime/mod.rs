//! Agent runtime: typed workers with bounded, priority-ordered task
//! queues, plus the knowledge bus connecting them.
//!
//! Every pipeline component runs inside an [`Agent`]: a worker thread
//! draining a bounded priority queue. Task acceptance is strict — an
//! agent rejects with `AgentBusy` (carrying a retry hint) when its
//! queue is full, its memory budget is exceeded, or it is not running;
//! unsupported task types are rejected with `TaskUnsupported`. The
//! rejection is the backpressure signal: callers retry after
//! `retry_after_ms` instead of piling work onto a drowning worker.

pub mod bus;

pub use bus::{topics, KnowledgeBus, KnowledgeEntry, Subscription};

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::types::Timestamp;

/// Default bound on queued tasks per agent.
const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Retry hint returned with `AgentBusy`, per queued task.
const RETRY_PER_QUEUED_MS: u64 = 50;

/// Lifecycle state of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    /// Ready for tasks.
    Idle,
    /// Processing a task.
    Busy,
    /// Last task failed; still accepting work.
    Error,
    /// Shut down; rejects everything.
    Shutdown,
}

/// Static resource limits for an agent.
#[derive(Clone, Copy, Debug)]
pub struct AgentCapabilities {
    /// Queue bound (tasks).
    pub max_queue: usize,
    /// Memory budget for queued payloads, in bytes.
    pub memory_limit_bytes: usize,
    /// Scheduling priority of the agent itself (informational).
    pub priority: u8,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_QUEUE_CAPACITY,
            memory_limit_bytes: 64 * 1024 * 1024,
            priority: 0,
        }
    }
}

/// One unit of work submitted to an agent.
#[derive(Clone, Debug)]
pub struct TaskEnvelope {
    /// Task type tag, matched against the handler's supported set.
    pub task_type: String,
    /// Payload document.
    pub payload: Value,
    /// Higher runs first; equal priorities run FIFO.
    pub priority: u8,
    /// Submission time.
    pub submitted_at: Timestamp,
}

impl TaskEnvelope {
    /// Builds a normal-priority task.
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: 0,
            submitted_at: Timestamp::now(),
        }
    }

    /// Sets the priority, returning self for chaining.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    fn approx_bytes(&self) -> usize {
        self.payload.to_string().len() + self.task_type.len()
    }
}

/// Outcome of one processed task, delivered on the agent's result
/// channel.
#[derive(Clone, Debug)]
pub struct TaskResult {
    /// The processed task's type.
    pub task_type: String,
    /// Handler output, or a structured error message.
    pub outcome: std::result::Result<Value, String>,
    /// Processing time in milliseconds.
    pub time_ms: u64,
}

/// Work implementation plugged into an [`Agent`].
pub trait AgentHandler: Send + 'static {
    /// Agent type tag (for logs and diagnostics).
    fn agent_type(&self) -> &'static str;

    /// Task types this handler accepts.
    fn supported_tasks(&self) -> &[&'static str];

    /// Processes one task.
    fn process(&mut self, task: TaskEnvelope) -> Result<Value>;
}

struct QueuedTask {
    task: TaskEnvelope,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower seq (FIFO).
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    shutting_down: bool,
}

struct AgentShared {
    status: Mutex<AgentStatus>,
    capabilities: AgentCapabilities,
    queue: Mutex<QueueState>,
    queue_signal: Condvar,
    memory_usage: AtomicUsize,
    supported: Vec<&'static str>,
    agent_type: &'static str,
}

/// A worker thread plus its bounded priority queue.
pub struct Agent {
    shared: Arc<AgentShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    results_rx: Receiver<TaskResult>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("type", &self.shared.agent_type)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Spawns an agent around a handler.
    pub fn spawn(mut handler: impl AgentHandler, capabilities: AgentCapabilities) -> Self {
        let shared = Arc::new(AgentShared {
            status: Mutex::new(AgentStatus::Idle),
            capabilities,
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            queue_signal: Condvar::new(),
            memory_usage: AtomicUsize::new(0),
            supported: handler.supported_tasks().to_vec(),
            agent_type: handler.agent_type(),
        });

        // Result channel is bounded too; a reader that stops draining
        // costs result delivery, never processing.
        let (results_tx, results_rx) = bounded::<TaskResult>(DEFAULT_QUEUE_CAPACITY);

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("codegraph-agent-{}", shared.agent_type))
            .spawn(move || worker_loop(worker_shared, &mut handler, results_tx))
            .expect("spawn agent worker");

        info!(agent = shared.agent_type, "Agent started");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            results_rx,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> AgentStatus {
        *self.shared.status.lock()
    }

    /// Tasks currently queued.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Channel carrying processed-task outcomes.
    pub fn results(&self) -> &Receiver<TaskResult> {
        &self.results_rx
    }

    /// Submits a task.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::TaskUnsupported`] for unknown task types
    /// - [`RuntimeError::AgentBusy`] when shut down, the queue is at
    ///   capacity, or the memory budget is exceeded
    pub fn submit(&self, task: TaskEnvelope) -> Result<()> {
        submit_to(&self.shared, task)
    }

    /// Returns a lightweight submit-only handle, usable from bridge
    /// threads without borrowing the agent.
    pub fn submitter(&self) -> AgentSubmitter {
        AgentSubmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops the worker after its current task; queued tasks are
    /// dropped (counted in the log).
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutting_down {
                return;
            }
            queue.shutting_down = true;
            let dropped = queue.heap.len();
            queue.heap.clear();
            if dropped > 0 {
                warn!(
                    agent = self.shared.agent_type,
                    dropped, "Agent shutdown dropped queued tasks"
                );
            }
        }
        self.shared.queue_signal.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        *self.shared.status.lock() = AgentStatus::Shutdown;
        info!(agent = self.shared.agent_type, "Agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Submit-only handle to an agent's queue.
#[derive(Clone)]
pub struct AgentSubmitter {
    shared: Arc<AgentShared>,
}

impl std::fmt::Debug for AgentSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSubmitter")
            .field("type", &self.shared.agent_type)
            .finish()
    }
}

impl AgentSubmitter {
    /// Submits a task; same contract as [`Agent::submit`].
    pub fn submit(&self, task: TaskEnvelope) -> Result<()> {
        submit_to(&self.shared, task)
    }
}

fn submit_to(shared: &Arc<AgentShared>, task: TaskEnvelope) -> Result<()> {
    if !shared.supported.iter().any(|t| *t == task.task_type) {
        return Err(RuntimeError::unsupported(task.task_type).into());
    }

    if *shared.status.lock() == AgentStatus::Shutdown {
        return Err(RuntimeError::busy("agent shut down", 0).into());
    }

    let task_bytes = task.approx_bytes();
    let mut queue = shared.queue.lock();
    if queue.shutting_down {
        return Err(RuntimeError::busy("agent shut down", 0).into());
    }

    let queued = queue.heap.len();
    if queued >= shared.capabilities.max_queue {
        let retry = RETRY_PER_QUEUED_MS * queued as u64;
        return Err(RuntimeError::busy("queue full", retry).into());
    }
    let usage = shared.memory_usage.load(Ordering::Relaxed);
    if usage + task_bytes > shared.capabilities.memory_limit_bytes {
        let retry = RETRY_PER_QUEUED_MS * (queued as u64 + 1);
        return Err(RuntimeError::busy("memory limit", retry).into());
    }

    shared.memory_usage.fetch_add(task_bytes, Ordering::Relaxed);
    let seq = queue.next_seq;
    queue.next_seq += 1;
    queue.heap.push(QueuedTask { task, seq });
    drop(queue);
    shared.queue_signal.notify_one();
    Ok(())
}

fn worker_loop(
    shared: Arc<AgentShared>,
    handler: &mut impl AgentHandler,
    results_tx: Sender<TaskResult>,
) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutting_down {
                    return;
                }
                if let Some(queued) = queue.heap.pop() {
                    break queued.task;
                }
                shared.queue_signal.wait(&mut queue);
            }
        };

        shared
            .memory_usage
            .fetch_sub(task.approx_bytes().min(shared.memory_usage.load(Ordering::Relaxed)), Ordering::Relaxed);

        *shared.status.lock() = AgentStatus::Busy;
        let started = Instant::now();
        let task_type = task.task_type.clone();
        let outcome = handler.process(task);
        let time_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => {
                *shared.status.lock() = AgentStatus::Idle;
            }
            Err(err) => {
                warn!(agent = shared.agent_type, error = %err, "Task failed");
                *shared.status.lock() = AgentStatus::Error;
            }
        }

        let result = TaskResult {
            task_type,
            outcome: outcome.map_err(|e| e.to_string()),
            time_ms,
        };
        if results_tx.try_send(result).is_err() {
            debug!(agent = shared.agent_type, "Result channel full; outcome dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    impl AgentHandler for EchoHandler {
        fn agent_type(&self) -> &'static str {
            "echo"
        }

        fn supported_tasks(&self) -> &[&'static str] {
            &["echo", "fail"]
        }

        fn process(&mut self, task: TaskEnvelope) -> Result<Value> {
            match task.task_type.as_str() {
                "echo" => Ok(task.payload),
                _ => Err(RuntimeError::unsupported("fail").into()),
            }
        }
    }

    #[test]
    fn test_submit_and_process() {
        let agent = Agent::spawn(EchoHandler, AgentCapabilities::default());
        agent
            .submit(TaskEnvelope::new("echo", json!({"x": 1})))
            .unwrap();
        let result = agent
            .results()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(result.task_type, "echo");
        assert_eq!(result.outcome.unwrap(), json!({"x": 1}));
        agent.shutdown();
    }

    #[test]
    fn test_unsupported_task_rejected() {
        let agent = Agent::spawn(EchoHandler, AgentCapabilities::default());
        let err = agent
            .submit(TaskEnvelope::new("unknown", json!(null)))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Runtime(RuntimeError::TaskUnsupported { .. })
        ));
        agent.shutdown();
    }

    #[test]
    fn test_queue_full_is_agent_busy() {
        // Handler that blocks until told, so the queue can fill.
        struct SlowHandler(Receiver<()>);
        impl AgentHandler for SlowHandler {
            fn agent_type(&self) -> &'static str {
                "slow"
            }
            fn supported_tasks(&self) -> &[&'static str] {
                &["work"]
            }
            fn process(&mut self, _task: TaskEnvelope) -> Result<Value> {
                let _ = self.0.recv_timeout(Duration::from_secs(5));
                Ok(Value::Null)
            }
        }

        let (release_tx, release_rx) = bounded::<()>(16);
        let agent = Agent::spawn(
            SlowHandler(release_rx),
            AgentCapabilities {
                max_queue: 2,
                ..Default::default()
            },
        );

        // First task starts processing; two more fill the queue.
        agent.submit(TaskEnvelope::new("work", json!(1))).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        agent.submit(TaskEnvelope::new("work", json!(2))).unwrap();
        agent.submit(TaskEnvelope::new("work", json!(3))).unwrap();

        let err = agent.submit(TaskEnvelope::new("work", json!(4))).unwrap_err();
        match err {
            crate::error::CodeGraphError::Runtime(RuntimeError::AgentBusy {
                reason,
                retry_after_ms,
            }) => {
                assert_eq!(reason, "queue full");
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected AgentBusy, got {other}"),
        }

        for _ in 0..4 {
            let _ = release_tx.send(());
        }
        agent.shutdown();
    }

    #[test]
    fn test_memory_limit_is_agent_busy() {
        struct SlowHandler(Receiver<()>);
        impl AgentHandler for SlowHandler {
            fn agent_type(&self) -> &'static str {
                "slow"
            }
            fn supported_tasks(&self) -> &[&'static str] {
                &["work"]
            }
            fn process(&mut self, _task: TaskEnvelope) -> Result<Value> {
                let _ = self.0.recv_timeout(Duration::from_secs(5));
                Ok(Value::Null)
            }
        }

        let (release_tx, release_rx) = bounded::<()>(16);
        let agent = Agent::spawn(
            SlowHandler(release_rx),
            AgentCapabilities {
                memory_limit_bytes: 64,
                ..Default::default()
            },
        );

        let big = json!({"blob": "x".repeat(256)});
        agent.submit(TaskEnvelope::new("work", json!(1))).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = agent.submit(TaskEnvelope::new("work", big)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Runtime(RuntimeError::AgentBusy { .. })
        ));

        let _ = release_tx.send(());
        agent.shutdown();
    }

    #[test]
    fn test_failed_task_sets_error_status() {
        let agent = Agent::spawn(EchoHandler, AgentCapabilities::default());
        agent.submit(TaskEnvelope::new("fail", json!(null))).unwrap();
        let result = agent
            .results()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert!(result.outcome.is_err());
        assert_eq!(agent.status(), AgentStatus::Error);
        agent.shutdown();
    }

    #[test]
    fn test_priority_order() {
        struct SlowHandler(Receiver<()>, Sender<u64>);
        impl AgentHandler for SlowHandler {
            fn agent_type(&self) -> &'static str {
                "prio"
            }
            fn supported_tasks(&self) -> &[&'static str] {
                &["work"]
            }
            fn process(&mut self, task: TaskEnvelope) -> Result<Value> {
                let _ = self.0.recv_timeout(Duration::from_secs(5));
                let _ = self.1.send(task.payload.as_u64().unwrap_or(0));
                Ok(Value::Null)
            }
        }

        let (release_tx, release_rx) = bounded::<()>(16);
        let (order_tx, order_rx) = bounded::<u64>(16);
        let agent = Agent::spawn(
            SlowHandler(release_rx, order_tx),
            AgentCapabilities::default(),
        );

        // First task occupies the worker; the rest queue up.
        agent.submit(TaskEnvelope::new("work", json!(0))).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        agent
            .submit(TaskEnvelope::new("work", json!(1)).with_priority(0))
            .unwrap();
        agent
            .submit(TaskEnvelope::new("work", json!(2)).with_priority(9))
            .unwrap();

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(order_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        // Task 0 ran first (already in flight); the high-priority task 2
        // jumps ahead of task 1.
        assert_eq!(order, vec![0, 2, 1]);
        agent.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let agent = Agent::spawn(EchoHandler, AgentCapabilities::default());
        agent.shutdown();
        let err = agent.submit(TaskEnvelope::new("echo", json!(null))).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Runtime(RuntimeError::AgentBusy { .. })
        ));
    }
}
