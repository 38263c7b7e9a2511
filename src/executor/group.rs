//! Bounded task groups
//!
//! A [`TaskGroup`] runs a batch of independent tasks concurrently, bounded by
//! a worker limit and a shared wall-clock deadline. Closing the group waits
//! for the batch, requests shutdown of whatever is still pending once the
//! deadline passes, and resolves every handle so that no task error is lost.
//!
//! Tasks are never forcibly interrupted. A deadline only stops the group from
//! waiting and, with `cancel_pending`, keeps queued tasks from starting.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{unconstrained, JoinError, JoinHandle};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::process::ProcessTask;

/// Deadline applied when none is configured
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(3600);

/// Interval at which scope exit polls for unfinished tasks
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kind of worker a group dispatches tasks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Tasks run on the runtime's worker threads and share the caller's memory
    #[default]
    Thread,
    /// Tasks run as child processes with isolated memory
    Process,
}

impl Backend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "thread" | "threads" => Some(Backend::Thread),
            "process" | "processes" => Some(Backend::Process),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Thread => write!(f, "thread"),
            Backend::Process => write!(f, "process"),
        }
    }
}

/// Task group configuration
#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub backend: Backend,

    /// Wall-clock budget for the whole group; `None` means [`DEFAULT_DEADLINE`]
    pub deadline: Option<Duration>,

    /// Maximum tasks executing at once; `None` picks a default per backend
    pub max_workers: Option<usize>,

    /// Cancel tasks that have not started when the deadline passes
    pub cancel_pending: bool,

    pub poll_interval: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Thread,
            deadline: None,
            max_workers: None,
            cancel_pending: false,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl GroupConfig {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn cancel_pending(mut self, cancel: bool) -> Self {
        self.cancel_pending = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline.unwrap_or(DEFAULT_DEADLINE)
    }

    /// Effective worker limit
    pub fn workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let default = match self.backend {
            Backend::Thread => (cpus + 4).min(32),
            Backend::Process => cpus,
        };
        self.max_workers.unwrap_or(default).max(1)
    }
}

/// Error resolved from a task handle
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {index} failed: {message}")]
    Failed { index: usize, message: String },

    #[error("task {index} panicked: {message}")]
    Panicked { index: usize, message: String },

    #[error("task {index} was cancelled before it started")]
    Cancelled { index: usize },

    #[error("task {index} did not finish before the group deadline")]
    TimedOut { index: usize },

    #[error("task {index} cannot run on a {backend}-backed group")]
    BackendMismatch { index: usize, backend: Backend },
}

impl TaskError {
    pub fn index(&self) -> usize {
        match self {
            TaskError::Failed { index, .. }
            | TaskError::Panicked { index, .. }
            | TaskError::Cancelled { index }
            | TaskError::TimedOut { index }
            | TaskError::BackendMismatch { index, .. } => *index,
        }
    }

    /// Cancelled and timed-out tasks are left incomplete by the deadline
    /// rather than failed by their own body.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. } | TaskError::TimedOut { .. })
    }
}

/// Outcome of one task
pub type TaskOutcome<T> = Result<T, TaskError>;

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// Observable reference to a submitted task.
///
/// Cheap to clone; the owning group is the only party that resolves it.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    index: usize,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: Arc::new(AtomicU8::new(QUEUED)),
        }
    }

    /// Position of the task in spawn order
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state.load(Ordering::SeqCst), STARTED | FINISHED)
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FINISHED
    }

    /// True once the task was prevented from starting
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_finished(&self) {
        self.state.store(FINISHED, Ordering::SeqCst);
    }
}

/// Context handed to every task body
#[derive(Clone, Debug)]
pub struct TaskContext {
    index: usize,
    shutdown: CancellationToken,
}

impl TaskContext {
    pub fn index(&self) -> usize {
        self.index
    }

    /// True once the group stopped waiting for its tasks
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Completes when the group requests shutdown
    pub async fn shutdown(&self) {
        self.shutdown.cancelled().await
    }
}

enum Slot<T> {
    Running(JoinHandle<TaskOutcome<T>>),
    Resolved(TaskOutcome<T>),
    /// Value moved into the group's results
    Collected,
}

struct Spawned<T> {
    handle: TaskHandle,
    slot: Slot<T>,
    yielded: bool,
    recorded: bool,
}

/// Bounded group of concurrently running tasks
pub struct TaskGroup<T> {
    config: GroupConfig,
    permits: Arc<Semaphore>,
    pending: CancellationToken,
    shutdown: CancellationToken,
    tasks: Vec<Spawned<T>>,
    results: Vec<T>,
    cursor: usize,
    end: Option<Instant>,
    closed: bool,
    timed_out: bool,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(config: GroupConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers()));
        Self {
            config,
            permits,
            pending: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            results: Vec::new(),
            cursor: 0,
            end: None,
            closed: false,
            timed_out: false,
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Number of tasks ever spawned in this group
    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Successful values in spawn order; complete only after [`close`](Self::close)
    pub fn results(&self) -> &[T] {
        &self.results
    }

    /// True if the deadline passed with tasks still pending
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Number of handles with no outcome yet
    pub fn unresolved(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.slot, Slot::Running(_)))
            .count()
    }

    pub fn handles(&self) -> impl Iterator<Item = &TaskHandle> {
        self.tasks.iter().map(|t| &t.handle)
    }

    /// Submit a task to a thread-backed group
    pub fn spawn<F, Fut>(&mut self, f: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.config.backend != Backend::Thread {
            return self.reject();
        }
        let ctx = TaskContext {
            index: self.tasks.len(),
            shutdown: self.shutdown.clone(),
        };
        self.dispatch(move || f(ctx))
    }

    /// Submit a child-process task to a process-backed group
    pub fn spawn_process(&mut self, task: ProcessTask<T>) -> TaskHandle {
        if self.config.backend != Backend::Process {
            return self.reject();
        }
        self.dispatch(move || task.run())
    }

    fn reject(&mut self) -> TaskHandle {
        let handle = TaskHandle::new(self.tasks.len());
        let error = TaskError::BackendMismatch {
            index: handle.index,
            backend: self.config.backend,
        };
        warn!("{}", error);
        self.push(handle.clone(), Slot::Resolved(Err(error)));
        handle
    }

    fn dispatch<B, Fut>(&mut self, body: B) -> TaskHandle
    where
        B: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let handle = TaskHandle::new(self.tasks.len());
        let index = handle.index;
        let permits = Arc::clone(&self.permits);
        let pending = self.pending.clone();
        let task_handle = handle.clone();

        let join = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = pending.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            if permit.is_none() || !task_handle.try_start() {
                task_handle.try_cancel();
                return Err(TaskError::Cancelled { index });
            }

            debug!("Task {} started", index);
            let outcome = AssertUnwindSafe(async move { body().await })
                .catch_unwind()
                .await;
            task_handle.mark_finished();
            drop(permit);

            match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Failed {
                    index,
                    message: format!("{e:#}"),
                }),
                Err(panic) => Err(TaskError::Panicked {
                    index,
                    message: panic_message(panic.as_ref()),
                }),
            }
        });

        self.push(handle.clone(), Slot::Running(join));
        handle
    }

    fn push(&mut self, handle: TaskHandle, slot: Slot<T>) {
        self.tasks.push(Spawned {
            handle,
            slot,
            yielded: false,
            recorded: false,
        });
    }

    /// End time shared by iteration and scope exit, fixed on first use
    fn end_time(&mut self) -> Instant {
        *self
            .end
            .get_or_insert_with(|| Instant::now() + self.config.deadline())
    }

    /// Wait for a single task until `until`, leaving it running on timeout
    async fn resolve(&mut self, index: usize, until: Instant) {
        let task = &mut self.tasks[index];
        if !matches!(task.slot, Slot::Running(_)) {
            return;
        }
        if task.handle.is_cancelled() {
            task.slot = Slot::Resolved(Err(TaskError::Cancelled { index }));
            return;
        }
        if let Slot::Running(join) = &mut task.slot {
            if let Ok(joined) = timeout_at(until, join).await {
                task.slot = Slot::Resolved(flatten(index, joined));
            }
        }
    }

    /// Resolve a task only if its outcome is already available; never yields
    fn resolve_ready(&mut self, index: usize) {
        let task = &mut self.tasks[index];
        let Slot::Running(join) = &mut task.slot else {
            return;
        };
        if task.handle.is_cancelled() {
            task.slot = Slot::Resolved(Err(TaskError::Cancelled { index }));
        } else if join.is_finished() {
            if let Some(joined) = join.now_or_never() {
                task.slot = Slot::Resolved(flatten(index, joined));
            }
        }
    }

    /// Poll until every task is done or the end time is reached
    async fn wait_all(&mut self) -> bool {
        let end = self.end_time();
        loop {
            let done = self.tasks.iter().all(|t| match &t.slot {
                Slot::Running(join) => join.is_finished() || t.handle.is_cancelled(),
                Slot::Resolved(_) | Slot::Collected => true,
            });
            if done {
                return true;
            }
            let now = Instant::now();
            if now >= end {
                return false;
            }
            sleep(self.config.poll_interval.min(end - now)).await;
        }
    }

    /// Request shutdown without waiting for running tasks
    fn request_shutdown(&mut self) {
        self.shutdown.cancel();
        if self.config.cancel_pending {
            let cancelled = self
                .tasks
                .iter()
                .filter(|t| t.handle.try_cancel())
                .count();
            self.pending.cancel();
            if cancelled > 0 {
                warn!("Cancelled {} task(s) that had not started", cancelled);
            }
        }
    }

    /// Record every outcome that is already available, in spawn order
    fn collect_outcomes(&mut self) -> Option<TaskError> {
        let mut first_error = None;
        for index in 0..self.tasks.len() {
            self.resolve_ready(index);
            let task = &mut self.tasks[index];
            match &task.slot {
                Slot::Running(_) => {
                    debug!("Task {} still running after shutdown request", index);
                }
                Slot::Resolved(Err(e)) if e.is_incomplete() => debug!("{}", e),
                Slot::Resolved(Err(e)) => {
                    error!("{}", e);
                    first_error.get_or_insert_with(|| e.clone());
                }
                Slot::Resolved(Ok(_)) | Slot::Collected => {}
            }
            if let Some(value) = take_unrecorded(task) {
                self.results.push(value);
            }
        }
        first_error
    }

    /// Scope exit.
    ///
    /// Waits up to the deadline, requests shutdown if tasks remain, then
    /// resolves every handle whose outcome is already available, in spawn
    /// order. Successful values are appended to
    /// [`results`](Self::results); the first task error is returned after all
    /// handles were resolved and every error was logged. Tasks left
    /// incomplete by the deadline are not reported as errors; inspect
    /// [`timed_out`](Self::timed_out) and [`unresolved`](Self::unresolved).
    pub async fn close(&mut self) -> Result<(), TaskError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.wait_all().await {
            self.timed_out = true;
            warn!(
                "Task group deadline of {:?} elapsed with tasks pending, requesting shutdown",
                self.config.deadline()
            );
            self.request_shutdown();
        }

        // The shutdown request must not let reacting tasks finish inside close.
        let first_error = unconstrained(async { self.collect_outcomes() }).await;

        let unresolved = self.unresolved();
        if unresolved > 0 {
            warn!("{} task(s) left running past the group deadline", unresolved);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Scope exit for a caller block that produced `body`.
    ///
    /// An error from the caller's own block takes precedence: the group is
    /// still closed, but task errors are only logged.
    pub async fn exit<R>(&mut self, body: anyhow::Result<R>) -> anyhow::Result<R> {
        match body {
            Ok(value) => {
                self.close().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(task_error) = self.close().await {
                    error!(
                        "Task error while handling caller error ({:#}): {}",
                        e, task_error
                    );
                }
                Err(e)
            }
        }
    }
}

impl<T: Clone + Send + 'static> TaskGroup<T> {
    /// Next task outcome in spawn order.
    ///
    /// Blocks on each task up to the group's end time. A failed task is
    /// logged and its error yielded in place of a value; successful values are
    /// recorded into [`results`](Self::results) as they are yielded. After a
    /// full pass the cursor rewinds, and the following pass skips outcomes
    /// that were already yielded.
    pub async fn next(&mut self) -> Option<TaskOutcome<T>> {
        while self.cursor < self.tasks.len() {
            let index = self.cursor;
            self.cursor += 1;
            if self.tasks[index].yielded {
                continue;
            }

            let end = self.end_time();
            self.resolve(index, end).await;

            let task = &mut self.tasks[index];
            task.yielded = true;
            let outcome = match &task.slot {
                Slot::Running(_) => Err(TaskError::TimedOut { index }),
                Slot::Resolved(outcome) => outcome.clone(),
                Slot::Collected => continue,
            };
            match &outcome {
                Ok(value) => {
                    if !task.recorded {
                        task.recorded = true;
                        self.results.push(value.clone());
                    }
                }
                Err(e) => error!("{}", e),
            }
            return Some(outcome);
        }

        self.cursor = 0;
        None
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let running = self
            .tasks
            .iter()
            .filter(|t| matches!(t.slot, Slot::Running(_)))
            .count();
        if running == 0 {
            return;
        }
        warn!(
            "Task group dropped without close, detaching {} task(s)",
            running
        );
        self.shutdown.cancel();
        if self.config.cancel_pending {
            for task in &self.tasks {
                task.handle.try_cancel();
            }
            self.pending.cancel();
        }
    }
}

fn take_unrecorded<T>(task: &mut Spawned<T>) -> Option<T> {
    if task.recorded || !matches!(task.slot, Slot::Resolved(Ok(_))) {
        return None;
    }
    task.recorded = true;
    task.yielded = true;
    match std::mem::replace(&mut task.slot, Slot::Collected) {
        Slot::Resolved(Ok(value)) => Some(value),
        _ => None,
    }
}

fn flatten<T>(index: usize, joined: Result<TaskOutcome<T>, JoinError>) -> TaskOutcome<T> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(TaskError::Panicked {
            index,
            message: panic_message(e.into_panic().as_ref()),
        }),
        Err(_) => Err(TaskError::Cancelled { index }),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
