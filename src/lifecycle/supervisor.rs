//! First-exit-wins task supervisor.
//!
//! # Responsibilities
//! - Run every registered task concurrently
//! - Treat the first task to return (with or without error), or an external
//!   shutdown request, as the signal to stop everything
//! - Interrupt every task exactly once, whatever state it is in
//! - Wait for all tasks and report the error of the first completion
//!
//! # Design Decisions
//! - Cancellation is cooperative: interrupt asks, it never aborts a task
//! - A task interrupted before it was first polled is never started
//! - Panics are caught and reported like any other task error
//! - No retries here; retry policy belongs to each component

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::shutdown::Shutdown;

/// Error type returned by supervised tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a supervised task's run operation.
pub type TaskResult = Result<(), BoxError>;

type RunFn = Box<dyn FnOnce() -> BoxFuture<'static, TaskResult> + Send>;
type InterruptFn = Box<dyn FnOnce() + Send>;

/// Default time to wait for tasks after interrupting them before logging
/// the stragglers.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The error of the task whose completion triggered shutdown.
#[derive(Debug, thiserror::Error)]
#[error("task `{task}` failed: {source}")]
pub struct SupervisorFailure {
    /// Name of the task that completed first.
    pub task: String,
    /// The error it returned.
    #[source]
    pub source: BoxError,
}

/// Per-task progress as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Registered,
    Running,
    Returned,
}

#[derive(Debug)]
struct Gate {
    state: TaskState,
    interrupted: bool,
}

/// Serializes "start running" against "interrupt" for one task.
#[derive(Debug)]
struct TaskGate {
    inner: Mutex<Gate>,
}

impl TaskGate {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Gate {
                state: TaskState::Registered,
                interrupted: false,
            }),
        }
    }

    /// Returns false when the task was interrupted before it could start.
    fn try_start(&self) -> bool {
        let mut gate = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.interrupted {
            return false;
        }
        gate.state = TaskState::Running;
        true
    }

    fn finish(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = TaskState::Returned;
    }

    /// Marks the task interrupted; returns its state at that moment.
    fn mark_interrupted(&self) -> TaskState {
        let mut gate = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        gate.interrupted = true;
        gate.state
    }

    fn state(&self) -> TaskState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }
}

struct Task {
    name: String,
    run: RunFn,
    interrupt: InterruptFn,
}

struct TaskHandle {
    name: String,
    gate: Arc<TaskGate>,
    interrupt: Option<InterruptFn>,
}

impl TaskHandle {
    /// Invoke the interrupt operation; later calls do nothing.
    fn interrupt(&mut self) {
        let Some(interrupt) = self.interrupt.take() else {
            return;
        };
        let state = self.gate.mark_interrupted();
        tracing::debug!(task = %self.name, state = ?state, "Interrupting task");
        if std::panic::catch_unwind(AssertUnwindSafe(interrupt)).is_err() {
            tracing::error!(task = %self.name, "Task interrupt panicked");
        }
    }
}

/// What ended the run phase.
struct Completion {
    task: Option<usize>,
    error: Option<BoxError>,
}

/// Runs a set of tasks with first-exit-wins semantics.
pub struct Supervisor {
    tasks: Vec<Task>,
    shutdown: Shutdown,
    grace_period: Duration,
}

impl Supervisor {
    /// Create an empty supervisor with its own shutdown source.
    pub fn new() -> Self {
        Self::with_shutdown(Shutdown::new())
    }

    /// Create an empty supervisor driven by an existing shutdown source.
    pub fn with_shutdown(shutdown: Shutdown) -> Self {
        Self {
            tasks: Vec::new(),
            shutdown,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Set how long to wait for interrupted tasks before logging stragglers.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Handle that requests shutdown from outside the task set.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names of the registered tasks, in registration order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Register a task from a run operation and an interrupt operation.
    ///
    /// `run` is called at most once, and never after `interrupt` has fired.
    /// `interrupt` must not block; it is called exactly once when shutdown
    /// begins.
    pub fn add<R, Fut, E, I>(&mut self, name: impl Into<String>, run: R, interrupt: I)
    where
        R: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
        I: FnOnce() + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "Task registered");
        self.tasks.push(Task {
            name,
            run: Box::new(move || Box::pin(async move { run().await.map_err(Into::into) })),
            interrupt: Box::new(interrupt),
        });
    }

    /// Register a task whose interrupt cancels the token it is given.
    pub fn spawn<F, Fut, E>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let token = self.shutdown.subscribe();
        let interrupt = token.clone();
        self.add(name, move || f(token), move || interrupt.cancel());
    }

    /// Run every task until the first one returns, then interrupt the rest
    /// and wait for all of them.
    pub async fn run(self) -> Result<(), SupervisorFailure> {
        let Supervisor {
            tasks,
            shutdown,
            grace_period,
        } = self;

        if tasks.is_empty() {
            return Ok(());
        }

        let launch = !shutdown.is_triggered();
        let mut handles = Vec::with_capacity(tasks.len());
        let mut set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let gate = Arc::new(TaskGate::new());
            handles.push(TaskHandle {
                name: task.name,
                gate: gate.clone(),
                interrupt: Some(task.interrupt),
            });

            if launch {
                let run = task.run;
                set.spawn(async move {
                    if !gate.try_start() {
                        return (index, None);
                    }
                    let result = AssertUnwindSafe(async move { run().await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panic_error(panic)));
                    gate.finish();
                    (index, Some(result))
                });
            }
        }

        tracing::info!(
            tasks = handles.len(),
            names = ?handles.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            "Supervisor started"
        );

        let completion = if launch {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((index, Some(result)))) => Completion { task: Some(index), error: result.err() },
                    Some(Ok((_, None))) | None => Completion { task: None, error: None },
                    Some(Err(e)) => Completion { task: None, error: Some(Box::new(e)) },
                },
                _ = shutdown.triggered() => Completion { task: None, error: None },
            }
        } else {
            Completion {
                task: None,
                error: None,
            }
        };

        match (&completion.task, &completion.error) {
            (Some(i), Some(e)) => {
                tracing::error!(task = %handles[*i].name, error = %e, "Task failed, shutting down")
            }
            (Some(i), None) => {
                tracing::info!(task = %handles[*i].name, "Task returned, shutting down")
            }
            (None, Some(e)) => tracing::error!(error = %e, "Task aborted, shutting down"),
            (None, None) => tracing::info!("Shutdown requested"),
        }

        shutdown.trigger();
        for handle in handles.iter_mut() {
            handle.interrupt();
        }

        let names: Vec<String> = handles.iter().map(|h| h.name.clone()).collect();
        let drain = drain(&mut set, &names);
        tokio::pin!(drain);
        if tokio::time::timeout(grace_period, &mut drain).await.is_err() {
            let pending: Vec<&str> = handles
                .iter()
                .filter(|h| h.gate.state() == TaskState::Running)
                .map(|h| h.name.as_str())
                .collect();
            tracing::warn!(
                grace_period = ?grace_period,
                pending = ?pending,
                "Tasks still running after interrupt, waiting"
            );
            drain.await;
        }

        tracing::info!("Supervisor stopped");

        match completion {
            Completion {
                task,
                error: Some(source),
            } => Err(SupervisorFailure {
                task: task
                    .map(|i| handles[i].name.clone())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                source,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(set: &mut JoinSet<(usize, Option<TaskResult>)>, names: &[String]) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Some(Ok(())))) => {
                tracing::debug!(task = %names[index], "Task returned")
            }
            Ok((index, Some(Err(e)))) => {
                tracing::debug!(task = %names[index], error = %e, "Task returned with error")
            }
            Ok((index, None)) => {
                tracing::debug!(task = %names[index], "Task interrupted before start")
            }
            Err(e) => tracing::warn!(error = %e, "Task join failed"),
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("task panicked: {message}").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(&'static str);

    /// A task that blocks until interrupted and counts interrupts.
    fn blocking_task(sup: &mut Supervisor, name: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let t = token.clone();
        let c = count.clone();
        sup.add(
            name,
            move || async move {
                t.cancelled().await;
                Ok::<(), TestError>(())
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                token.cancel();
            },
        );
        count
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_can_be_spawned() {
        let mut sup = Supervisor::new();
        let blocked = blocking_task(&mut sup, "server");
        let shutdown = sup.shutdown();

        let run = sup.run();
        assert_send(&run);
        let handle = tokio::spawn(run);
        shutdown.trigger();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_others_interrupted() {
        let mut sup = Supervisor::new();
        let a = blocking_task(&mut sup, "a");
        sup.add(
            "b",
            || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err::<(), _>(TestError("b broke"))
            },
            || {},
        );
        let c = blocking_task(&mut sup, "c");

        let err = sup.run().await.unwrap_err();
        assert_eq!(err.task, "b");
        assert_eq!(err.source.to_string(), "b broke");
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_order_not_registration_order() {
        let mut sup = Supervisor::new();
        sup.add(
            "slow",
            || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err::<(), _>(TestError("slow"))
            },
            || {},
        );
        sup.add(
            "fast",
            || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(TestError("fast"))
            },
            || {},
        );

        let err = sup.run().await.unwrap_err();
        assert_eq!(err.task, "fast");
    }

    #[tokio::test]
    async fn test_clean_first_completion_returns_ok() {
        let mut sup = Supervisor::new();
        let blocked = blocking_task(&mut sup, "server");
        sup.add("one-shot", || async { Ok::<(), TestError>(()) }, || {});

        assert!(sup.run().await.is_ok());
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_every_task_interrupted_exactly_once() {
        let mut sup = Supervisor::new();
        let counts: Vec<_> = (0..4)
            .map(|i| blocking_task(&mut sup, &format!("t{i}")))
            .collect();
        let shutdown = sup.shutdown();

        let handle = tokio::spawn(sup.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        shutdown.trigger();

        assert!(handle.await.unwrap().is_ok());
        for count in counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_task_not_started_when_shutdown_precedes_run() {
        let mut sup = Supervisor::new();
        let ran = Arc::new(AtomicBool::new(false));
        let interrupted = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let i = interrupted.clone();
        sup.add(
            "never",
            move || async move {
                r.store(true, Ordering::SeqCst);
                Ok::<(), TestError>(())
            },
            move || i.store(true, Ordering::SeqCst),
        );

        sup.shutdown().trigger();
        assert!(sup.run().await.is_ok());
        assert!(interrupted.load(Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let mut sup = Supervisor::new();
        let other = blocking_task(&mut sup, "other");
        sup.add(
            "crashy",
            || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if true {
                    panic!("boom");
                }
                Ok::<(), TestError>(())
            },
            || {},
        );

        let err = sup.run().await.unwrap_err();
        assert_eq!(err.task, "crashy");
        assert!(err.source.to_string().contains("boom"));
        assert_eq!(other.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_wires_token_to_interrupt() {
        let mut sup = Supervisor::new();
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let s = saw_cancel.clone();
        sup.spawn("worker", move |token| async move {
            token.cancelled().await;
            s.store(true, Ordering::SeqCst);
            Ok::<(), TestError>(())
        });
        sup.add("trigger", || async { Err::<(), _>(TestError("stop")) }, || {});

        let err = sup.run().await.unwrap_err();
        assert_eq!(err.task, "trigger");
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_waits_for_slow_task_past_grace_period() {
        let mut sup = Supervisor::new().with_grace_period(Duration::from_millis(10));
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        sup.spawn("slow-exit", move |token| async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            f.store(true, Ordering::SeqCst);
            Ok::<(), TestError>(())
        });
        sup.add("stopper", || async { Ok::<(), TestError>(()) }, || {});

        assert!(sup.run().await.is_ok());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_supervisor_returns_immediately() {
        assert!(Supervisor::new().run().await.is_ok());
    }
}
