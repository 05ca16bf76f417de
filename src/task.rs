//! Task lifecycle: stop channels and the supervising task group.
//!
//! Every concurrent stage of a pipeline is a [`Task`]: it starts its
//! background work and hands back a [`StopChan`] that fires when the work
//! terminates. The [`TaskGroup`] starts all tasks, waits for the first
//! termination (or an interrupt), broadcasts `stop()` and gives every task
//! a bounded window to unwind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{MultiError, PipelineError};

/// A one-shot broadcast signalling that a task has terminated, with an
/// optional error attached.
///
/// Cheap to clone; all clones share the same state. The first call to
/// [`stop_err`](StopChan::stop_err) wins, later errors are logged and
/// dropped.
#[derive(Clone)]
pub struct StopChan {
    inner: Arc<StopInner>,
}

struct StopInner {
    tx: watch::Sender<bool>,
    error: parking_lot::Mutex<Option<PipelineError>>,
}

impl StopChan {
    /// Creates a fresh, unstopped channel.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(StopInner {
                tx,
                error: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Signals clean termination. Idempotent.
    pub fn stop(&self) {
        self.inner.tx.send_replace(true);
    }

    /// Signals termination with an error.
    pub fn stop_err(&self, err: PipelineError) {
        {
            let mut slot = self.inner.error.lock();
            if let Some(existing) = slot.as_ref() {
                tracing::debug!(error = %err, first = %existing, "dropping secondary task error");
            } else {
                *slot = Some(err);
            }
        }
        self.inner.tx.send_replace(true);
    }

    /// Returns `true` once the channel was stopped.
    pub fn is_stopped(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Waits until the channel is stopped.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Takes the attached error, if any. Subsequent calls return `None`.
    pub fn take_error(&self) -> Option<PipelineError> {
        self.inner.error.lock().take()
    }
}

impl Default for StopChan {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of concurrent work supervised by a [`TaskGroup`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> String;

    /// Launches the task's background work.
    ///
    /// Returns a channel that fires when the task terminates on its own.
    /// Errors here are fatal for the whole group.
    async fn start(&self) -> Result<StopChan, PipelineError>;

    /// Requests the task to unwind.
    ///
    /// Called once after the group decided to shut down. Must not block.
    /// Pipeline stages that flush through `close()` cascades ignore this.
    fn stop(&self);
}

/// Starts a set of tasks and supervises them until the first one
/// terminates, then shuts the rest down.
///
/// # Lifecycle
///
/// 1. [`add`](TaskGroup::add) the tasks
/// 2. [`run`](TaskGroup::run) starts every task and collects stop channels
/// 3. The first task termination (or Ctrl-C with
///    [`run_with_signal`](TaskGroup::run_with_signal)) triggers `stop()` on
///    all tasks
/// 4. Each task gets `shutdown_timeout` to unwind; stragglers are logged
///    but do not block exit
///
/// The returned [`MultiError`] aggregates every task failure; its length is
/// the intended process exit code.
pub struct TaskGroup {
    tasks: parking_lot::Mutex<Vec<Arc<dyn Task>>>,
    shutdown_timeout: Duration,
}

impl TaskGroup {
    /// Creates a group with the given shutdown timeout.
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            tasks: parking_lot::Mutex::new(Vec::new()),
            shutdown_timeout,
        }
    }

    /// Registers a task. Has no effect on an already-running group.
    pub fn add(&self, task: Arc<dyn Task>) {
        self.tasks.lock().push(task);
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns `true` if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Starts every registered task, collecting stop channels.
    ///
    /// When one task fails to start, the already-started ones are stopped
    /// and unwound before the error is returned.
    pub async fn start_tasks(&self) -> Result<RunningGroup, PipelineError> {
        let tasks: Vec<Arc<dyn Task>> = self.tasks.lock().clone();
        let mut running: Vec<(Arc<dyn Task>, StopChan)> = Vec::new();
        for task in tasks {
            match task.start().await {
                Ok(chan) => running.push((task, chan)),
                Err(err) => {
                    tracing::error!(task = %task.name(), error = %err, "task failed to start");
                    let started = RunningGroup {
                        tasks: running,
                        shutdown_timeout: self.shutdown_timeout,
                    };
                    let mut unwind = MultiError::new();
                    started.shutdown(&mut unwind).await;
                    for secondary in unwind.iter() {
                        tracing::error!(error = %secondary, "task failed during unwind");
                    }
                    return Err(err);
                }
            }
        }
        Ok(RunningGroup {
            tasks: running,
            shutdown_timeout: self.shutdown_timeout,
        })
    }

    /// Runs the group to completion. See the type docs for the lifecycle.
    pub async fn run(&self) -> MultiError {
        self.run_internal(false).await
    }

    /// Like [`run`](TaskGroup::run), but also shuts down on Ctrl-C.
    pub async fn run_with_signal(&self) -> MultiError {
        self.run_internal(true).await
    }

    async fn run_internal(&self, handle_signal: bool) -> MultiError {
        match self.start_tasks().await {
            Ok(running) => running.run_to_completion(handle_signal).await,
            Err(err) => {
                let mut errors = MultiError::new();
                errors.push(err);
                errors
            }
        }
    }
}

/// A group whose tasks have all started; waits for the first termination
/// and then shuts the rest down.
pub struct RunningGroup {
    tasks: Vec<(Arc<dyn Task>, StopChan)>,
    shutdown_timeout: Duration,
}

impl RunningGroup {
    /// Waits for the first task termination (or Ctrl-C when
    /// `handle_signal` is set), then stops and unwinds every task.
    pub async fn run_to_completion(self, handle_signal: bool) -> MultiError {
        if !self.tasks.is_empty() {
            let waits = self.tasks.iter().map(|(_, chan)| {
                let chan = chan.clone();
                Box::pin(async move { chan.wait().await })
            });
            let first_stop = futures::future::select_all(waits);
            if handle_signal {
                tokio::select! {
                    _ = first_stop => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt received, shutting down");
                    }
                }
            } else {
                first_stop.await;
            }
        }
        let mut errors = MultiError::new();
        self.shutdown(&mut errors).await;
        errors
    }

    /// Broadcasts `stop()` and gives every task the shutdown timeout to
    /// unwind, collecting task errors.
    async fn shutdown(&self, errors: &mut MultiError) {
        for (task, _) in &self.tasks {
            task.stop();
        }
        for (task, chan) in &self.tasks {
            if tokio::time::timeout(self.shutdown_timeout, chan.wait())
                .await
                .is_err()
            {
                // Reported but never fatal: a wedged task must not prevent
                // process exit.
                tracing::warn!(task = %task.name(), "task did not stop within timeout");
            }
            if let Some(err) = chan.take_error() {
                tracing::error!(task = %task.name(), error = %err, "task failed");
                errors.push(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: String,
        chan: StopChan,
        stops: AtomicUsize,
        fail_start: bool,
    }

    impl TestTask {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                chan: StopChan::new(),
                stops: AtomicUsize::new(0),
                fail_start: false,
            })
        }

        fn failing_start(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                chan: StopChan::new(),
                stops: AtomicUsize::new(0),
                fail_start: true,
            })
        }
    }

    #[async_trait]
    impl Task for TestTask {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn start(&self) -> Result<StopChan, PipelineError> {
            if self.fail_start {
                return Err(PipelineError::Config("won't start".into()));
            }
            Ok(self.chan.clone())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.chan.stop();
        }
    }

    #[tokio::test]
    async fn test_stop_chan_wait_returns_after_stop() {
        let chan = StopChan::new();
        let waiter = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.wait().await })
        };
        chan.stop();
        waiter.await.unwrap();
        assert!(chan.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_chan_keeps_first_error() {
        let chan = StopChan::new();
        chan.stop_err(PipelineError::Config("first".into()));
        chan.stop_err(PipelineError::Config("second".into()));
        assert_eq!(chan.take_error().unwrap().to_string(), "first");
        assert!(chan.take_error().is_none());
    }

    #[tokio::test]
    async fn test_group_stops_all_after_first_termination() {
        let group = TaskGroup::new(Duration::from_secs(1));
        let a = TestTask::new("a");
        let b = TestTask::new("b");
        group.add(a.clone());
        group.add(b.clone());

        // Terminate task a shortly after startup.
        let trigger = a.chan.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.stop();
        });

        let errors = group.run().await;
        assert!(errors.is_empty());
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_collects_task_errors() {
        let group = TaskGroup::new(Duration::from_secs(1));
        let a = TestTask::new("a");
        group.add(a.clone());

        let trigger = a.chan.clone();
        tokio::spawn(async move {
            trigger.stop_err(PipelineError::Config("boom".into()));
        });

        let errors = group.run().await;
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_group_start_failure_unwinds_started_tasks() {
        let group = TaskGroup::new(Duration::from_secs(1));
        let ok = TestTask::new("ok");
        group.add(ok.clone());
        group.add(TestTask::failing_start("bad"));

        let errors = group.run().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(ok.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_group_finishes_immediately() {
        let group = TaskGroup::new(Duration::from_secs(1));
        assert!(group.run().await.is_empty());
    }
}
