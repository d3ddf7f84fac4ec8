use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once the last tracked task has finished.
    stopped: CancellationToken,
}

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

/// Tracks the background tasks of a channel, dispatcher or listener so they
/// can be stopped together and joined.
///
/// ```rust,no_run
/// # use callmux::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn(|guard| async move {
///     guard.stopped().await;
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Held by a running task; the task counts as finished once it is dropped.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisor {
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // keeps `all_stopped` pending until `stop` even with no task running.
        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Returns a guard that calls `stop()` when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns a tracked task. The task gets its guard to watch for `stop`.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(TaskSupervisorGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = f(self.start_async_task());
        tokio::spawn(future);
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}
