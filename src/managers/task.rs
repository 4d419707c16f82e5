//! The task scheduler: a fixed-size tokio worker pool whose work can be drained on shutdown.
use std::fmt;
use std::future::Future;
use std::io;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct TaskManager {
    runtime: Runtime,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    workers: usize,
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// A cheap handle for scheduling work on the [`TaskManager`].
#[derive(Clone, Debug)]
pub struct Spawner {
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub(super) fn create(workers: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("namecrab-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            workers,
        })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn spawner(&self) -> Spawner {
        Spawner {
            handle: self.runtime.handle().clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Schedule `task`. [`TaskManager::destroy`] waits for it to finish.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(task, self.runtime.handle())
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Cancel the shutdown token every long-running task watches, then block until all
    /// scheduled work has completed before stopping the worker threads. Returns the number of
    /// tasks still tracked afterwards, which is zero unless draining went wrong.
    pub(super) fn destroy(self) -> usize {
        self.shutdown.cancel();
        self.tracker.close();
        tracing::debug!(pending = self.tracker.len(), "draining task scheduler");
        self.runtime.block_on(self.tracker.wait());
        drop(self.runtime);
        self.tracker.len()
    }
}

impl Spawner {
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(task, &self.handle)
    }

    /// A token cancelled when the task scheduler starts shutting down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}
