//! The timer service. Timers run as tasks on the task scheduler and stop when either the timer
//! service or the task scheduler shuts down.
use super::task::{Spawner, TaskManager};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Debug)]
pub struct TimerManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    spawner: Spawner,
    cancel: CancellationToken,
    tracker: TaskTracker,
    fired: AtomicU64,
}

impl TimerManager {
    pub(super) fn create(tasks: &TaskManager) -> Self {
        let spawner = tasks.spawner();
        let cancel = spawner.shutdown_token();
        Self {
            inner: Arc::new(Inner {
                spawner,
                cancel,
                tracker: TaskTracker::new(),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Run `f` every `period`, starting one period from now.
    pub fn every<F>(&self, period: Duration, mut f: F)
    where
        F: FnMut() + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        let timer = async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        inner.fired.fetch_add(1, Ordering::Relaxed);
                        f();
                    }
                }
            }
        };
        self.inner
            .spawner
            .spawn(self.inner.tracker.track_future(timer));
    }

    #[must_use]
    pub fn fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.tracker.len()
    }

    pub(super) fn destroy(self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        let pending = self.pending();
        if pending > 0 {
            tracing::warn!(pending, "timer service destroyed with live timers");
        }
        tracing::debug!(fired = self.fired(), "timer service destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn periodic_timer_fires_until_shutdown() {
        let tasks = TaskManager::create(1).unwrap();
        let timers = TimerManager::create(&tasks);
        let (tx, rx) = mpsc::channel();
        timers.every(Duration::from_millis(10), move || {
            let _ = tx.send("tick");
        });

        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "tick");
        }
        assert!(timers.fired() >= 3);

        tasks.destroy();
        assert_eq!(timers.pending(), 0);
        timers.destroy();
    }
}
