//! Single owner of periodic background work.
//!
//! Every recurring task in the process (health probes, cache sweeps,
//! weight updates) is registered here so shutdown cancellation is
//! deterministic: [`Scheduler::shutdown`] aborts everything it spawned.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owns the join handles of all periodic tasks.
pub struct Scheduler {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self { handles: Mutex::new(Vec::new()) }
    }

    /// Run `task` every `period`, starting one period from now.
    ///
    /// A tick that runs long delays the next tick; ticks never overlap.
    pub fn every<F, Fut>(&self, period: Duration, name: &'static str, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                task().await;
            }
        });
        debug!(name, period_ms = period.as_millis() as u64, "Periodic task registered");
        self.handles.lock().push((name, handle));
    }

    /// Run `task` once after `delay`.
    pub fn after<Fut>(&self, delay: Duration, name: &'static str, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        self.handles.lock().push((name, handle));
    }

    /// Abort every registered task.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock();
        for (name, handle) in handles.drain(..) {
            debug!(name, "Aborting periodic task");
            handle.abort();
        }
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
