//! In-flight load tracking for upstream workers.
//!
//! [`LoadTracker`] owns the load counter of every registered worker. Streams take a
//! [`LoadGuard`] via [`LoadTracker::acquire`] before their first upstream fetch; the guard
//! releases the load when dropped, which covers normal completion, upstream errors and consumers
//! that stop polling midway.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::id::WorkerId;

/// Tracks the number of active streams per worker.
///
/// The tracker is cheap to clone; all clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct LoadTracker {
    loads: Arc<Mutex<BTreeMap<WorkerId, usize>>>,
}

impl LoadTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker with zero load.
    ///
    /// Registering a worker twice keeps its current load.
    pub fn register(&self, worker: WorkerId) {
        self.lock().entry(worker).or_default();
    }

    /// Returns the registered worker with the smallest load.
    ///
    /// Ties go to the worker with the smallest id. Returns `None` if no worker is registered.
    pub fn select(&self) -> Option<WorkerId> {
        let loads = self.lock();

        let mut selected: Option<(WorkerId, usize)> = None;
        for (&worker, &load) in loads.iter() {
            if selected.is_none_or(|(_, min)| load < min) {
                selected = Some((worker, load));
            }
        }

        selected.map(|(worker, _)| worker)
    }

    /// Increments the load of `worker` until the returned guard is dropped.
    pub fn acquire(&self, worker: WorkerId) -> LoadGuard {
        *self.lock().entry(worker).or_default() += 1;

        LoadGuard {
            tracker: self.clone(),
            worker,
        }
    }

    fn release(&self, worker: WorkerId) {
        let mut loads = self.lock();
        match loads.get_mut(&worker) {
            Some(load) if *load > 0 => *load -= 1,
            _ => tracing::error!(%worker, "released load of idle worker"),
        }
    }

    /// Returns the current load of `worker`, if registered.
    pub fn load(&self, worker: WorkerId) -> Option<usize> {
        self.lock().get(&worker).copied()
    }

    /// Returns a snapshot of all worker loads.
    pub fn loads(&self) -> BTreeMap<WorkerId, usize> {
        self.lock().clone()
    }

    /// Periodically calls `emit` with a snapshot of all worker loads.
    ///
    /// This future runs forever and is intended to be spawned as a background task alongside the
    /// worker pool.
    pub async fn run_emitter<F, Fut>(&self, interval: Duration, mut emit: F)
    where
        F: FnMut(BTreeMap<WorkerId, usize>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            emit(self.loads()).await;
        }
    }

    // Counters stay consistent even if a holder panicked, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<WorkerId, usize>> {
        self.loads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// RAII guard for one unit of worker load.
///
/// Dropping the guard releases the load back to the [`LoadTracker`].
#[derive(Debug)]
pub struct LoadGuard {
    tracker: LoadTracker,
    worker: WorkerId,
}

impl LoadGuard {
    /// The worker carrying this load.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.tracker.release(self.worker);
    }
}
