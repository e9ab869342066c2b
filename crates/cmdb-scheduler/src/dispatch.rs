//! Bounded dispatch queue for fire-and-forget work.
//!
//! The scheduler loop never waits on a dispatched action: `spawn` takes a
//! permit without blocking and drops the work when the queue is full. On
//! shutdown the queue is drained for a grace period and whatever is still
//! running gets aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Outcome of [`DispatchQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub aborted: usize,
}

pub struct DispatchQueue {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    dropped: u64,
}

impl DispatchQueue {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            dropped: 0,
        }
    }

    /// Launch `work` in the background. Returns `false` if the queue is full
    /// and the work was dropped.
    pub fn spawn<F>(&mut self, label: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.dropped += 1;
            tracing::warn!(
                task = label,
                max_in_flight = self.max_in_flight,
                "⚠️ Dispatch queue full, action dropped"
            );
            return false;
        };
        self.tasks.spawn(async move {
            let _permit = permit;
            work.await;
        });
        tracing::debug!(task = label, in_flight = self.tasks.len(), "📤 Action dispatched");
        true
    }

    /// Tasks spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Actions rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join_error(result);
        }
    }

    /// Wait up to `grace` for in-flight work, then abort the rest.
    pub async fn drain(&mut self, grace: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let tasks = &mut self.tasks;
        let completed = &mut report.completed;
        let finished = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
                *completed += 1;
            }
        })
        .await
        .is_ok();

        if !finished {
            self.tasks.abort_all();
            while let Some(result) = self.tasks.join_next().await {
                match result {
                    Err(e) if e.is_cancelled() => report.aborted += 1,
                    other => {
                        log_join_error(other);
                        report.completed += 1;
                    }
                }
            }
            tracing::warn!(
                aborted = report.aborted,
                "⚠️ Dispatched actions still running at shutdown were aborted"
            );
        }
        report
    }
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Dispatched action panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_and_drains() {
        let mut queue = DispatchQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            assert!(queue.spawn("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let report = queue.drain(Duration::from_secs(1)).await;
        assert_eq!(report, DrainReport { completed: 3, aborted: 0 });
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let mut queue = DispatchQueue::new(2);
        for _ in 0..2 {
            assert!(queue.spawn("stuck", std::future::pending()));
        }
        assert!(!queue.spawn("stuck", std::future::pending()));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.in_flight(), 2);

        let report = queue.drain(Duration::from_millis(20)).await;
        assert_eq!(report, DrainReport { completed: 0, aborted: 2 });
    }

    #[tokio::test]
    async fn test_finished_tasks_free_permits() {
        let mut queue = DispatchQueue::new(1);
        assert!(queue.spawn("quick", async {}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.spawn("quick", async {}));
        queue.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_task_counts_as_completed() {
        let mut queue = DispatchQueue::new(1);
        queue.spawn("boom", async { panic!("boom") });
        let report = queue.drain(Duration::from_secs(1)).await;
        assert_eq!(report.completed, 1);
    }
}
