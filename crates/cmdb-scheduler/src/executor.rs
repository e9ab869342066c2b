//! Executors receive the work the scheduler dispatches.

use async_trait::async_trait;
use cmdb_core::{DiscoveredMachines, MachineDigest};
use tokio::sync::mpsc;

/// A worker that refreshes machine information on request.
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    /// A new digest was created and should be filled in.
    async fn notify_digest(&self, digest: MachineDigest);

    /// The discovered-machines record changed.
    async fn notify_discovered_machines(&self, latest: DiscoveredMachines);
}

/// Work item queued to a [`ChannelExecutor`] worker.
#[derive(Debug, Clone)]
pub enum ExecutorJob {
    RefreshDigest(MachineDigest),
    RefreshDiscovered(DiscoveredMachines),
}

impl ExecutorJob {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutorJob::RefreshDigest(_) => "refresh-digest",
            ExecutorJob::RefreshDiscovered(_) => "refresh-discovered",
        }
    }
}

/// Executor that forwards every notification into a bounded queue drained
/// by a worker task.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    id: String,
    tx: mpsc::Sender<ExecutorJob>,
}

impl ChannelExecutor {
    pub fn channel(id: &str, capacity: usize) -> (Self, mpsc::Receiver<ExecutorJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: id.to_string(),
                tx,
            },
            rx,
        )
    }

    async fn forward(&self, job: ExecutorJob) {
        let label = job.label();
        if self.tx.send(job).await.is_err() {
            tracing::warn!(executor = %self.id, job = label, "⚠️ Executor queue closed, job dropped");
        }
    }
}

#[async_trait]
impl Executor for ChannelExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify_digest(&self, digest: MachineDigest) {
        self.forward(ExecutorJob::RefreshDigest(digest)).await;
    }

    async fn notify_discovered_machines(&self, latest: DiscoveredMachines) {
        self.forward(ExecutorJob::RefreshDiscovered(latest)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdb_core::Object;

    #[tokio::test]
    async fn test_forwards_jobs() {
        let (exec, mut rx) = ChannelExecutor::channel("exec-0", 4);
        let mut digest = MachineDigest::new();
        digest.meta.guid = "d1".into();
        exec.notify_digest(digest).await;
        exec.notify_discovered_machines(DiscoveredMachines::new()).await;

        match rx.recv().await.unwrap() {
            ExecutorJob::RefreshDigest(d) => assert_eq!(d.guid(), "d1"),
            other => panic!("unexpected job {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().label(), "refresh-discovered");
    }

    #[tokio::test]
    async fn test_closed_queue_drops_job() {
        let (exec, rx) = ChannelExecutor::channel("exec-0", 1);
        drop(rx);
        exec.notify_digest(MachineDigest::new()).await;
        assert_eq!(exec.id(), "exec-0");
    }
}
