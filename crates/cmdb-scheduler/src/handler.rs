//! Actions fired by the scheduler loop.
//!
//! Periodic actions write to storage; event-triggered actions decode the
//! watch payload and pass it to one executor picked at random.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmdb_core::{
    DiscoveredMachines, DiscoveryState, MachineDigest, Object, Storage, WatchEvent,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::DispatchError;
use crate::executor::Executor;

/// Bounded retry for the discovery update-or-create upsert.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear backoff: attempt `n` waits `n * backoff` before the next try.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

pub struct Handler<S: Storage> {
    executors: Vec<Arc<dyn Executor>>,
    storage: Arc<S>,
    rng: Mutex<StdRng>,
    retry: RetryPolicy,
}

impl<S: Storage> Handler<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_rng(storage, StdRng::from_entropy())
    }

    /// Deterministic executor selection, for tests.
    pub fn with_seed(storage: Arc<S>, seed: u64) -> Self {
        Self::with_rng(storage, StdRng::seed_from_u64(seed))
    }

    fn with_rng(storage: Arc<S>, rng: StdRng) -> Self {
        Self {
            executors: Vec::new(),
            storage,
            rng: Mutex::new(rng),
            retry: RetryPolicy::default(),
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Add an executor to the pool. Only possible before serving, once the
    /// handler is shared the pool is frozen.
    pub fn register_executor(&mut self, executor: Arc<dyn Executor>) {
        tracing::info!(executor = %executor.id(), "🧰 Executor registered");
        self.executors.push(executor);
    }

    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Create a fresh digest. Returns its guid.
    pub async fn create_digest_on_schedule(&self) -> Result<String, DispatchError> {
        tracing::info!("📸 Creating a new digest on schedule");
        let mut digest = MachineDigest::new();
        match self.storage.create(&mut digest).await {
            Ok(()) => Ok(digest.guid().to_string()),
            Err(e) => {
                tracing::error!(error = %e, "Could not create new machine digest");
                Err(e.into())
            }
        }
    }

    /// Mark the discovered-machines singleton as `Started`, creating it if
    /// it does not exist yet. Zones and machines already on record are kept.
    pub async fn run_discovery_on_schedule(&self) -> Result<(), DispatchError> {
        tracing::info!("🔍 Auto-discovering new machines on preset zones");
        let attempts = self.retry.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let mut latest = DiscoveredMachines::new();
            let result = match self.storage.get(&mut latest).await {
                Ok(()) => {
                    latest.state = DiscoveryState::Started;
                    self.storage.update(&mut latest).await
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Discovery record missing, creating it");
                    latest.state = DiscoveryState::Started;
                    self.storage.create(&mut latest).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_internal() => {
                    tracing::error!(error = %e, "Could not mark auto-discovery as `Started`");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Discovery upsert raced, retrying");
                    last = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff * attempt).await;
            }
        }

        tracing::error!(attempts, "Could not mark auto-discovery as `Started`, giving up");
        Err(DispatchError::DiscoveryExhausted { attempts, last })
    }

    /// Decode a digest event and notify one executor. Returns the executor id.
    pub async fn on_digest_event(&self, event: WatchEvent) -> Result<String, DispatchError> {
        let digest: MachineDigest = event.decode().inspect_err(|e| {
            tracing::error!(error = %e, "Dropping digest event");
        })?;
        let executor = self.pick_executor()?;
        tracing::info!(
            executor = %executor.id(),
            digest = %digest.guid(),
            "Notifying executor to refresh machine information"
        );
        executor.notify_digest(digest).await;
        Ok(executor.id().to_string())
    }

    /// Decode a discovered-machines event and notify one executor.
    pub async fn on_discovery_event(&self, event: WatchEvent) -> Result<String, DispatchError> {
        let latest: DiscoveredMachines = event.decode().inspect_err(|e| {
            tracing::error!(error = %e, "Dropping discovered-machines event");
        })?;
        let executor = self.pick_executor()?;
        tracing::info!(
            executor = %executor.id(),
            state = %latest.state,
            "Notifying executor to refresh discovered machines"
        );
        executor.notify_discovered_machines(latest).await;
        Ok(executor.id().to_string())
    }

    fn pick_executor(&self) -> Result<Arc<dyn Executor>, DispatchError> {
        if self.executors.is_empty() {
            tracing::warn!("⚠️ No executor registered, event dropped");
            return Err(DispatchError::NoExecutor);
        }
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..self.executors.len())
        };
        Ok(Arc::clone(&self.executors[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{Fault, FaultyStorage, RecordingExecutor};
    use cmdb_core::{DiscoveredMachine, MemoryStorage, WatchEventType};

    fn digest_event(payload: &[u8]) -> WatchEvent {
        WatchEvent::new(
            WatchEventType::Create,
            MachineDigest::KIND,
            "/machine-digest/m1",
            payload.to_vec(),
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_digest_event_reaches_executor() {
        let mut handler = Handler::with_seed(Arc::new(MemoryStorage::default()), 7);
        let exec = Arc::new(RecordingExecutor::new("exec-0"));
        handler.register_executor(exec.clone());

        let id = handler.on_digest_event(digest_event(br#"{"guid":"m1"}"#)).await.unwrap();
        assert_eq!(id, "exec-0");
        let digests = exec.digests();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].guid(), "m1");
    }

    #[tokio::test]
    async fn test_malformed_payload_never_reaches_executor() {
        let mut handler = Handler::with_seed(Arc::new(MemoryStorage::default()), 7);
        let exec = Arc::new(RecordingExecutor::new("exec-0"));
        handler.register_executor(exec.clone());

        let err = handler.on_digest_event(digest_event(b"garbage")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));

        let bad_discovery = WatchEvent::new(
            WatchEventType::Update,
            DiscoveredMachines::KIND,
            "/discovered-machines/discovered-machines",
            br#"{"state":"Exploding"}"#.to_vec(),
        );
        assert!(handler.on_discovery_event(bad_discovery).await.is_err());
        assert_eq!(exec.total(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_drops_event() {
        let handler = Handler::with_seed(Arc::new(MemoryStorage::default()), 7);
        let err = handler.on_digest_event(digest_event(br#"{"guid":"m1"}"#)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoExecutor));
    }

    #[tokio::test]
    async fn test_every_executor_gets_picked() {
        let mut handler = Handler::new(Arc::new(MemoryStorage::default()));
        let execs: Vec<_> = (0..4)
            .map(|i| Arc::new(RecordingExecutor::new(&format!("exec-{i}"))))
            .collect();
        for exec in &execs {
            handler.register_executor(exec.clone());
        }
        for _ in 0..400 {
            handler.on_digest_event(digest_event(br#"{"guid":"m1"}"#)).await.unwrap();
        }
        for exec in &execs {
            assert!(exec.digests().len() > 0, "{} was never selected", exec.id());
        }
        let total: usize = execs.iter().map(|e| e.total()).sum();
        assert_eq!(total, 400);
    }

    #[tokio::test]
    async fn test_create_digest() {
        let storage = Arc::new(MemoryStorage::default());
        let handler = Handler::with_seed(Arc::clone(&storage), 1);
        let guid = handler.create_digest_on_schedule().await.unwrap();
        let digests: Vec<MachineDigest> = storage.list(&[]).await.unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].guid(), guid);
    }

    #[tokio::test]
    async fn test_create_digest_failure_is_reported() {
        let storage = Arc::new(FaultyStorage::default());
        storage.fail_creates(1, Fault::Internal);
        let handler = Handler::with_seed(Arc::clone(&storage), 1);
        assert!(handler.create_digest_on_schedule().await.is_err());
        assert!(storage.memory().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_creates_then_updates() {
        let storage = Arc::new(MemoryStorage::default());
        let handler = Handler::with_seed(Arc::clone(&storage), 1);

        handler.run_discovery_on_schedule().await.unwrap();
        handler.run_discovery_on_schedule().await.unwrap();
        handler.run_discovery_on_schedule().await.unwrap();

        let records: Vec<DiscoveredMachines> = storage.list(&[]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, DiscoveryState::Started);
    }

    #[tokio::test]
    async fn test_discovery_keeps_recorded_zones_and_machines() {
        let storage = Arc::new(MemoryStorage::default());
        let mut seeded = DiscoveredMachines::new();
        seeded.state = DiscoveryState::Finished;
        seeded.zones = vec!["eu-west".into()];
        seeded.machines = vec![DiscoveredMachine {
            address: "10.0.0.7".into(),
            zone: "eu-west".into(),
            hostname: Some("web-07".into()),
        }];
        storage.create(&mut seeded).await.unwrap();

        let handler = Handler::with_seed(Arc::clone(&storage), 1);
        handler.run_discovery_on_schedule().await.unwrap();

        let mut latest = DiscoveredMachines::new();
        storage.get(&mut latest).await.unwrap();
        assert_eq!(latest.state, DiscoveryState::Started);
        assert_eq!(latest.zones, seeded.zones);
        assert_eq!(latest.machines, seeded.machines);
    }

    #[tokio::test]
    async fn test_discovery_retries_non_internal_failures() {
        let storage = Arc::new(FaultyStorage::default());
        // First create loses a race, the second attempt goes through.
        storage.fail_creates(1, Fault::AlreadyExists);
        let mut handler = Handler::with_seed(Arc::clone(&storage), 1);
        handler.set_retry_policy(fast_retry(3));

        handler.run_discovery_on_schedule().await.unwrap();
        assert_eq!(storage.update_calls(), 0);
        assert_eq!(storage.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_discovery_retries_vanished_record() {
        let storage = Arc::new(FaultyStorage::default());
        storage.memory().create(&mut DiscoveredMachines::new()).await.unwrap();
        // Deleted between the read and the write.
        storage.fail_updates(1, Fault::NotFound);
        let mut handler = Handler::with_seed(Arc::clone(&storage), 1);
        handler.set_retry_policy(fast_retry(3));

        handler.run_discovery_on_schedule().await.unwrap();
        assert_eq!(storage.update_calls(), 2);
        assert_eq!(storage.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_discovery_abandons_on_internal_failure() {
        let storage = Arc::new(FaultyStorage::default());
        storage.memory().create(&mut DiscoveredMachines::new()).await.unwrap();
        storage.fail_updates(1, Fault::Internal);
        let mut handler = Handler::with_seed(Arc::clone(&storage), 1);
        handler.set_retry_policy(fast_retry(3));

        let err = handler.run_discovery_on_schedule().await.unwrap_err();
        assert!(matches!(err, DispatchError::Storage(_)));
        assert_eq!(storage.update_calls(), 1);
        assert_eq!(storage.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_discovery_gives_up_after_max_attempts() {
        let storage = Arc::new(FaultyStorage::default());
        storage.fail_creates(u32::MAX, Fault::AlreadyExists);
        let mut handler = Handler::with_seed(Arc::clone(&storage), 1);
        handler.set_retry_policy(fast_retry(3));

        let err = handler.run_discovery_on_schedule().await.unwrap_err();
        assert!(matches!(err, DispatchError::DiscoveryExhausted { attempts: 3, .. }));
        assert_eq!(storage.update_calls(), 0);
        assert_eq!(storage.create_calls(), 3);
    }
}
