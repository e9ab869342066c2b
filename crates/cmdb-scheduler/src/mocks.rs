//! Test doubles for the scheduler's seams.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! cmdb-scheduler = { path = "...", features = ["test-support"] }
//! ```

use std::collections::VecDeque;
use std::sync::{
    Mutex,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdb_core::{
    DiscoveredMachines, MachineDigest, MemoryStorage, Object, Storage, StorageError, WatchMode,
    Watcher,
};

use crate::executor::Executor;
use crate::schedule::ScheduleOracle;

// ── ScriptedSchedule ─────────────────────────────────────────────────────────

/// One answer of a [`ScriptedSchedule`].
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Next activation is this far from `now`.
    In(Duration),
    /// No defined next activation.
    Indefinite,
}

/// Oracle that replays a fixed script, then repeats `fallback` forever.
pub struct ScriptedSchedule {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
}

impl ScriptedSchedule {
    pub fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always indefinite.
    pub fn indefinite() -> Self {
        Self::new([], Step::Indefinite)
    }

    /// Times the engine asked for the next activation.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScheduleOracle for ScriptedSchedule {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match step {
            Step::In(delay) => Some(now + chrono::Duration::from_std(delay).unwrap()),
            Step::Indefinite => None,
        }
    }
}

// ── RecordingExecutor ────────────────────────────────────────────────────────

/// Executor that keeps every notification it receives.
#[derive(Default)]
pub struct RecordingExecutor {
    id: String,
    digests: Mutex<Vec<MachineDigest>>,
    discovered: Mutex<Vec<DiscoveredMachines>>,
}

impl RecordingExecutor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn digests(&self) -> Vec<MachineDigest> {
        self.digests.lock().unwrap().clone()
    }

    pub fn discovered(&self) -> Vec<DiscoveredMachines> {
        self.discovered.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.digests.lock().unwrap().len() + self.discovered.lock().unwrap().len()
    }

    /// Polls until at least `count` notifications arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.total() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify_digest(&self, digest: MachineDigest) {
        self.digests.lock().unwrap().push(digest);
    }

    async fn notify_discovered_machines(&self, latest: DiscoveredMachines) {
        self.discovered.lock().unwrap().push(latest);
    }
}

// ── FaultyStorage ────────────────────────────────────────────────────────────

/// Error injected by [`FaultyStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    AlreadyExists,
    Internal,
}

impl Fault {
    fn into_error(self, key: String) -> StorageError {
        match self {
            Fault::NotFound => StorageError::NotFound { key },
            Fault::AlreadyExists => StorageError::AlreadyExists { key },
            Fault::Internal => StorageError::Internal(format!("injected failure on {key}")),
        }
    }
}

#[derive(Default)]
struct Injection {
    remaining: AtomicU32,
    fault: Mutex<Option<Fault>>,
}

impl Injection {
    fn arm(&self, times: u32, fault: Fault) {
        *self.fault.lock().unwrap() = Some(fault);
        self.remaining.store(times, Ordering::SeqCst);
    }

    fn take(&self) -> Option<Fault> {
        let fault = (*self.fault.lock().unwrap())?;
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| fault)
    }
}

/// [`MemoryStorage`] with injectable failures and call counters.
#[derive(Default)]
pub struct FaultyStorage {
    memory: MemoryStorage,
    creates: Injection,
    updates: Injection,
    failing_watch_kind: Mutex<Option<&'static str>>,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped storage, e.g. to `publish` raw events.
    pub fn memory(&self) -> &MemoryStorage {
        &self.memory
    }

    /// Fail the next `times` creates with `fault`.
    pub fn fail_creates(&self, times: u32, fault: Fault) {
        self.creates.arm(times, fault);
    }

    /// Fail the next `times` updates with `fault`.
    pub fn fail_updates(&self, times: u32, fault: Fault) {
        self.updates.arm(times, fault);
    }

    /// Refuse every watch on objects of `kind`.
    pub fn fail_watch_of(&self, kind: &'static str) {
        *self.failing_watch_kind.lock().unwrap() = Some(kind);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl Storage for FaultyStorage {
    async fn create<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.creates.take() {
            return Err(fault.into_error(obj.key()));
        }
        self.memory.create(obj).await
    }

    async fn get<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.memory.get(obj).await
    }

    async fn update<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.updates.take() {
            return Err(fault.into_error(obj.key()));
        }
        self.memory.update(obj).await
    }

    async fn delete<O: Object>(&self, obj: &O) -> Result<(), StorageError> {
        self.memory.delete(obj).await
    }

    async fn list<O: Object>(&self, namespaces: &[&str]) -> Result<Vec<O>, StorageError> {
        self.memory.list(namespaces).await
    }

    async fn watch<O: Object>(&self, target: &O, mode: WatchMode) -> Result<Watcher, StorageError> {
        let refused = *self.failing_watch_kind.lock().unwrap() == Some(O::KIND);
        if refused {
            return Err(StorageError::Internal(format!("injected watch failure on {}", O::KIND)));
        }
        self.memory.watch(target, mode).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.memory.close().await
    }
}

