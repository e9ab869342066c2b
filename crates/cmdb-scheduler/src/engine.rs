//! Scheduler engine: the loop that multiplexes the watch streams with the
//! schedule timer and fans the resulting work out through the dispatch queue.
//!
//! One task evaluates every source, so engine-private state needs no locks.
//! Dispatched actions run concurrently with the loop and with each other.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use cmdb_core::config::SchedulerConfig;
use cmdb_core::{
    DiscoveredMachines, Machine, MachineDigest, Storage, StorageError, WatchEvent,
    WatchEventType, WatchMode, Watcher,
};
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::dispatch::DispatchQueue;
use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::handler::{Handler, RetryPolicy};
use crate::schedule::{CronSchedule, ScheduleOracle};

/// The three watch subscriptions the engine holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchStream {
    /// Machine records, by kind.
    Machine,
    /// Machine digests, by kind.
    Digest,
    /// The discovered-machines singleton, by name.
    Discovered,
}

impl WatchStream {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchStream::Machine => "machine",
            WatchStream::Digest => "machine-digest",
            WatchStream::Discovered => "discovered-machines",
        }
    }
}

impl fmt::Display for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`SchedulerEngine`]. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// Why `serve` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `stop()` was called.
    Stopped,
    /// A fatal stream reported `ERROR`.
    WatchFailed { stream: WatchStream },
    /// A fatal stream was ended by the backend.
    WatchClosed { stream: WatchStream },
    /// A watch could not be established, the loop never ran.
    StartupFailed { stream: WatchStream },
}

impl ShutdownReason {
    pub fn is_graceful(self) -> bool {
        matches!(self, ShutdownReason::Stopped)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Stopped => write!(f, "stopped"),
            ShutdownReason::WatchFailed { stream } => write!(f, "{stream} watch failed"),
            ShutdownReason::WatchClosed { stream } => write!(f, "{stream} watch closed"),
            ShutdownReason::StartupFailed { stream } => write!(f, "{stream} watch not established"),
        }
    }
}

/// Tunables of the loop.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Re-poll delay while the schedule has no defined next activation.
    pub revalidate_interval: Duration,
    /// Dispatched actions allowed to run at once, extra work is dropped.
    pub max_in_flight: usize,
    /// How long shutdown waits for dispatched actions before aborting them.
    pub drain_timeout: Duration,
    pub discovery_retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            revalidate_interval: Duration::from_secs(60),
            max_in_flight: 64,
            drain_timeout: Duration::from_secs(5),
            discovery_retry: RetryPolicy::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            revalidate_interval: Duration::from_secs(config.revalidate_secs.max(1)),
            max_in_flight: config.max_in_flight,
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            discovery_retry: RetryPolicy {
                max_attempts: config.discovery_attempts,
                backoff: Duration::from_millis(config.discovery_backoff_ms),
            },
        }
    }
}

struct Shared {
    state: EngineState,
    reason: Option<ShutdownReason>,
    subscribers: Vec<oneshot::Sender<ShutdownReason>>,
}

/// Cloneable control surface of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    shared: Arc<Mutex<Shared>>,
}

impl EngineHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Self {
            stop_tx: Arc::new(stop_tx),
            shared: Arc::new(Mutex::new(Shared {
                state: EngineState::Init,
                reason: None,
                subscribers: Vec::new(),
            })),
        };
        (handle, stop_rx)
    }

    /// Ask the loop to exit at its next iteration. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            tracing::debug!("Stop already requested");
        } else {
            tracing::info!("🛑 Scheduler stop requested");
        }
    }

    /// One-shot completion notification. Resolves immediately with the
    /// recorded reason when the engine has already stopped.
    pub fn subscribe(&self) -> oneshot::Receiver<ShutdownReason> {
        let (tx, rx) = oneshot::channel();
        let mut shared = self.lock();
        match shared.reason {
            Some(reason) => {
                let _ = tx.send(reason);
            }
            None => shared.subscribers.push(tx),
        }
        rx
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Subscribers still waiting for completion.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        self.lock().state = state;
    }

    fn finish(&self, reason: ShutdownReason) {
        let subscribers = {
            let mut shared = self.lock();
            shared.state = EngineState::Stopped;
            shared.reason = Some(reason);
            std::mem::take(&mut shared.subscribers)
        };
        for tx in subscribers {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(reason);
        }
    }
}

/// The scheduler core.
pub struct SchedulerEngine<S: Storage> {
    oracle: Arc<dyn ScheduleOracle>,
    handler: Option<Handler<S>>,
    options: EngineOptions,
    stop_rx: watch::Receiver<bool>,
    handle: EngineHandle,
}

impl<S: Storage> SchedulerEngine<S> {
    /// Parse `expr` and build an engine around it.
    pub fn new(expr: &str) -> Result<Self, SchedulerError> {
        let schedule = CronSchedule::parse(expr)?;
        tracing::info!(schedule = %schedule.expr(), "📅 Schedule parsed");
        Ok(Self::with_oracle(Arc::new(schedule)))
    }

    pub fn with_oracle(oracle: Arc<dyn ScheduleOracle>) -> Self {
        let (handle, stop_rx) = EngineHandle::new();
        Self {
            oracle,
            handler: None,
            options: EngineOptions::default(),
            stop_rx,
            handle,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        if let Some(handler) = self.handler.as_mut() {
            handler.set_retry_policy(options.discovery_retry.clone());
        }
        self.options = options;
        self
    }

    /// Attach storage. Replaces any handler built earlier.
    pub fn prepare(&mut self, storage: Arc<S>) {
        self.prepare_with(Handler::new(storage));
    }

    /// Attach a handler built by the caller, e.g. one with a fixed seed.
    pub fn prepare_with(&mut self, mut handler: Handler<S>) {
        handler.set_retry_policy(self.options.discovery_retry.clone());
        self.handler = Some(handler);
    }

    pub fn register_executor(&mut self, executor: Arc<dyn Executor>) -> Result<(), SchedulerError> {
        let handler = self.handler.as_mut().ok_or(SchedulerError::NotPrepared)?;
        handler.register_executor(executor);
        Ok(())
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> EngineState {
        self.handle.state()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn subscribe(&self) -> oneshot::Receiver<ShutdownReason> {
        self.handle.subscribe()
    }

    /// Run the loop until a stop request or a fatal watch failure.
    ///
    /// Only a failed watch establishment is returned as an error; every
    /// other exit is described by the [`ShutdownReason`].
    pub async fn serve(&mut self) -> Result<ShutdownReason, SchedulerError> {
        if self.handle.state() != EngineState::Init {
            return Err(SchedulerError::AlreadyServed);
        }
        let handler = Arc::new(self.handler.take().ok_or(SchedulerError::NotPrepared)?);
        if handler.executor_count() == 0 {
            tracing::warn!("⚠️ No executor registered, event-triggered work will be dropped");
        }

        let mut watchers = match Watchers::open(handler.storage().as_ref()).await {
            Ok(watchers) => watchers,
            Err((stream, source)) => {
                tracing::error!(stream = %stream, error = %source, "Failed to establish watch");
                self.handle.finish(ShutdownReason::StartupFailed { stream });
                return Err(SchedulerError::WatchEstablishment { stream, source });
            }
        };

        let mut queue = DispatchQueue::new(self.options.max_in_flight);
        let mut stop_rx = self.stop_rx.clone();
        let revalidate = self.options.revalidate_interval;

        let first = match self.next_wait() {
            Some(wait) => wait,
            None => {
                tracing::info!(retry_in = ?revalidate, "⏳ Schedule is indefinite, will revalidate");
                revalidate
            }
        };
        let mut timer = Box::pin(tokio::time::sleep(first));

        self.handle.set_state(EngineState::Running);
        tracing::info!(
            executors = handler.executor_count(),
            first_tick_in = ?first,
            "🚀 Scheduler running"
        );

        let reason = loop {
            tokio::select! {
                biased;

                _ = stop_requested(&mut stop_rx) => {
                    break ShutdownReason::Stopped;
                }

                event = watchers.machine.next() => match event {
                    Some(event) => match event.event_type {
                        WatchEventType::Error => break watch_failed(WatchStream::Machine, &event),
                        WatchEventType::Delete => {
                            // Reserved hook, deleting a machine triggers no cleanup.
                            tracing::debug!(key = %event.key, "Machine deleted");
                        }
                        _ => {}
                    },
                    None => break watch_closed(WatchStream::Machine),
                },

                event = watchers.digest.next() => match event {
                    Some(event) => match event.event_type {
                        WatchEventType::Error => break watch_failed(WatchStream::Digest, &event),
                        WatchEventType::Create => {
                            let handler = Arc::clone(&handler);
                            queue.spawn("refresh-digest", async move {
                                let _ = handler.on_digest_event(event).await;
                            });
                        }
                        _ => {}
                    },
                    None => break watch_closed(WatchStream::Digest),
                },

                event = watchers.discovered.next(), if watchers.discovered_open => match event {
                    Some(event) => match event.event_type {
                        WatchEventType::Create | WatchEventType::Update => {
                            let handler = Arc::clone(&handler);
                            queue.spawn("refresh-discovered", async move {
                                let _ = handler.on_discovery_event(event).await;
                            });
                        }
                        WatchEventType::Error => {
                            tracing::warn!(
                                detail = %String::from_utf8_lossy(&event.value),
                                "⚠️ Discovered-machines watch reported an error, continuing"
                            );
                        }
                        WatchEventType::Delete => {}
                    },
                    None => {
                        tracing::warn!("⚠️ Discovered-machines watch ended, discovery events disabled");
                        watchers.discovered_open = false;
                    }
                },

                () = &mut timer => {
                    match self.next_wait() {
                        None => {
                            tracing::debug!(retry_in = ?revalidate, "Schedule still indefinite");
                            timer.as_mut().reset(Instant::now() + revalidate);
                        }
                        Some(wait) => {
                            timer.as_mut().reset(Instant::now() + wait);
                            tracing::info!(next_in = ?wait, "⏰ Scheduled tick");

                            let digest = Arc::clone(&handler);
                            queue.spawn("create-digest", async move {
                                let _ = digest.create_digest_on_schedule().await;
                            });
                            let discovery = Arc::clone(&handler);
                            queue.spawn("discovery-sweep", async move {
                                let _ = discovery.run_discovery_on_schedule().await;
                            });
                        }
                    }
                }
            }
        };

        self.handle.set_state(EngineState::Stopping);
        drop(timer);

        let report = queue.drain(self.options.drain_timeout).await;
        tracing::debug!(
            completed = report.completed,
            aborted = report.aborted,
            dropped = queue.dropped(),
            "Dispatch queue drained"
        );

        watchers.close_all();
        self.handle.finish(reason);

        if reason.is_graceful() {
            tracing::info!("✅ Scheduler stopped");
        } else {
            tracing::error!(reason = %reason, "❌ Scheduler stopped on watch failure");
        }
        Ok(reason)
    }

    /// Time until the next activation, `None` when the schedule is indefinite.
    fn next_wait(&self) -> Option<Duration> {
        let now = Utc::now();
        let next = self.oracle.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

struct Watchers {
    machine: Watcher,
    digest: Watcher,
    discovered: Watcher,
    discovered_open: bool,
}

impl Watchers {
    /// Opens all three subscriptions or none of them.
    async fn open<S: Storage>(storage: &S) -> Result<Self, (WatchStream, StorageError)> {
        let mut machine = storage
            .watch(&Machine::default(), WatchMode::OnKind)
            .await
            .map_err(|e| (WatchStream::Machine, e))?;

        let mut digest = match storage.watch(&MachineDigest::new(), WatchMode::OnKind).await {
            Ok(watcher) => watcher,
            Err(e) => {
                machine.close();
                return Err((WatchStream::Digest, e));
            }
        };

        let discovered = match storage
            .watch(&DiscoveredMachines::new(), WatchMode::OnName)
            .await
        {
            Ok(watcher) => watcher,
            Err(e) => {
                machine.close();
                digest.close();
                return Err((WatchStream::Discovered, e));
            }
        };

        Ok(Self {
            machine,
            digest,
            discovered,
            discovered_open: true,
        })
    }

    fn close_all(&mut self) {
        self.machine.close();
        self.digest.close();
        self.discovered.close();
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    // Also resolves when stop was requested before the loop started.
    let requested = rx.wait_for(|stopped| *stopped).await.is_ok();
    if !requested {
        // Sender gone, no stop can ever arrive.
        std::future::pending::<()>().await;
    }
}

fn watch_failed(stream: WatchStream, event: &WatchEvent) -> ShutdownReason {
    tracing::error!(
        stream = %stream,
        detail = %String::from_utf8_lossy(&event.value),
        "Watch reported an error, stopping scheduler"
    );
    ShutdownReason::WatchFailed { stream }
}

fn watch_closed(stream: WatchStream) -> ShutdownReason {
    tracing::error!(stream = %stream, "Watch ended unexpectedly, stopping scheduler");
    ShutdownReason::WatchClosed { stream }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdb_core::MemoryStorage;

    #[test]
    fn test_invalid_schedule_fails_construction() {
        let err = SchedulerEngine::<MemoryStorage>::new("not a schedule").err().unwrap();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_options_from_config() {
        let config = SchedulerConfig {
            revalidate_secs: 0,
            discovery_attempts: 2,
            ..SchedulerConfig::default()
        };
        let options = EngineOptions::from_config(&config);
        assert_eq!(options.revalidate_interval, Duration::from_secs(1));
        assert_eq!(options.discovery_retry.max_attempts, 2);
        assert_eq!(options.max_in_flight, 64);
    }

    #[test]
    fn test_reason_display() {
        assert!(ShutdownReason::Stopped.is_graceful());
        let failed = ShutdownReason::WatchFailed { stream: WatchStream::Digest };
        assert!(!failed.is_graceful());
        assert_eq!(failed.to_string(), "machine-digest watch failed");
    }

    #[tokio::test]
    async fn test_subscribe_after_finish_gets_reason() {
        let (handle, _rx) = EngineHandle::new();
        let early = handle.subscribe();
        handle.finish(ShutdownReason::Stopped);
        assert_eq!(early.await.unwrap(), ShutdownReason::Stopped);
        assert_eq!(handle.subscribe().await.unwrap(), ShutdownReason::Stopped);
        assert_eq!(handle.subscriber_count(), 0);
        assert_eq!(handle.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_requires_prepare() {
        let mut engine = SchedulerEngine::<MemoryStorage>::new("@hourly").unwrap();
        assert!(matches!(engine.serve().await, Err(SchedulerError::NotPrepared)));
        assert!(matches!(
            engine.register_executor(Arc::new(crate::mocks::RecordingExecutor::new("x"))),
            Err(SchedulerError::NotPrepared)
        ));
    }
}
