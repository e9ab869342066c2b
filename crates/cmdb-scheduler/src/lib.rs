//! # CMDB Scheduler
//!
//! Watches storage for machine, digest and discovery changes, fires digest
//! snapshots and discovery sweeps on a cron-like schedule, and hands the
//! resulting work to a pool of executors.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (single tokio::select! loop)
//!   ├── stop signal                 → exit
//!   ├── watch /machine/*            → DELETE: no-op hook, ERROR: fatal
//!   ├── watch /machine-digest/*     → CREATE: Handler::on_digest_event, ERROR: fatal
//!   ├── watch discovered-machines   → CREATE|UPDATE: Handler::on_discovery_event
//!   └── timer (ScheduleOracle)      → create digest + discovery sweep
//!                                       │
//!                        DispatchQueue (bounded, drained on exit)
//!                                       │
//!                        Executor pool (random pick per event)
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod schedule;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use dispatch::{DispatchQueue, DrainReport};
pub use engine::{
    EngineHandle, EngineOptions, EngineState, SchedulerEngine, ShutdownReason, WatchStream,
};
pub use error::{DispatchError, SchedulerError};
pub use executor::{ChannelExecutor, Executor, ExecutorJob};
pub use handler::{Handler, RetryPolicy};
pub use schedule::{CronSchedule, ScheduleOracle};
