use cmdb_core::{DecodeError, StorageError};
use thiserror::Error;

use crate::engine::WatchStream;

/// Errors that cross the scheduler's boundary to its caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid schedule expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("Failed to watch {stream} objects: {source}")]
    WatchEstablishment {
        stream: WatchStream,
        #[source]
        source: StorageError,
    },
    #[error("No storage attached, call prepare() before serve()")]
    NotPrepared,
    #[error("Scheduler has already been served")]
    AlreadyServed,
}

/// Failures of a single dispatched action. Logged, never fatal to the loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Discovery upsert gave up after {attempts} attempts: {last}")]
    DiscoveryExhausted { attempts: u32, last: String },
    #[error("No executor registered")]
    NoExecutor,
}
