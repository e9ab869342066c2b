//! # CMDB Core
//!
//! Shared building blocks for the configuration-management database:
//! the object model, change notifications, and the storage contract every
//! backend implements.
//!
//! ## Architecture
//! ```text
//! Storage (trait)
//!   ├── create / get / update / delete / list
//!   └── watch(kind | name) → Watcher ── WatchEvent { CREATE | UPDATE | DELETE | ERROR }
//!
//! Objects
//!   ├── Machine            /machine/<name>
//!   ├── MachineDigest      /machine-digest/<name>
//!   └── DiscoveredMachines /discovered-machines/discovered-machines
//! ```

pub mod config;
pub mod error;
pub mod object;
pub mod storage;
pub mod watch;

pub use config::CmdbConfig;
pub use error::{CmdbError, DecodeError, StorageError};
pub use object::{
    DigestEntry, DiscoveredMachine, DiscoveredMachines, DiscoveryState, Machine, MachineDigest,
    Object, ObjectMeta,
};
pub use storage::{MemoryStorage, Storage};
pub use watch::{WatchEvent, WatchEventType, WatchMode, WatchSender, Watcher};
