//! Storage contract consumed by the scheduler, API and CLI.
//!
//! Backends must be safe to call concurrently from any number of tasks
//! without external locking.

mod memory;

use std::future::Future;

pub use memory::MemoryStorage;

use crate::error::StorageError;
use crate::object::Object;
use crate::watch::{WatchMode, Watcher};

/// Persistence and change-notification capability.
pub trait Storage: Send + Sync + 'static {
    /// Persist a new object. Assigns the identity and creation timestamp.
    fn create<O: Object>(&self, obj: &mut O)
    -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Load the object addressed by `obj`'s key into `obj`.
    fn get<O: Object>(&self, obj: &mut O) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Replace an existing object. Fails with `NotFound` if it does not exist.
    fn update<O: Object>(&self, obj: &mut O)
    -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete<O: Object>(&self, obj: &O) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// All objects of kind `O`, restricted to `namespaces` unless empty.
    fn list<O: Object>(
        &self,
        namespaces: &[&str],
    ) -> impl Future<Output = Result<Vec<O>, StorageError>> + Send;

    /// Subscribe to changes of every object of `target`'s kind
    /// ([`WatchMode::OnKind`]) or of `target` alone ([`WatchMode::OnName`]).
    fn watch<O: Object>(
        &self,
        target: &O,
        mode: WatchMode,
    ) -> impl Future<Output = Result<Watcher, StorageError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send;
}
