//! In-memory backend for local runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use uuid::Uuid;

use super::Storage;
use crate::error::StorageError;
use crate::object::{Object, ObjectMeta};
use crate::watch::{
    self, DEFAULT_WATCH_CHAN_SIZE, WatchEvent, WatchEventType, WatchMode, WatchScope, WatchSender,
    Watcher,
};

struct Registration {
    scope: WatchScope,
    sender: WatchSender,
}

struct Inner {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<Registration>>,
    closed: AtomicBool,
    watch_chan_size: usize,
}

/// Thread-safe storage that keeps serialized objects in a sorted map.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CHAN_SIZE)
    }
}

impl MemoryStorage {
    pub fn new(watch_chan_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: RwLock::new(BTreeMap::new()),
                watchers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                watch_chan_size,
            }),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live watch registrations.
    pub fn watcher_count(&self) -> usize {
        self.inner
            .watchers
            .lock()
            .map(|mut w| {
                w.retain(|r| !r.sender.is_closed());
                w.len()
            })
            .unwrap_or(0)
    }

    /// Deliver a raw backend event to every watcher whose scope covers
    /// `event.key`. Used to report watch failures (`ERROR`) to consumers.
    pub fn publish(&self, event: WatchEvent) {
        self.emit(&event);
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: &WatchEvent) {
        let Ok(mut watchers) = self.inner.watchers.lock() else {
            tracing::error!("watch registry poisoned, dropping {} event", event.event_type);
            return;
        };
        watchers.retain(|r| {
            if r.scope.matches(&event.key) {
                r.sender.deliver(event.clone())
            } else {
                !r.sender.is_closed()
            }
        });
    }

    fn poisoned<T>(_: T) -> StorageError {
        StorageError::Internal("object map poisoned".into())
    }

    fn create_sync<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.ensure_open()?;
        {
            let meta = obj.meta_mut();
            if meta.guid.is_empty() {
                meta.guid = Uuid::new_v4().to_string();
            }
            if meta.name.is_empty() {
                meta.name = meta.guid.clone();
            }
            meta.kind = O::KIND.to_string();
            meta.creation_timestamp = Utc::now();
            meta.updating_timestamp = None;
            meta.deleting = false;
        }
        let key = obj.key();
        let value = serde_json::to_vec(obj)?;

        let mut objects = self.inner.objects.write().map_err(Self::poisoned)?;
        if objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists { key });
        }
        objects.insert(key.clone(), value.clone());
        self.emit(&WatchEvent::new(WatchEventType::Create, O::KIND, &key, value));
        tracing::debug!(key = %key, "Object created");
        Ok(())
    }

    fn get_sync<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = obj.key();
        let objects = self.inner.objects.read().map_err(Self::poisoned)?;
        let value = objects.get(&key).ok_or(StorageError::NotFound { key })?;
        *obj = serde_json::from_slice(value)?;
        Ok(())
    }

    fn update_sync<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = obj.key();
        let mut objects = self.inner.objects.write().map_err(Self::poisoned)?;
        let stored: ObjectMeta = match objects.get(&key) {
            Some(value) => serde_json::from_slice::<O>(value)?.meta().clone(),
            None => return Err(StorageError::NotFound { key }),
        };

        {
            let meta = obj.meta_mut();
            if !meta.guid.is_empty() && meta.guid != stored.guid {
                return Err(StorageError::Conflict {
                    key,
                    reason: format!("guid {} cannot replace {}", meta.guid, stored.guid),
                });
            }
            meta.guid = stored.guid;
            meta.kind = O::KIND.to_string();
            meta.creation_timestamp = stored.creation_timestamp;
            meta.updating_timestamp = Some(Utc::now().max(stored.creation_timestamp));
            meta.validate()
                .map_err(|reason| StorageError::Conflict { key: key.clone(), reason })?;
        }

        let value = serde_json::to_vec(obj)?;
        objects.insert(key.clone(), value.clone());
        self.emit(&WatchEvent::new(WatchEventType::Update, O::KIND, &key, value));
        tracing::debug!(key = %key, "Object updated");
        Ok(())
    }

    fn delete_sync<O: Object>(&self, obj: &O) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = obj.key();
        let mut objects = self.inner.objects.write().map_err(Self::poisoned)?;
        let value = objects
            .remove(&key)
            .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;
        self.emit(&WatchEvent::new(WatchEventType::Delete, O::KIND, &key, value));
        tracing::debug!(key = %key, "Object deleted");
        Ok(())
    }

    fn list_sync<O: Object>(&self, namespaces: &[&str]) -> Result<Vec<O>, StorageError> {
        self.ensure_open()?;
        let prefix = O::kind_prefix();
        let objects = self.inner.objects.read().map_err(Self::poisoned)?;
        let mut out = Vec::new();
        let entries = objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix));
        for (_, value) in entries {
            let obj: O = serde_json::from_slice(value)?;
            let in_scope = namespaces.is_empty()
                || obj
                    .meta()
                    .namespace
                    .as_deref()
                    .is_some_and(|ns| namespaces.contains(&ns));
            if in_scope {
                out.push(obj);
            }
        }
        Ok(out)
    }

    fn watch_sync<O: Object>(&self, target: &O, mode: WatchMode) -> Result<Watcher, StorageError> {
        self.ensure_open()?;
        let scope = WatchScope::for_target(target, mode);
        let (sender, watcher) = watch::channel(self.inner.watch_chan_size);
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .map_err(|_| StorageError::Internal("watch registry poisoned".into()))?;
        tracing::debug!(scope = ?scope, "👀 Watch registered");
        watchers.push(Registration { scope, sender });
        Ok(watcher)
    }
}

impl Storage for MemoryStorage {
    async fn create<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.create_sync(obj)
    }

    async fn get<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.get_sync(obj)
    }

    async fn update<O: Object>(&self, obj: &mut O) -> Result<(), StorageError> {
        self.update_sync(obj)
    }

    async fn delete<O: Object>(&self, obj: &O) -> Result<(), StorageError> {
        self.delete_sync(obj)
    }

    async fn list<O: Object>(&self, namespaces: &[&str]) -> Result<Vec<O>, StorageError> {
        self.list_sync(namespaces)
    }

    async fn watch<O: Object>(&self, target: &O, mode: WatchMode) -> Result<Watcher, StorageError> {
        self.watch_sync(target, mode)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every watcher's stream.
        if let Ok(mut watchers) = self.inner.watchers.lock() {
            watchers.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{DiscoveredMachines, DiscoveryState, Machine, MachineDigest};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let storage = MemoryStorage::default();
        let mut digest = MachineDigest::new();
        storage.create(&mut digest).await.unwrap();
        assert!(!digest.guid().is_empty());
        assert_eq!(digest.name(), digest.guid());
        assert_eq!(digest.meta.kind, "machine-digest");

        let mut again = digest.clone();
        let err = storage.create(&mut again).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let storage = MemoryStorage::default();
        let mut latest = DiscoveredMachines::new();
        latest.state = DiscoveryState::Started;
        let err = storage.update(&mut latest).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_internal());

        storage.create(&mut latest).await.unwrap();
        let guid = latest.guid().to_string();

        let mut fresh = DiscoveredMachines::new();
        fresh.state = DiscoveryState::Finished;
        storage.update(&mut fresh).await.unwrap();
        assert_eq!(fresh.guid(), guid);
        assert!(fresh.meta.updating_timestamp.unwrap() >= fresh.meta.creation_timestamp);

        let mut loaded = DiscoveredMachines::new();
        storage.get(&mut loaded).await.unwrap();
        assert_eq!(loaded.state, DiscoveryState::Finished);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_guid_change() {
        let storage = MemoryStorage::default();
        let mut m = Machine::new("web-01");
        storage.create(&mut m).await.unwrap();
        m.meta.guid = "other".into();
        let err = storage.update(&mut m).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_list_with_namespaces() {
        let storage = MemoryStorage::default();
        for (name, ns) in [("a", "prod"), ("b", "dev"), ("c", "prod")] {
            let mut m = Machine::new(name);
            m.meta.namespace = Some(ns.into());
            storage.create(&mut m).await.unwrap();
        }
        storage.create(&mut MachineDigest::new()).await.unwrap();

        let all: Vec<Machine> = storage.list(&[]).await.unwrap();
        assert_eq!(all.len(), 3);
        let prod: Vec<Machine> = storage.list(&["prod"]).await.unwrap();
        assert_eq!(prod.len(), 2);
        let digests: Vec<MachineDigest> = storage.list(&[]).await.unwrap();
        assert_eq!(digests.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_scopes() {
        let storage = MemoryStorage::default();
        let mut by_kind = storage.watch(&MachineDigest::new(), WatchMode::OnKind).await.unwrap();
        let mut by_name = storage
            .watch(&DiscoveredMachines::new(), WatchMode::OnName)
            .await
            .unwrap();

        storage.create(&mut Machine::new("web-01")).await.unwrap();
        let mut digest = MachineDigest::new();
        storage.create(&mut digest).await.unwrap();
        storage.create(&mut DiscoveredMachines::new()).await.unwrap();

        let event = by_kind.next().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Create);
        assert_eq!(event.decode::<MachineDigest>().unwrap().guid(), digest.guid());

        let event = by_name.next().await.unwrap();
        assert_eq!(event.key, "/discovered-machines/discovered-machines");

        storage.delete(&digest).await.unwrap();
        assert_eq!(by_kind.next().await.unwrap().event_type, WatchEventType::Delete);
    }

    #[tokio::test]
    async fn test_closed_watchers_are_pruned() {
        let storage = MemoryStorage::default();
        let mut watcher = storage.watch(&Machine::default(), WatchMode::OnKind).await.unwrap();
        assert_eq!(storage.watcher_count(), 1);
        watcher.close();
        assert_eq!(storage.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_watcher_is_told_and_dropped() {
        let storage = MemoryStorage::new(1);
        let mut watcher = storage.watch(&MachineDigest::new(), WatchMode::OnKind).await.unwrap();

        let mut first = MachineDigest::new();
        storage.create(&mut first).await.unwrap();
        let mut second = MachineDigest::new();
        storage.create(&mut second).await.unwrap();
        assert_eq!(storage.watcher_count(), 0);

        // Nothing reaches a dropped registration, not even a backend error.
        storage.publish(WatchEvent::error(MachineDigest::KIND, "/machine-digest/", "boom"));

        let event = watcher.next().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Create);
        assert_eq!(event.decode::<MachineDigest>().unwrap().guid(), first.guid());
        let event = watcher.next().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Error);
        assert_eq!(event.key, second.key());
        assert!(watcher.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_watchers_and_rejects_ops() {
        let storage = MemoryStorage::default();
        let mut watcher = storage.watch(&Machine::default(), WatchMode::OnKind).await.unwrap();
        storage.close().await.unwrap();
        assert!(watcher.next().await.is_none());
        let err = storage.create(&mut Machine::new("x")).await.unwrap_err();
        assert!(err.is_internal());
    }

    #[tokio::test]
    async fn test_concurrent_creates() {
        let storage = MemoryStorage::default();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.create(&mut MachineDigest::new()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(storage.len(), 32);
    }
}
