//! Records kept in storage.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Metadata carried by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Globally unique identifier, assigned once on creation.
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updating_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleting: bool,
}

impl ObjectMeta {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Checks the timestamp ordering invariant.
    pub fn validate(&self) -> Result<(), String> {
        match self.updating_timestamp {
            Some(updated) if updated < self.creation_timestamp => Err(format!(
                "update timestamp {updated} precedes creation timestamp {}",
                self.creation_timestamp
            )),
            _ => Ok(()),
        }
    }
}

/// A record that can be persisted and watched.
pub trait Object: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind tag, also the first segment of the storage key.
    const KIND: &'static str;
    /// Whether instances live inside a namespace.
    const NAMESPACED: bool = false;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn guid(&self) -> &str {
        &self.meta().guid
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Storage key: `/{kind}/{name}` or `/{kind}/{namespace}/{name}`.
    fn key(&self) -> String {
        let meta = self.meta();
        match meta.namespace.as_deref() {
            Some(ns) if Self::NAMESPACED && !ns.is_empty() => {
                format!("/{}/{}/{}", Self::KIND, ns, meta.name)
            }
            _ => format!("/{}/{}", Self::KIND, meta.name),
        }
    }

    /// Prefix shared by every key of this kind.
    fn kind_prefix() -> String {
        format!("/{}/", Self::KIND)
    }
}

macro_rules! impl_object {
    ($ty:ty, $kind:expr, $namespaced:expr) => {
        impl Object for $ty {
            const KIND: &'static str = $kind;
            const NAMESPACED: bool = $namespaced;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

/// A tracked machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl Machine {
    pub fn new(name: &str) -> Self {
        Self {
            meta: ObjectMeta::new(Self::KIND, name),
            ..Self::default()
        }
    }
}

impl_object!(Machine, "machine", true);

/// Summary line for one machine inside a digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub machine: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub reachable: bool,
}

/// Point-in-time snapshot of machine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineDigest {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub entries: Vec<DigestEntry>,
}

impl MachineDigest {
    /// A fresh digest; storage assigns the identity on create.
    pub fn new() -> Self {
        Self {
            meta: ObjectMeta::new(Self::KIND, ""),
            entries: Vec::new(),
        }
    }
}

impl_object!(MachineDigest, "machine-digest", false);

/// Progress of an auto-discovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Started,
    Finished,
    Failed,
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryState::Idle => write!(f, "Idle"),
            DiscoveryState::Started => write!(f, "Started"),
            DiscoveryState::Finished => write!(f, "Finished"),
            DiscoveryState::Failed => write!(f, "Failed"),
        }
    }
}

/// A machine found by discovery but not yet tracked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredMachine {
    pub address: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Singleton record describing the latest discovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredMachines {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub state: DiscoveryState,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub machines: Vec<DiscoveredMachine>,
}

/// Name of the discovered-machines singleton.
pub const DISCOVERED_MACHINES_NAME: &str = "discovered-machines";

impl DiscoveredMachines {
    pub fn new() -> Self {
        Self {
            meta: ObjectMeta::new(Self::KIND, DISCOVERED_MACHINES_NAME),
            ..Self::default()
        }
    }
}

impl_object!(DiscoveredMachines, "discovered-machines", false);
