//! Views onto the config entries and entities that keep devices alive
//!
//! The device registry does not own either collection. Cleanup and the
//! config-entry disable handling only need these narrow lookups.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::{Storage, StorageResult};

/// Storage key for config entries
pub const CONFIG_ENTRIES_STORAGE_KEY: &str = "core.config_entries";
/// Storage key for entity registry
pub const ENTITY_REGISTRY_STORAGE_KEY: &str = "core.entity_registry";

/// What disabled a config entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// The parts of a config entry the device registry cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntryInfo {
    pub entry_id: String,
    #[serde(default)]
    pub disabled_by: Option<ConfigEntryDisabledBy>,
}

impl ConfigEntryInfo {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            disabled_by: None,
        }
    }

    pub fn disabled(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            disabled_by: Some(ConfigEntryDisabledBy::User),
        }
    }
}

/// Source of the currently configured config entries
pub trait ConfigEntryLookup: Send + Sync {
    fn config_entries(&self) -> Vec<ConfigEntryInfo>;
}

/// Source of the device ids referenced by entity registry entries
pub trait EntityDeviceLookup: Send + Sync {
    fn referenced_device_ids(&self) -> HashSet<String>;
}

#[derive(Debug, Default, Deserialize)]
struct ConfigEntriesDocument {
    #[serde(default)]
    entries: Vec<ConfigEntryInfo>,
}

/// Config entries as persisted in `core.config_entries`
#[derive(Debug, Clone, Default)]
pub struct ConfigEntriesSnapshot {
    entries: Vec<ConfigEntryInfo>,
}

impl ConfigEntriesSnapshot {
    pub fn new(entries: Vec<ConfigEntryInfo>) -> Self {
        Self { entries }
    }

    /// Load from storage; a missing file is an empty snapshot
    pub async fn load(storage: &Storage) -> StorageResult<Self> {
        let document = storage
            .load::<ConfigEntriesDocument>(CONFIG_ENTRIES_STORAGE_KEY)
            .await?
            .map(|file| file.data)
            .unwrap_or_default();
        info!("Loaded {} config entries", document.entries.len());
        Ok(Self::new(document.entries))
    }
}

impl ConfigEntryLookup for ConfigEntriesSnapshot {
    fn config_entries(&self) -> Vec<ConfigEntryInfo> {
        self.entries.clone()
    }
}

#[derive(Debug, Deserialize)]
struct EntityReference {
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EntityRegistryDocument {
    #[serde(default)]
    entities: Vec<EntityReference>,
}

/// Device references of the entities persisted in `core.entity_registry`
#[derive(Debug, Clone, Default)]
pub struct EntityReferencesSnapshot {
    device_ids: HashSet<String>,
}

impl EntityReferencesSnapshot {
    pub fn new(device_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            device_ids: device_ids.into_iter().collect(),
        }
    }

    pub async fn load(storage: &Storage) -> StorageResult<Self> {
        let document = storage
            .load::<EntityRegistryDocument>(ENTITY_REGISTRY_STORAGE_KEY)
            .await?
            .map(|file| file.data)
            .unwrap_or_default();
        let snapshot = Self::new(
            document
                .entities
                .into_iter()
                .filter_map(|entity| entity.device_id),
        );
        info!(
            "Loaded {} device references from {} entities",
            snapshot.device_ids.len(),
            ENTITY_REGISTRY_STORAGE_KEY
        );
        Ok(snapshot)
    }
}

impl EntityDeviceLookup for EntityReferencesSnapshot {
    fn referenced_device_ids(&self) -> HashSet<String> {
        self.device_ids.clone()
    }
}
