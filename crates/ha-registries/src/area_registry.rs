//! Area Registry
//!
//! Tracks the physical areas (rooms, zones) devices can be assigned to.
//! The device registry creates areas on demand from integration-supplied
//! `suggested_area` hints.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::SAVE_DELAY_SECS;
use crate::debounce::Debouncer;
use crate::storage::{Storable, Storage, StorageResult};

/// Storage key for area registry
pub const STORAGE_KEY: &str = "core.area_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// A registered area entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEntry {
    pub id: String,

    /// Area name (e.g., "Living Room")
    pub name: String,

    /// Normalized name used for lookups by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl AreaEntry {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            normalized_name: Some(normalize_name(&name)),
            name,
            picture: None,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Normalize a name for searching
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .trim()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ', "")
}

/// Area registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaRegistryData {
    pub areas: Vec<AreaEntry>,
}

impl Storable for AreaRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Area lookup tables, shared with the debounced save
#[derive(Debug, Default)]
struct AreaIndex {
    /// Primary index: area_id -> AreaEntry
    by_id: DashMap<String, Arc<AreaEntry>>,

    /// Index: normalized_name -> area_id
    by_name: DashMap<String, String>,
}

impl AreaIndex {
    fn insert(&self, entry: Arc<AreaEntry>) {
        if let Some(ref normalized) = entry.normalized_name {
            self.by_name.insert(normalized.clone(), entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn to_data(&self) -> AreaRegistryData {
        AreaRegistryData {
            areas: self.by_id.iter().map(|r| (**r.value()).clone()).collect(),
        }
    }
}

/// Area Registry
///
/// Entries are stored as `Arc<AreaEntry>` to avoid cloning on reads.
/// Creating or removing an area schedules a debounced save.
pub struct AreaRegistry {
    storage: Arc<Storage>,
    index: Arc<AreaIndex>,
    saver: Debouncer,
}

impl AreaRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_save_delay(storage, Duration::from_secs(SAVE_DELAY_SECS))
    }

    pub fn with_save_delay(storage: Arc<Storage>, save_delay: Duration) -> Self {
        let index = Arc::new(AreaIndex::default());

        let saver = {
            let index = Arc::clone(&index);
            let storage = Arc::clone(&storage);
            Debouncer::new("area_registry_save", save_delay, move || {
                let index = Arc::clone(&index);
                let storage = Arc::clone(&storage);
                async move {
                    if let Err(err) = write_areas(&storage, &index).await {
                        error!("Failed to save area registry: {}", err);
                    }
                }
            })
        };

        Self {
            storage,
            index,
            saver,
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<AreaRegistryData>(STORAGE_KEY).await? {
            info!(
                "Loading {} areas from storage (v{}.{})",
                storage_file.data.areas.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.areas {
                self.index.insert(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage now, cancelling any scheduled save
    pub async fn save(&self) -> StorageResult<()> {
        self.saver.cancel();
        write_areas(&self.storage, &self.index).await
    }

    pub fn schedule_save(&self) {
        self.saver.call();
    }

    pub fn save_pending(&self) -> bool {
        self.saver.is_pending()
    }

    /// Write a scheduled save immediately
    pub async fn flush(&self) {
        self.saver.flush().await;
    }

    pub fn get(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        self.index.by_id.get(area_id).map(|r| Arc::clone(r.value()))
    }

    /// Get area by name (case and punctuation insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<Arc<AreaEntry>> {
        let area_id = self.index.by_name.get(&normalize_name(name))?.clone();
        self.get(&area_id)
    }

    /// Create a new area
    pub fn create(&self, name: &str) -> Arc<AreaEntry> {
        let entry = Arc::new(AreaEntry::new(name));
        info!("Created area: {} ({})", name, entry.id);
        self.index.insert(Arc::clone(&entry));
        self.schedule_save();
        entry
    }

    /// Return the area with this name, creating it if absent
    pub fn get_or_create(&self, name: &str) -> Arc<AreaEntry> {
        match self.get_by_name(name) {
            Some(existing) => existing,
            None => self.create(name),
        }
    }

    /// Remove an area
    ///
    /// Callers clear the area from devices with
    /// `DeviceRegistry::clear_area_id`.
    pub fn remove(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        let (_, entry) = self.index.by_id.remove(area_id)?;
        if let Some(ref normalized) = entry.normalized_name {
            self.index.by_name.remove(normalized);
        }
        info!("Removed area: {}", area_id);
        self.schedule_save();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.index.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<AreaEntry>> + '_ {
        self.index.by_id.iter().map(|r| Arc::clone(r.value()))
    }
}

impl std::fmt::Debug for AreaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AreaRegistry")
            .field("areas", &self.len())
            .field("saver", &self.saver)
            .finish()
    }
}

async fn write_areas(storage: &Storage, index: &AreaIndex) -> StorageResult<()> {
    let data = index.to_data();
    storage.save(&data.to_storage_file()).await?;
    debug!("Saved {} areas to storage", data.areas.len());
    Ok(())
}
