//! Home Assistant Registries
//!
//! This crate provides the persistent registries that track devices and
//! the areas they live in:
//! - Devices (DeviceRegistry), with identity lookup, soft delete and restore
//! - Areas (AreaRegistry)
//!
//! All registries use JSON persistence in the `.storage/` directory
//! with versioning for migrations.

pub mod storage;

pub mod area_registry;
pub mod cleanup;
pub mod config;
pub mod debounce;
pub mod device_registry;
pub mod references;

// Re-export main types
pub use storage::{Storage, StorageError, StorageFile, StorageResult, Storable};

pub use device_registry::{
    DeletedDeviceEntry, DeviceChange, DeviceChanges, DeviceConnection, DeviceEntry,
    DeviceEntryDisabler, DeviceEntryType, DeviceIdentifier, DeviceInfo, DeviceRegistry,
    DeviceRegistryData, DeviceRegistryError, DeviceRegistryResult, DeviceRegistryUpdatedData,
    DeviceUpdate,
};

pub use area_registry::{AreaEntry, AreaRegistry, AreaRegistryData};

pub use cleanup::{cleanup, setup_cleanup, CleanupHandle};
pub use config::DeviceRegistryConfig;
pub use debounce::Debouncer;
pub use references::{
    ConfigEntriesSnapshot, ConfigEntryDisabledBy, ConfigEntryInfo, ConfigEntryLookup,
    EntityDeviceLookup, EntityReferencesSnapshot,
};

use ha_event_bus::SharedEventBus;
use std::sync::Arc;

/// All registries bundled together
pub struct Registries {
    pub storage: Arc<Storage>,
    pub areas: Arc<AreaRegistry>,
    pub devices: Arc<DeviceRegistry>,
}

impl Registries {
    /// Create new registries with the given config directory
    pub fn new(
        config_dir: impl AsRef<std::path::Path>,
        bus: SharedEventBus,
        config: DeviceRegistryConfig,
    ) -> Self {
        let storage = Arc::new(Storage::new(config_dir));
        let areas = Arc::new(AreaRegistry::with_save_delay(
            storage.clone(),
            config.save_delay(),
        ));
        let devices = Arc::new(DeviceRegistry::with_config(
            storage.clone(),
            bus,
            areas.clone(),
            config,
        ));

        Self {
            storage,
            areas,
            devices,
        }
    }

    /// Load all registries from storage
    pub async fn load_all(&self) -> StorageResult<()> {
        self.areas.load().await?;
        self.devices.load().await?;
        Ok(())
    }

    /// Save all registries to storage
    pub async fn save_all(&self) -> StorageResult<()> {
        self.areas.save().await?;
        self.devices.save().await?;
        Ok(())
    }

    /// Write every pending save
    pub async fn flush_all(&self) -> StorageResult<()> {
        self.devices.flush().await;
        if self.areas.save_pending() {
            self.areas.save().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_event_bus::EventBus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registries_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );

        registries.areas.create("Living Room");
        let device = registries
            .devices
            .get_or_create(
                DeviceInfo::new("entry1")
                    .with_identifier("hue", "bridge1")
                    .with_name("Hue Bridge")
                    .with_suggested_area("Office"),
            )
            .unwrap();
        assert!(registries.devices.save_pending());

        registries.flush_all().await.unwrap();
        assert!(!registries.devices.save_pending());

        let registries2 = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );
        registries2.load_all().await.unwrap();

        assert_eq!(registries2.devices.len(), 1);
        assert_eq!(registries2.areas.len(), 2);
        let reloaded = registries2.devices.get(&device.id).unwrap();
        assert_eq!(reloaded.name.as_deref(), Some("Hue Bridge"));
        assert_eq!(
            reloaded.area_id,
            registries2.areas.get_by_name("office").map(|area| area.id.clone())
        );
        assert_eq!(reloaded.suggested_area, None);
    }

    #[tokio::test]
    async fn test_device_save_writes_suggested_area() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );

        let device = registries
            .devices
            .get_or_create(
                DeviceInfo::new("entry1")
                    .with_identifier("hue", "lamp1")
                    .with_suggested_area("Den"),
            )
            .unwrap();
        let area_id = device.area_id.clone().unwrap();
        assert!(registries.areas.save_pending());

        registries.devices.flush().await;
        assert!(!registries.areas.save_pending());

        let reloaded = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );
        reloaded.load_all().await.unwrap();
        let device = reloaded.devices.get(&device.id).unwrap();
        assert_eq!(device.area_id.as_deref(), Some(area_id.as_str()));
        assert!(reloaded.areas.get(&area_id).is_some());
    }

    #[tokio::test]
    async fn test_device_save_now_writes_pending_areas() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );

        let device = registries
            .devices
            .get_or_create(
                DeviceInfo::new("entry1")
                    .with_identifier("hue", "lamp1")
                    .with_suggested_area("Hall"),
            )
            .unwrap();
        registries.devices.save().await.unwrap();
        assert!(!registries.areas.save_pending());

        let reloaded = Registries::new(
            temp_dir.path(),
            Arc::new(EventBus::new()),
            DeviceRegistryConfig::default(),
        );
        reloaded.load_all().await.unwrap();
        let area_id = reloaded.devices.get(&device.id).unwrap().area_id.clone().unwrap();
        assert_eq!(reloaded.areas.get(&area_id).unwrap().name, "Hall");
    }
}
