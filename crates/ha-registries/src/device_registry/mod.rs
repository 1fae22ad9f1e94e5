//! Device Registry
//!
//! Tracks physical and logical devices across integrations. A device is
//! found again through any of its identifiers or connections, so several
//! config entries can share one device and a device that comes back after
//! removal keeps its old id.
//!
//! Every mutation takes the state lock once, collects the events it causes
//! and fires them after the lock is released, then schedules a debounced
//! save.

mod changes;
mod entry;
mod index;
mod migration;

pub use changes::{DeviceChange, DeviceChanges, DeviceRegistryUpdatedData};
pub use entry::{
    format_mac, normalize_connections, DeletedDeviceEntry, DeviceConnection, DeviceEntry,
    DeviceEntryDisabler, DeviceEntryType, DeviceIdentifier, CONNECTION_NETWORK_MAC,
    CONNECTION_UPNP, CONNECTION_ZIGBEE,
};

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use ha_core::Context;
use ha_event_bus::SharedEventBus;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::area_registry::AreaRegistry;
use crate::config::DeviceRegistryConfig;
use crate::debounce::Debouncer;
use crate::references::{ConfigEntryInfo, ConfigEntryLookup};
use crate::storage::{load_with_migration, Storable, Storage, StorageResult};
use entry::to_timestamp;
use index::DeviceIndex;

/// Storage key for device registry
pub const STORAGE_KEY: &str = "core.device_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 3;

/// Device registry errors
#[derive(Debug, Error)]
pub enum DeviceRegistryError {
    #[error("Required parameter missing: one of {}", .parameters.join(", "))]
    RequiredParameterMissing { parameters: Vec<&'static str> },

    #[error("merge_identifiers and new_identifiers cannot be used in the same update")]
    ConflictingIdentifierUpdate,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

/// Result type for device registry operations
pub type DeviceRegistryResult<T> = Result<T, DeviceRegistryError>;

/// Device registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub deleted_devices: Vec<DeletedDeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// What an integration knows about a device when registering it
///
/// `manufacturer`, `model` and `name` always win. The `default_*` variants
/// only fill a field that is still unset on the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub config_entry_id: String,
    pub identifiers: IndexSet<DeviceIdentifier>,
    pub connections: IndexSet<DeviceConnection>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub name: Option<String>,
    pub default_manufacturer: Option<String>,
    pub default_model: Option<String>,
    pub default_name: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub configuration_url: Option<String>,
    pub entry_type: Option<DeviceEntryType>,
    /// Applied through a normal update, so it also disables existing devices
    pub disabled_by: Option<DeviceEntryDisabler>,
    pub suggested_area: Option<String>,
    /// Identifier of the parent device; ignored if the parent is unknown
    pub via_device: Option<DeviceIdentifier>,
}

impl DeviceInfo {
    pub fn new(config_entry_id: impl Into<String>) -> Self {
        Self {
            config_entry_id: config_entry_id.into(),
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.identifiers.insert(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_connection(mut self, conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.connections.insert(DeviceConnection::new(conn_type, id));
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = Some(name.into());
        self
    }

    pub fn with_default_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.default_manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_sw_version(mut self, sw_version: impl Into<String>) -> Self {
        self.sw_version = Some(sw_version.into());
        self
    }

    pub fn with_suggested_area(mut self, area: impl Into<String>) -> Self {
        self.suggested_area = Some(area.into());
        self
    }

    pub fn with_via_device(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.via_device = Some(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_entry_type(mut self, entry_type: DeviceEntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }
}

/// Changes to apply to a device
///
/// For the scalar fields `None` leaves the field alone and `Some(None)`
/// clears it.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub add_config_entry_id: Option<String>,
    pub remove_config_entry_id: Option<String>,
    pub area_id: Option<Option<String>>,
    pub configuration_url: Option<Option<String>>,
    pub disabled_by: Option<Option<DeviceEntryDisabler>>,
    pub entry_type: Option<Option<DeviceEntryType>>,
    pub manufacturer: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub name: Option<Option<String>>,
    pub name_by_user: Option<Option<String>>,
    pub sw_version: Option<Option<String>>,
    pub hw_version: Option<Option<String>>,
    pub suggested_area: Option<Option<String>>,
    pub via_device_id: Option<Option<String>>,
    /// Added to the current connections
    pub merge_connections: Option<IndexSet<DeviceConnection>>,
    /// Added to the current identifiers
    pub merge_identifiers: Option<IndexSet<DeviceIdentifier>>,
    /// Replaces the current identifiers
    pub new_identifiers: Option<IndexSet<DeviceIdentifier>>,
}

/// In-memory registry contents, guarded by one lock
#[derive(Debug, Default)]
struct DeviceRegistryState {
    devices: IndexMap<String, Arc<DeviceEntry>>,
    deleted_devices: IndexMap<String, Arc<DeletedDeviceEntry>>,
    registered_index: DeviceIndex,
    deleted_index: DeviceIndex,
}

impl DeviceRegistryState {
    fn insert_device(&mut self, device: Arc<DeviceEntry>) {
        self.registered_index.add(device.as_ref());
        self.devices.insert(device.id.clone(), device);
    }

    fn replace_device(&mut self, old: &DeviceEntry, new: Arc<DeviceEntry>) {
        self.registered_index.remove(old);
        self.insert_device(new);
    }

    fn take_device(&mut self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let device = self.devices.shift_remove(device_id)?;
        self.registered_index.remove(device.as_ref());
        Some(device)
    }

    fn insert_deleted(&mut self, deleted: Arc<DeletedDeviceEntry>) {
        self.deleted_index.add(deleted.as_ref());
        self.deleted_devices.insert(deleted.id.clone(), deleted);
    }

    fn take_deleted(&mut self, device_id: &str) -> Option<Arc<DeletedDeviceEntry>> {
        let deleted = self.deleted_devices.shift_remove(device_id)?;
        self.deleted_index.remove(deleted.as_ref());
        Some(deleted)
    }

    fn rebuild_index(&mut self) {
        self.registered_index
            .rebuild(self.devices.values().map(Arc::as_ref));
        self.deleted_index
            .rebuild(self.deleted_devices.values().map(Arc::as_ref));
        debug!(
            "Rebuilt device index ({} devices, {} deleted)",
            self.devices.len(),
            self.deleted_devices.len()
        );
    }

    fn to_data(&self) -> DeviceRegistryData {
        DeviceRegistryData {
            devices: self.devices.values().map(|d| (**d).clone()).collect(),
            deleted_devices: self
                .deleted_devices
                .values()
                .map(|d| (**d).clone())
                .collect(),
        }
    }
}

/// Side effects collected while the state lock is held
#[derive(Debug, Default)]
struct Outcome {
    events: Vec<DeviceRegistryUpdatedData>,
    save: bool,
}

/// Device Registry
pub struct DeviceRegistry {
    state: Arc<RwLock<DeviceRegistryState>>,
    storage: Arc<Storage>,
    bus: SharedEventBus,
    areas: Arc<AreaRegistry>,
    saver: Debouncer,
    config: DeviceRegistryConfig,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>, bus: SharedEventBus, areas: Arc<AreaRegistry>) -> Self {
        Self::with_config(storage, bus, areas, DeviceRegistryConfig::default())
    }

    pub fn with_config(
        storage: Arc<Storage>,
        bus: SharedEventBus,
        areas: Arc<AreaRegistry>,
        config: DeviceRegistryConfig,
    ) -> Self {
        let state = Arc::new(RwLock::new(DeviceRegistryState::default()));

        // Areas go first so a saved area_id never points at an unsaved area
        let saver = {
            let state = Arc::clone(&state);
            let storage = Arc::clone(&storage);
            let areas = Arc::clone(&areas);
            Debouncer::new("device_registry_save", config.save_delay(), move || {
                let state = Arc::clone(&state);
                let storage = Arc::clone(&storage);
                let areas = Arc::clone(&areas);
                async move {
                    areas.flush().await;
                    if let Err(err) = write_state(&storage, &state).await {
                        error!("Failed to save device registry: {}", err);
                    }
                }
            })
        };

        Self {
            state,
            storage,
            bus,
            areas,
            saver,
            config,
        }
    }

    pub fn config(&self) -> &DeviceRegistryConfig {
        &self.config
    }

    /// Load from storage, migrating older data
    pub async fn load(&self) -> StorageResult<()> {
        let data = load_with_migration::<DeviceRegistryData>(
            &self.storage,
            Some(migration::migrate),
        )
        .await?
        .unwrap_or_default();

        info!(
            "Loading {} devices and {} deleted devices from storage",
            data.devices.len(),
            data.deleted_devices.len()
        );

        let mut state = self.write();
        state.devices = data
            .devices
            .into_iter()
            .map(|device| (device.id.clone(), Arc::new(device)))
            .collect();
        state.deleted_devices = data
            .deleted_devices
            .into_iter()
            .map(|deleted| (deleted.id.clone(), Arc::new(deleted)))
            .collect();
        state.rebuild_index();
        Ok(())
    }

    /// Save to storage now, cancelling any scheduled save
    pub async fn save(&self) -> StorageResult<()> {
        if self.areas.save_pending() {
            self.areas.save().await?;
        }
        self.saver.cancel();
        write_state(&self.storage, &self.state).await
    }

    /// Schedule a debounced save
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

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.read().devices.get(device_id).cloned()
    }

    /// Find a live device by any identifier, then by any connection
    pub fn get_device(
        &self,
        identifiers: &[DeviceIdentifier],
        connections: &[DeviceConnection],
    ) -> Option<Arc<DeviceEntry>> {
        let state = self.read();
        let device_id = state.registered_index.lookup(identifiers, connections)?;
        let device = state.devices.get(device_id).cloned();
        debug!("Device lookup resolved to {}", device_id);
        device
    }

    pub fn get_deleted(&self, device_id: &str) -> Option<Arc<DeletedDeviceEntry>> {
        self.read().deleted_devices.get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.read().devices.values().cloned().collect()
    }

    pub fn deleted_devices(&self) -> Vec<Arc<DeletedDeviceEntry>> {
        self.read().deleted_devices.values().cloned().collect()
    }

    pub fn entries_for_area(&self, area_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.read()
            .devices
            .values()
            .filter(|device| device.area_id.as_deref() == Some(area_id))
            .cloned()
            .collect()
    }

    pub fn entries_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.read()
            .devices
            .values()
            .filter(|device| device.config_entries.contains(config_entry_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().devices.is_empty()
    }

    /// Get a device, registering or restoring it first if needed
    pub fn get_or_create(&self, info: DeviceInfo) -> DeviceRegistryResult<Arc<DeviceEntry>> {
        if info.identifiers.is_empty() && info.connections.is_empty() {
            return Err(DeviceRegistryError::RequiredParameterMissing {
                parameters: vec!["identifiers", "connections"],
            });
        }

        let connections = normalize_connections(&info.connections);
        let mut outcome = Outcome::default();

        let result = {
            let mut state = self.write();

            let existing = state
                .registered_index
                .lookup(&info.identifiers, &connections)
                .map(str::to_string);

            let device_id = match existing {
                Some(device_id) => {
                    debug!("Found existing device: {}", device_id);
                    device_id
                }
                None => {
                    let deleted_id = state
                        .deleted_index
                        .lookup(&info.identifiers, &connections)
                        .map(str::to_string);
                    let restored = deleted_id.and_then(|id| state.take_deleted(&id));

                    let device = match restored {
                        Some(deleted) => {
                            info!("Restoring deleted device: {}", deleted.id);
                            deleted.to_device_entry(
                                &info.config_entry_id,
                                &connections,
                                &info.identifiers,
                            )
                        }
                        None => {
                            let mut device = DeviceEntry::new();
                            device.is_new = true;
                            info!(
                                "Registered new device: {:?} ({})",
                                info.name.as_deref().or(info.default_name.as_deref()),
                                device.id
                            );
                            device
                        }
                    };

                    let device_id = device.id.clone();
                    state.insert_device(Arc::new(device));
                    device_id
                }
            };

            let current = state
                .devices
                .get(&device_id)
                .cloned()
                .ok_or_else(|| DeviceRegistryError::UnknownDevice(device_id.clone()))?;

            let via_device_id = info.via_device.as_ref().and_then(|via| {
                state
                    .registered_index
                    .lookup(std::iter::once(via), std::iter::empty())
                    .map(|id| Some(id.to_string()))
            });

            let update = DeviceUpdate {
                add_config_entry_id: Some(info.config_entry_id),
                configuration_url: info.configuration_url.map(Some),
                disabled_by: info.disabled_by.map(Some),
                entry_type: info.entry_type.map(Some),
                manufacturer: explicit_or_default(
                    info.manufacturer,
                    info.default_manufacturer,
                    &current.manufacturer,
                ),
                model: explicit_or_default(info.model, info.default_model, &current.model),
                name: explicit_or_default(info.name, info.default_name, &current.name),
                sw_version: info.sw_version.map(Some),
                hw_version: info.hw_version.map(Some),
                suggested_area: info.suggested_area.map(Some),
                via_device_id,
                merge_connections: (!connections.is_empty()).then_some(connections),
                merge_identifiers: (!info.identifiers.is_empty()).then_some(info.identifiers),
                ..Default::default()
            };

            self.apply_update(&mut state, &device_id, update, &mut outcome)
                .and_then(|device| {
                    device.ok_or(DeviceRegistryError::UnknownDevice(device_id))
                })
        };

        self.finish(outcome);
        result
    }

    /// Update a device
    ///
    /// Returns `Ok(None)` when removing the last config entry removed the
    /// device itself.
    pub fn update_device(
        &self,
        device_id: &str,
        update: DeviceUpdate,
    ) -> DeviceRegistryResult<Option<Arc<DeviceEntry>>> {
        let mut outcome = Outcome::default();
        let result = {
            let mut state = self.write();
            self.apply_update(&mut state, device_id, update, &mut outcome)
        };
        self.finish(outcome);
        result
    }

    /// Soft-delete a device, keeping its id for a later restore
    pub fn remove_device(&self, device_id: &str) -> DeviceRegistryResult<()> {
        let mut outcome = Outcome::default();
        let result = {
            let mut state = self.write();
            self.apply_remove(&mut state, device_id, &mut outcome)
        };
        self.finish(outcome);
        result
    }

    /// Detach a config entry from every device
    pub fn clear_config_entry(&self, config_entry_id: &str) {
        self.clear_config_entry_at(config_entry_id, Utc::now());
    }

    pub fn clear_config_entry_at(&self, config_entry_id: &str, now: DateTime<Utc>) {
        let mut outcome = Outcome::default();
        {
            let mut state = self.write();

            let device_ids: Vec<String> = state.devices.keys().cloned().collect();
            for device_id in device_ids {
                if !state.devices.contains_key(&device_id) {
                    continue;
                }
                let update = DeviceUpdate {
                    remove_config_entry_id: Some(config_entry_id.to_string()),
                    ..Default::default()
                };
                if let Err(err) = self.apply_update(&mut state, &device_id, update, &mut outcome) {
                    warn!(
                        "Failed to clear config entry {} from device {}: {}",
                        config_entry_id, device_id, err
                    );
                }
            }

            let timestamp = to_timestamp(now);
            for deleted in state.deleted_devices.values_mut() {
                if !deleted.config_entries.contains(config_entry_id) {
                    continue;
                }
                let deleted = Arc::make_mut(deleted);
                if deleted.config_entries.len() == 1 {
                    deleted.config_entries.clear();
                    deleted.orphaned_timestamp = Some(timestamp);
                    debug!("Deleted device {} is now orphaned", deleted.id);
                } else {
                    deleted.config_entries.shift_remove(config_entry_id);
                }
                outcome.save = true;
            }
        }
        self.finish(outcome);
    }

    /// Drop orphaned deleted devices past the retention window
    pub fn purge_expired_orphaned_devices(&self) {
        self.purge_expired_orphaned_devices_at(Utc::now());
    }

    pub fn purge_expired_orphaned_devices_at(&self, now: DateTime<Utc>) {
        let keep = self.config.orphaned_device_keep();
        let purged = {
            let mut state = self.write();
            let expired: Vec<String> = state
                .deleted_devices
                .values()
                .filter(|deleted| {
                    deleted
                        .orphaned_at()
                        .and_then(|orphaned_at| orphaned_at.checked_add_signed(keep))
                        .is_some_and(|expires_at| expires_at < now)
                })
                .map(|deleted| deleted.id.clone())
                .collect();

            for device_id in &expired {
                state.take_deleted(device_id);
            }
            expired.len()
        };

        if purged > 0 {
            info!("Purged {} expired orphaned devices", purged);
            self.schedule_save();
        }
    }

    /// Unassign an area from every device in it
    pub fn clear_area_id(&self, area_id: &str) {
        for device in self.entries_for_area(area_id) {
            let update = DeviceUpdate {
                area_id: Some(None),
                ..Default::default()
            };
            if let Err(err) = self.update_device(&device.id, update) {
                warn!("Failed to clear area {} from device {}: {}", area_id, device.id, err);
            }
        }
    }

    /// Follow a config entry being disabled or enabled
    ///
    /// Devices are only disabled when none of their other config entries is
    /// still enabled, and only re-enabled if the config entry disabled them.
    pub fn config_entry_disabled_by_changed(
        &self,
        config_entry: &ConfigEntryInfo,
        config_entries: &dyn ConfigEntryLookup,
    ) -> DeviceRegistryResult<()> {
        let devices = self.entries_for_config_entry(&config_entry.entry_id);

        if config_entry.disabled_by.is_none() {
            for device in devices {
                if device.disabled_by != Some(DeviceEntryDisabler::ConfigEntry) {
                    continue;
                }
                self.update_device(
                    &device.id,
                    DeviceUpdate {
                        disabled_by: Some(None),
                        ..Default::default()
                    },
                )?;
            }
            return Ok(());
        }

        let enabled: HashSet<String> = config_entries
            .config_entries()
            .into_iter()
            .filter(|entry| entry.disabled_by.is_none())
            .map(|entry| entry.entry_id)
            .collect();

        for device in devices {
            if device.is_disabled() {
                continue;
            }
            if device.config_entries.len() > 1
                && device.config_entries.iter().any(|id| enabled.contains(id))
            {
                continue;
            }
            self.update_device(
                &device.id,
                DeviceUpdate {
                    disabled_by: Some(Some(DeviceEntryDisabler::ConfigEntry)),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    fn apply_update(
        &self,
        state: &mut DeviceRegistryState,
        device_id: &str,
        update: DeviceUpdate,
        outcome: &mut Outcome,
    ) -> DeviceRegistryResult<Option<Arc<DeviceEntry>>> {
        if update.merge_identifiers.is_some() && update.new_identifiers.is_some() {
            return Err(DeviceRegistryError::ConflictingIdentifierUpdate);
        }

        let old = state
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceRegistryError::UnknownDevice(device_id.to_string()))?;

        let mut area_id = update.area_id;
        if let Some(Some(suggested)) = &update.suggested_area {
            if !suggested.is_empty() && area_id.is_none() && old.area_id.is_none() {
                area_id = Some(Some(self.areas.get_or_create(suggested).id.clone()));
            }
        }

        let mut config_entries = old.config_entries.clone();
        if let Some(added) = update.add_config_entry_id {
            config_entries.insert(added);
        }
        if let Some(removed) = &update.remove_config_entry_id {
            if config_entries.contains(removed) {
                if config_entries.len() == 1 {
                    self.apply_remove(state, device_id, outcome)?;
                    return Ok(None);
                }
                config_entries.shift_remove(removed);
            }
        }

        let mut new = (*old).clone();
        let mut changes = DeviceChanges::default();

        if config_entries != old.config_entries {
            changes.push(DeviceChange::ConfigEntries(old.config_entries.clone()));
            new.config_entries = config_entries;
        }

        if let Some(merge) = update.merge_connections {
            let merge = normalize_connections(&merge);
            if !merge.is_subset(&old.connections) {
                changes.push(DeviceChange::Connections(old.connections.clone()));
                new.connections.extend(merge);
            }
        }

        if let Some(merge) = update.merge_identifiers {
            if !merge.is_subset(&old.identifiers) {
                changes.push(DeviceChange::Identifiers(old.identifiers.clone()));
                new.identifiers.extend(merge);
            }
        }

        if let Some(identifiers) = update.new_identifiers {
            if identifiers != old.identifiers {
                changes.push(DeviceChange::Identifiers(old.identifiers.clone()));
                new.identifiers = identifiers;
            }
        }

        macro_rules! set {
            ($field:ident, $value:expr, $change:ident) => {
                set_field(&mut new.$field, $value, &mut changes, DeviceChange::$change)
            };
        }
        set!(configuration_url, update.configuration_url, ConfigurationUrl);
        set!(disabled_by, update.disabled_by, DisabledBy);
        set!(entry_type, update.entry_type, EntryType);
        set!(manufacturer, update.manufacturer, Manufacturer);
        set!(model, update.model, Model);
        set!(name, update.name, Name);
        set!(name_by_user, update.name_by_user, NameByUser);
        set!(area_id, area_id, AreaId);
        set!(suggested_area, update.suggested_area, SuggestedArea);
        set!(sw_version, update.sw_version, SwVersion);
        set!(hw_version, update.hw_version, HwVersion);
        set!(via_device_id, update.via_device_id, ViaDeviceId);

        let was_new = old.is_new;
        if changes.is_empty() && !was_new {
            return Ok(Some(old));
        }

        new.is_new = false;
        let new = Arc::new(new);
        state.replace_device(&old, Arc::clone(&new));

        // suggested_area alone never reaches storage or listeners
        if !was_new && changes.only_runtime() {
            return Ok(Some(new));
        }

        outcome.save = true;
        outcome.events.push(if was_new {
            DeviceRegistryUpdatedData::created(new.id.clone())
        } else {
            debug!("Updated device {}: {:?}", new.id, changes.fields());
            DeviceRegistryUpdatedData::updated(new.id.clone(), changes)
        });

        Ok(Some(new))
    }

    fn apply_remove(
        &self,
        state: &mut DeviceRegistryState,
        device_id: &str,
        outcome: &mut Outcome,
    ) -> DeviceRegistryResult<()> {
        let device = state
            .take_device(device_id)
            .ok_or_else(|| DeviceRegistryError::UnknownDevice(device_id.to_string()))?;
        state.insert_deleted(Arc::new(DeletedDeviceEntry::from_device(&device)));

        let children: Vec<String> = state
            .devices
            .values()
            .filter(|other| other.via_device_id.as_deref() == Some(device_id))
            .map(|other| other.id.clone())
            .collect();
        for child_id in children {
            let update = DeviceUpdate {
                via_device_id: Some(None),
                ..Default::default()
            };
            self.apply_update(state, &child_id, update, outcome)?;
        }

        info!("Removed device: {}", device_id);
        outcome
            .events
            .push(DeviceRegistryUpdatedData::removed(device_id));
        outcome.save = true;
        Ok(())
    }

    fn finish(&self, outcome: Outcome) {
        for data in outcome.events {
            self.bus.fire_typed(data, Context::new());
        }
        if outcome.save {
            self.schedule_save();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DeviceRegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceRegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .field("saver", &self.saver)
            .finish()
    }
}

async fn write_state(
    storage: &Storage,
    state: &RwLock<DeviceRegistryState>,
) -> StorageResult<()> {
    let data = {
        let state = state.read().unwrap_or_else(PoisonError::into_inner);
        state.to_data()
    };
    storage.save(&data.to_storage_file()).await?;
    debug!(
        "Saved {} devices and {} deleted devices to storage",
        data.devices.len(),
        data.deleted_devices.len()
    );
    Ok(())
}

fn set_field<T: PartialEq>(
    field: &mut T,
    value: Option<T>,
    changes: &mut DeviceChanges,
    change: fn(T) -> DeviceChange,
) {
    if let Some(value) = value {
        if *field != value {
            let previous = std::mem::replace(field, value);
            changes.push(change(previous));
        }
    }
}

fn explicit_or_default(
    explicit: Option<String>,
    default: Option<String>,
    current: &Option<String>,
) -> Option<Option<String>> {
    match explicit {
        Some(value) => Some(Some(value)),
        None if current.is_none() => default.map(Some),
        None => None,
    }
}
