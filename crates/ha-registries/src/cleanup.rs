//! Device registry cleanup
//!
//! Removes devices that neither a config entry nor an entity refers to any
//! more, and purges expired orphaned devices. Runs once Home Assistant has
//! started and again after entity registry changes that can drop a device
//! reference, debounced so a burst of changes causes a single pass.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ha_core::events::{EntityRegistryUpdatedData, HOMEASSISTANT_STARTED};
use ha_core::Event;
use ha_event_bus::{SharedEventBus, TypedEventReceiver};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::debounce::Debouncer;
use crate::device_registry::{DeviceRegistry, DeviceUpdate};
use crate::references::{ConfigEntryLookup, EntityDeviceLookup};

/// Run one cleanup pass
pub fn cleanup(
    devices: &DeviceRegistry,
    config_entries: &dyn ConfigEntryLookup,
    entities: &dyn EntityDeviceLookup,
) {
    cleanup_at(devices, config_entries, entities, Utc::now());
}

pub fn cleanup_at(
    devices: &DeviceRegistry,
    config_entries: &dyn ConfigEntryLookup,
    entities: &dyn EntityDeviceLookup,
    now: DateTime<Utc>,
) {
    let config_entry_ids: HashSet<String> = config_entries
        .config_entries()
        .into_iter()
        .map(|entry| entry.entry_id)
        .collect();
    let referenced_by_entities = entities.referenced_device_ids();

    let orphans: Vec<String> = devices
        .devices()
        .iter()
        .filter(|device| {
            !referenced_by_entities.contains(&device.id)
                && !device
                    .config_entries
                    .iter()
                    .any(|entry_id| config_entry_ids.contains(entry_id))
        })
        .map(|device| device.id.clone())
        .collect();

    if !orphans.is_empty() {
        info!("Removing {} unreferenced devices", orphans.len());
    }
    for device_id in &orphans {
        if let Err(err) = devices.remove_device(device_id) {
            warn!("Failed to remove unreferenced device {}: {}", device_id, err);
        }
    }

    // Devices can still point at config entries that no longer exist
    for device in devices.devices() {
        for entry_id in device.config_entries.iter() {
            if config_entry_ids.contains(entry_id) {
                continue;
            }
            debug!(
                "Clearing missing config entry {} from device {}",
                entry_id, device.id
            );
            let update = DeviceUpdate {
                remove_config_entry_id: Some(entry_id.clone()),
                ..Default::default()
            };
            match devices.update_device(&device.id, update) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!("Failed to clear config entry from {}: {}", device.id, err);
                    break;
                }
            }
        }
    }

    devices.purge_expired_orphaned_devices_at(now);
}

/// Background cleanup installed by [`setup_cleanup`]
///
/// Dropping the handle stops listening for entity registry changes.
#[derive(Debug)]
pub struct CleanupHandle {
    debouncer: Arc<Debouncer>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Schedule a cleanup pass after the quiet period
    pub fn schedule(&self) {
        self.debouncer.call();
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Run a scheduled cleanup pass now
    pub async fn flush(&self) {
        self.debouncer.flush().await;
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.debouncer.cancel();
    }
}

enum Trigger {
    /// Waiting for `homeassistant_started`
    AfterStart(broadcast::Receiver<Event<serde_json::Value>>),
    Listening(TypedEventReceiver<EntityRegistryUpdatedData>),
}

/// Install the cleanup scheduler
///
/// When Home Assistant is already running one pass runs right away;
/// otherwise the first pass is scheduled once `homeassistant_started` fires.
/// Must be called from within a tokio runtime.
pub fn setup_cleanup(
    devices: Arc<DeviceRegistry>,
    bus: SharedEventBus,
    config_entries: Arc<dyn ConfigEntryLookup>,
    entities: Arc<dyn EntityDeviceLookup>,
    is_running: bool,
) -> CleanupHandle {
    let cooldown = devices.config().cleanup_delay();
    let debouncer = Arc::new(Debouncer::new("device_registry_cleanup", cooldown, {
        let devices = Arc::clone(&devices);
        let config_entries = Arc::clone(&config_entries);
        let entities = Arc::clone(&entities);
        move || {
            let devices = Arc::clone(&devices);
            let config_entries = Arc::clone(&config_entries);
            let entities = Arc::clone(&entities);
            async move {
                cleanup(&devices, config_entries.as_ref(), entities.as_ref());
            }
        }
    }));

    let trigger = if is_running {
        let events = bus.subscribe_typed::<EntityRegistryUpdatedData>();
        cleanup(&devices, config_entries.as_ref(), entities.as_ref());
        Trigger::Listening(events)
    } else {
        Trigger::AfterStart(bus.subscribe(HOMEASSISTANT_STARTED))
    };

    let task = tokio::spawn(listen(bus, Arc::clone(&debouncer), trigger));
    CleanupHandle { debouncer, task }
}

async fn listen(bus: SharedEventBus, debouncer: Arc<Debouncer>, trigger: Trigger) {
    let mut events = match trigger {
        Trigger::Listening(events) => events,
        Trigger::AfterStart(mut started) => {
            match started.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
            let events = bus.subscribe_typed::<EntityRegistryUpdatedData>();
            debug!("Scheduling startup device cleanup");
            debouncer.call();
            events
        }
    };

    loop {
        match events.recv().await {
            Ok(event) if event.data.affects_device_references() => debouncer.call(),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed entity registry events, scheduling cleanup");
                debouncer.call();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
