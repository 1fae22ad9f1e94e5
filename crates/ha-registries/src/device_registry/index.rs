//! Identity index: identifier / connection -> device id

use std::collections::HashMap;

use indexmap::IndexSet;

use super::entry::{DeletedDeviceEntry, DeviceConnection, DeviceEntry, DeviceIdentifier};

/// Anything carrying a device id plus its identifying keys
pub(crate) trait Indexed {
    fn id(&self) -> &str;
    fn identifiers(&self) -> &IndexSet<DeviceIdentifier>;
    fn connections(&self) -> &IndexSet<DeviceConnection>;
}

impl Indexed for DeviceEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn identifiers(&self) -> &IndexSet<DeviceIdentifier> {
        &self.identifiers
    }

    fn connections(&self) -> &IndexSet<DeviceConnection> {
        &self.connections
    }
}

impl Indexed for DeletedDeviceEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn identifiers(&self) -> &IndexSet<DeviceIdentifier> {
        &self.identifiers
    }

    fn connections(&self) -> &IndexSet<DeviceConnection> {
        &self.connections
    }
}

/// Lookup tables for one device collection
///
/// Connections are stored already normalized; only lookups normalize.
#[derive(Debug, Default)]
pub(crate) struct DeviceIndex {
    identifiers: HashMap<DeviceIdentifier, String>,
    connections: HashMap<DeviceConnection, String>,
}

impl DeviceIndex {
    pub fn add(&mut self, device: &impl Indexed) {
        for identifier in device.identifiers() {
            self.identifiers
                .insert(identifier.clone(), device.id().to_string());
        }
        for connection in device.connections() {
            self.connections
                .insert(connection.clone(), device.id().to_string());
        }
    }

    pub fn remove(&mut self, device: &impl Indexed) {
        for identifier in device.identifiers() {
            if self.identifiers.get(identifier).map(String::as_str) == Some(device.id()) {
                self.identifiers.remove(identifier);
            }
        }
        for connection in device.connections() {
            if self.connections.get(connection).map(String::as_str) == Some(device.id()) {
                self.connections.remove(connection);
            }
        }
    }

    /// Resolve a device id, trying every identifier before any connection
    pub fn lookup<'a>(
        &self,
        identifiers: impl IntoIterator<Item = &'a DeviceIdentifier>,
        connections: impl IntoIterator<Item = &'a DeviceConnection>,
    ) -> Option<&str> {
        for identifier in identifiers {
            if let Some(device_id) = self.identifiers.get(identifier) {
                return Some(device_id);
            }
        }
        for connection in connections {
            let normalized = connection.clone().normalize();
            if let Some(device_id) = self.connections.get(&normalized) {
                return Some(device_id);
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.identifiers.clear();
        self.connections.clear();
    }

    /// Rebuild from scratch after a bulk load
    pub fn rebuild<'a, D: Indexed + 'a>(&mut self, devices: impl IntoIterator<Item = &'a D>) {
        self.clear();
        for device in devices {
            self.add(device);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.identifiers.len() + self.connections.len()
    }
}
