//! Device registry entries and their identifying keys

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Connection kind for network MAC addresses
pub const CONNECTION_NETWORK_MAC: &str = "mac";
/// Connection kind for UPnP UDNs
pub const CONNECTION_UPNP: &str = "upnp";
/// Connection kind for Zigbee IEEE addresses
pub const CONNECTION_ZIGBEE: &str = "zigbee";

/// Device entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEntryType {
    /// A web service or virtual device with no physical hardware
    Service,
}

impl DeviceEntryType {
    /// Parse the stored string form; unknown values yield None
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "service" => Some(DeviceEntryType::Service),
            _ => None,
        }
    }
}

/// What disabled a device entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEntryDisabler {
    ConfigEntry,
    Integration,
    User,
}

/// A device identifier (namespace, id) pair, unique within an integration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }
}

/// A device connection (kind, address) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self(conn_type.into(), id.into())
    }

    /// Create a connection with MAC addresses in canonical form
    pub fn normalized(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(conn_type, id).normalize()
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    pub fn normalize(self) -> Self {
        if self.0 == CONNECTION_NETWORK_MAC {
            let mac = format_mac(&self.1);
            Self(self.0, mac)
        } else {
            self
        }
    }
}

/// Format a MAC address string for storage.
///
/// Accepts colon, dash and dot separated forms as well as 12 bare hex
/// digits, and returns lowercase colon-separated octets. Anything else is
/// returned unchanged. Lengths are counted in characters, not bytes.
pub fn format_mac(mac: &str) -> String {
    let separators = |sep: char| mac.chars().filter(|c| *c == sep).count();
    let length = mac.chars().count();

    if length == 17 && separators(':') == 5 {
        return mac.to_lowercase();
    }

    let stripped = if length == 17 && separators('-') == 5 {
        mac.replace('-', "")
    } else if length == 14 && separators('.') == 2 {
        mac.replace('.', "")
    } else {
        mac.to_string()
    };

    if stripped.chars().count() != 12 {
        return mac.to_string();
    }

    let lower: Vec<char> = stripped.to_lowercase().chars().collect();
    lower
        .chunks(2)
        .take(6)
        .map(|octet| octet.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize every connection in a set
pub fn normalize_connections<'a>(
    connections: impl IntoIterator<Item = &'a DeviceConnection>,
) -> IndexSet<DeviceConnection> {
    connections
        .into_iter()
        .map(|c| c.clone().normalize())
        .collect()
}

/// A registered device entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID, stable across soft-delete and restore
    pub id: String,

    #[serde(default)]
    pub config_entries: IndexSet<String>,

    #[serde(default)]
    pub connections: IndexSet<DeviceConnection>,

    #[serde(default)]
    pub identifiers: IndexSet<DeviceIdentifier>,

    #[serde(default)]
    pub manufacturer: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// User-set name, never overwritten by integrations
    #[serde(default)]
    pub name_by_user: Option<String>,

    #[serde(default)]
    pub sw_version: Option<String>,

    #[serde(default)]
    pub hw_version: Option<String>,

    #[serde(default)]
    pub entry_type: Option<DeviceEntryType>,

    /// Parent device (hub, bridge) this device talks through
    #[serde(default)]
    pub via_device_id: Option<String>,

    #[serde(default)]
    pub area_id: Option<String>,

    #[serde(default)]
    pub disabled_by: Option<DeviceEntryDisabler>,

    #[serde(default)]
    pub configuration_url: Option<String>,

    /// Area hint from the integration. Runtime only, never persisted.
    #[serde(skip)]
    pub suggested_area: Option<String>,

    /// Set until the first update so the first event reads as "create"
    #[serde(skip)]
    pub is_new: bool,
}

impl DeviceEntry {
    /// Create an empty entry with a fresh id
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config_entries: IndexSet::new(),
            connections: IndexSet::new(),
            identifiers: IndexSet::new(),
            manufacturer: None,
            model: None,
            name: None,
            name_by_user: None,
            sw_version: None,
            hw_version: None,
            entry_type: None,
            via_device_id: None,
            area_id: None,
            disabled_by: None,
            configuration_url: None,
            suggested_area: None,
            is_new: false,
        }
    }

    /// Get display name (user name or device name)
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

impl Default for DeviceEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// A soft-deleted device
///
/// Kept so that a device coming back under one of its old identifiers or
/// connections gets its previous id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedDeviceEntry {
    pub id: String,

    /// Config entries at deletion time; emptied once the device is orphaned
    #[serde(default)]
    pub config_entries: IndexSet<String>,

    #[serde(default)]
    pub connections: IndexSet<DeviceConnection>,

    #[serde(default)]
    pub identifiers: IndexSet<DeviceIdentifier>,

    /// Seconds since the Unix epoch at which the last config entry let go
    #[serde(default)]
    pub orphaned_timestamp: Option<f64>,
}

impl DeletedDeviceEntry {
    pub fn from_device(device: &DeviceEntry) -> Self {
        Self {
            id: device.id.clone(),
            config_entries: device.config_entries.clone(),
            connections: device.connections.clone(),
            identifiers: device.identifiers.clone(),
            orphaned_timestamp: None,
        }
    }

    /// Reinstate as a live device owned by `config_entry_id`
    ///
    /// Only the identifiers and connections requested again are kept.
    pub fn to_device_entry(
        &self,
        config_entry_id: &str,
        connections: &IndexSet<DeviceConnection>,
        identifiers: &IndexSet<DeviceIdentifier>,
    ) -> DeviceEntry {
        let mut device = DeviceEntry::with_id(self.id.clone());
        device.config_entries.insert(config_entry_id.to_string());
        device.connections = self.connections.intersection(connections).cloned().collect();
        device.identifiers = self.identifiers.intersection(identifiers).cloned().collect();
        device.is_new = true;
        device
    }

    pub fn orphaned_at(&self) -> Option<DateTime<Utc>> {
        let timestamp = self.orphaned_timestamp?;
        let millis = (timestamp * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis).single()
    }
}

/// Convert a point in time to the persisted float timestamp
pub(crate) fn to_timestamp(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_mac_forms() {
        assert_eq!(format_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_format_mac_leaves_unknown_forms() {
        assert_eq!(format_mac("not-a-mac"), "not-a-mac");
        assert_eq!(format_mac("AA:BB:CC"), "AA:BB:CC");
        assert_eq!(format_mac(""), "");
    }

    #[test]
    fn test_format_mac_counts_characters() {
        assert_eq!(format_mac("ÄA:BB:CC:DD:EE:FF"), "äa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("ÄABBCCDDEEFF"), "äa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("ÄABBCCDDEEF"), "ÄABBCCDDEEF");
    }

    #[test]
    fn test_only_mac_connections_are_normalized() {
        let upnp = DeviceConnection::normalized(CONNECTION_UPNP, "uuid:ABCDEF012345");
        assert_eq!(upnp.id(), "uuid:ABCDEF012345");

        let mac = DeviceConnection::normalized(CONNECTION_NETWORK_MAC, "AABBCCDDEEFF");
        assert_eq!(mac.id(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_restore_keeps_requested_keys_only() {
        let mut device = DeviceEntry::new();
        device.config_entries.insert("old".to_string());
        device.identifiers.insert(DeviceIdentifier::new("hue", "1"));
        device.identifiers.insert(DeviceIdentifier::new("hue", "2"));
        device
            .connections
            .insert(DeviceConnection::new(CONNECTION_NETWORK_MAC, "aa:bb:cc:dd:ee:ff"));
        let deleted = DeletedDeviceEntry::from_device(&device);

        let requested: IndexSet<_> = [
            DeviceIdentifier::new("hue", "1"),
            DeviceIdentifier::new("hue", "3"),
        ]
        .into_iter()
        .collect();
        let restored = deleted.to_device_entry("new", &IndexSet::new(), &requested);

        assert_eq!(restored.id, device.id);
        assert!(restored.is_new);
        assert!(restored.connections.is_empty());
        assert_eq!(
            restored.identifiers.iter().collect::<Vec<_>>(),
            vec![&DeviceIdentifier::new("hue", "1")]
        );
        assert_eq!(
            restored.config_entries.iter().collect::<Vec<_>>(),
            vec!["new"]
        );
    }

    #[test]
    fn test_runtime_fields_are_not_serialized() {
        let mut device = DeviceEntry::new();
        device.suggested_area = Some("Den".to_string());
        device.is_new = true;

        let value = serde_json::to_value(&device).unwrap();
        assert!(value.get("suggested_area").is_none());
        assert!(value.get("is_new").is_none());
        assert_eq!(value["area_id"], json!(null));
    }

    #[test]
    fn test_identifier_serializes_as_pair() {
        let value = serde_json::to_value(DeviceIdentifier::new("zwave", "42")).unwrap();
        assert_eq!(value, json!(["zwave", "42"]));
    }

    #[test]
    fn test_orphaned_timestamp_round_trip() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let deleted = DeletedDeviceEntry {
            id: "x".to_string(),
            config_entries: IndexSet::new(),
            connections: IndexSet::new(),
            identifiers: IndexSet::new(),
            orphaned_timestamp: Some(to_timestamp(now)),
        };
        assert_eq!(deleted.orphaned_at(), Some(now));
    }
}
