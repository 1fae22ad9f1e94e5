//! Typed diff carried by `device_registry_updated` events

use ha_core::events::{RegistryAction, DEVICE_REGISTRY_UPDATED};
use ha_core::EventData;
use indexmap::IndexSet;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::entry::{DeviceConnection, DeviceEntryDisabler, DeviceEntryType, DeviceIdentifier};

/// One changed field together with its value before the change
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    AreaId(Option<String>),
    ConfigEntries(IndexSet<String>),
    ConfigurationUrl(Option<String>),
    Connections(IndexSet<DeviceConnection>),
    DisabledBy(Option<DeviceEntryDisabler>),
    EntryType(Option<DeviceEntryType>),
    HwVersion(Option<String>),
    Identifiers(IndexSet<DeviceIdentifier>),
    Manufacturer(Option<String>),
    Model(Option<String>),
    Name(Option<String>),
    NameByUser(Option<String>),
    SuggestedArea(Option<String>),
    SwVersion(Option<String>),
    ViaDeviceId(Option<String>),
}

impl DeviceChange {
    pub fn field(&self) -> &'static str {
        match self {
            DeviceChange::AreaId(_) => "area_id",
            DeviceChange::ConfigEntries(_) => "config_entries",
            DeviceChange::ConfigurationUrl(_) => "configuration_url",
            DeviceChange::Connections(_) => "connections",
            DeviceChange::DisabledBy(_) => "disabled_by",
            DeviceChange::EntryType(_) => "entry_type",
            DeviceChange::HwVersion(_) => "hw_version",
            DeviceChange::Identifiers(_) => "identifiers",
            DeviceChange::Manufacturer(_) => "manufacturer",
            DeviceChange::Model(_) => "model",
            DeviceChange::Name(_) => "name",
            DeviceChange::NameByUser(_) => "name_by_user",
            DeviceChange::SuggestedArea(_) => "suggested_area",
            DeviceChange::SwVersion(_) => "sw_version",
            DeviceChange::ViaDeviceId(_) => "via_device_id",
        }
    }

    /// Fields that live only in memory: never saved, never announced
    pub fn is_runtime_only(&self) -> bool {
        matches!(self, DeviceChange::SuggestedArea(_))
    }

    fn previous_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            DeviceChange::ConfigEntries(v) => serde_json::to_value(v),
            DeviceChange::Connections(v) => serde_json::to_value(v),
            DeviceChange::Identifiers(v) => serde_json::to_value(v),
            DeviceChange::DisabledBy(v) => serde_json::to_value(v),
            DeviceChange::EntryType(v) => serde_json::to_value(v),
            DeviceChange::AreaId(v)
            | DeviceChange::ConfigurationUrl(v)
            | DeviceChange::HwVersion(v)
            | DeviceChange::Manufacturer(v)
            | DeviceChange::Model(v)
            | DeviceChange::Name(v)
            | DeviceChange::NameByUser(v)
            | DeviceChange::SuggestedArea(v)
            | DeviceChange::SwVersion(v)
            | DeviceChange::ViaDeviceId(v) => serde_json::to_value(v),
        }
    }

    fn from_json(field: &str, previous: serde_json::Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value as parse;
        Ok(match field {
            "area_id" => DeviceChange::AreaId(parse(previous)?),
            "config_entries" => DeviceChange::ConfigEntries(parse(previous)?),
            "configuration_url" => DeviceChange::ConfigurationUrl(parse(previous)?),
            "connections" => DeviceChange::Connections(parse(previous)?),
            "disabled_by" => DeviceChange::DisabledBy(parse(previous)?),
            "entry_type" => DeviceChange::EntryType(parse(previous)?),
            "hw_version" => DeviceChange::HwVersion(parse(previous)?),
            "identifiers" => DeviceChange::Identifiers(parse(previous)?),
            "manufacturer" => DeviceChange::Manufacturer(parse(previous)?),
            "model" => DeviceChange::Model(parse(previous)?),
            "name" => DeviceChange::Name(parse(previous)?),
            "name_by_user" => DeviceChange::NameByUser(parse(previous)?),
            "suggested_area" => DeviceChange::SuggestedArea(parse(previous)?),
            "sw_version" => DeviceChange::SwVersion(parse(previous)?),
            "via_device_id" => DeviceChange::ViaDeviceId(parse(previous)?),
            other => {
                return Err(serde_json::Error::custom(format!(
                    "unknown device field: {other}"
                )))
            }
        })
    }
}

/// Ordered list of field changes, serialized as `{field: previous_value}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceChanges(Vec<DeviceChange>);

impl DeviceChanges {
    pub fn push(&mut self, change: DeviceChange) {
        self.0.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceChange> {
        self.0.iter()
    }

    pub fn get(&self, field: &str) -> Option<&DeviceChange> {
        self.0.iter().find(|change| change.field() == field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.0.iter().map(DeviceChange::field).collect()
    }

    /// True when every change is to a runtime-only field
    pub fn only_runtime(&self) -> bool {
        self.0.iter().all(DeviceChange::is_runtime_only)
    }
}

impl FromIterator<DeviceChange> for DeviceChanges {
    fn from_iter<I: IntoIterator<Item = DeviceChange>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for DeviceChanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for change in &self.0 {
            let previous = change
                .previous_json()
                .map_err(serde::ser::Error::custom)?;
            map.serialize_entry(change.field(), &previous)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeviceChanges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = indexmap::IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(field, previous)| DeviceChange::from_json(&field, previous))
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)
    }
}

/// Data for DEVICE_REGISTRY_UPDATED events
///
/// `changes` is only present for updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryUpdatedData {
    pub action: RegistryAction,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<DeviceChanges>,
}

impl DeviceRegistryUpdatedData {
    pub fn created(device_id: impl Into<String>) -> Self {
        Self {
            action: RegistryAction::Create,
            device_id: device_id.into(),
            changes: None,
        }
    }

    pub fn updated(device_id: impl Into<String>, changes: DeviceChanges) -> Self {
        Self {
            action: RegistryAction::Update,
            device_id: device_id.into(),
            changes: Some(changes),
        }
    }

    pub fn removed(device_id: impl Into<String>) -> Self {
        Self {
            action: RegistryAction::Remove,
            device_id: device_id.into(),
            changes: None,
        }
    }
}

impl EventData for DeviceRegistryUpdatedData {
    fn event_type() -> &'static str {
        DEVICE_REGISTRY_UPDATED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_event_wire_shape() {
        let changes: DeviceChanges = [
            DeviceChange::Manufacturer(None),
            DeviceChange::Identifiers([DeviceIdentifier::new("hue", "1")].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        let data = DeviceRegistryUpdatedData::updated("abc", changes);

        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({
                "action": "update",
                "device_id": "abc",
                "changes": {
                    "manufacturer": null,
                    "identifiers": [["hue", "1"]]
                }
            })
        );
    }

    #[test]
    fn test_create_event_omits_changes() {
        let value = serde_json::to_value(DeviceRegistryUpdatedData::created("abc")).unwrap();
        assert_eq!(value, json!({"action": "create", "device_id": "abc"}));
    }

    #[test]
    fn test_changes_parse_back_into_typed_fields() {
        let data: DeviceRegistryUpdatedData = serde_json::from_value(json!({
            "action": "update",
            "device_id": "abc",
            "changes": {"via_device_id": "parent", "disabled_by": "user"}
        }))
        .unwrap();

        let changes = data.changes.unwrap();
        assert_eq!(
            changes.get("via_device_id"),
            Some(&DeviceChange::ViaDeviceId(Some("parent".to_string())))
        );
        assert_eq!(
            changes.get("disabled_by"),
            Some(&DeviceChange::DisabledBy(Some(DeviceEntryDisabler::User)))
        );
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result: Result<DeviceChanges, _> = serde_json::from_value(json!({"colour": "red"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_only_runtime() {
        let runtime: DeviceChanges = [DeviceChange::SuggestedArea(None)].into_iter().collect();
        assert!(runtime.only_runtime());

        let mixed: DeviceChanges = [DeviceChange::SuggestedArea(None), DeviceChange::Model(None)]
            .into_iter()
            .collect();
        assert!(!mixed.only_runtime());
    }
}
