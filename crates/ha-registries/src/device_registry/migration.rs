//! Upgrades stored device registry data to the current schema

use serde_json::{Map, Value};
use tracing::debug;

use super::entry::DeviceEntryType;
use super::{STORAGE_KEY, STORAGE_VERSION};
use crate::storage::{StorageError, StorageResult};

/// Bring `data` written at `major.minor` up to the current schema
pub fn migrate(mut data: Value, major: u32, minor: u32) -> StorageResult<Value> {
    if major > STORAGE_VERSION {
        return Err(StorageError::UnsupportedVersion {
            key: STORAGE_KEY.to_string(),
            found: major,
            supported: STORAGE_VERSION,
        });
    }

    if minor < 2 {
        debug!("Migrating device registry from 1.{}", minor);
        for device in objects_mut(&mut data, "devices") {
            let entry_type = device
                .get("entry_type")
                .and_then(Value::as_str)
                .and_then(DeviceEntryType::parse);
            device.insert("entry_type".to_string(), serde_json::to_value(entry_type)?);

            let via_device_id = non_null(device.get("via_device_id"))
                .or_else(|| non_null(device.get("hub_device_id")))
                .unwrap_or(Value::Null);
            device.insert("via_device_id".to_string(), via_device_id);
            device.remove("hub_device_id");

            for field in ["area_id", "name_by_user", "disabled_by", "configuration_url"] {
                backfill(device, field);
            }
        }

        if let Some(root) = data.as_object_mut() {
            root.entry("deleted_devices")
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        for deleted in objects_mut(&mut data, "deleted_devices") {
            backfill(deleted, "orphaned_timestamp");
        }
    }

    if minor < 3 {
        for device in objects_mut(&mut data, "devices") {
            backfill(device, "hw_version");
        }
    }

    Ok(data)
}

fn objects_mut<'a>(data: &'a mut Value, list: &str) -> impl Iterator<Item = &'a mut Map<String, Value>> {
    data.get_mut(list)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn backfill(object: &mut Map<String, Value>, field: &str) {
    object.entry(field).or_insert(Value::Null);
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| !value.is_null()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrate_from_1_1() {
        let data = json!({
            "devices": [{
                "id": "abc",
                "config_entries": ["entry"],
                "connections": [],
                "identifiers": [["hue", "1"]],
                "manufacturer": "Signify",
                "model": "Bridge",
                "name": "Hue",
                "sw_version": "1.0",
                "entry_type": "bogus",
                "hub_device_id": "parent"
            }]
        });

        let migrated = migrate(data, 1, 1).unwrap();
        let device = &migrated["devices"][0];
        assert_eq!(device["entry_type"], Value::Null);
        assert_eq!(device["via_device_id"], json!("parent"));
        assert!(device.get("hub_device_id").is_none());
        assert_eq!(device["area_id"], Value::Null);
        assert_eq!(device["hw_version"], Value::Null);
        assert_eq!(migrated["deleted_devices"], json!([]));
    }

    #[test]
    fn test_migrate_keeps_known_entry_type_and_via_device() {
        let data = json!({
            "devices": [{
                "id": "abc",
                "entry_type": "service",
                "via_device_id": "hub",
                "hub_device_id": "ignored"
            }],
            "deleted_devices": [{"id": "gone", "identifiers": [], "connections": [], "config_entries": []}]
        });

        let migrated = migrate(data, 1, 1).unwrap();
        assert_eq!(migrated["devices"][0]["entry_type"], json!("service"));
        assert_eq!(migrated["devices"][0]["via_device_id"], json!("hub"));
        assert_eq!(
            migrated["deleted_devices"][0]["orphaned_timestamp"],
            Value::Null
        );
    }

    #[test]
    fn test_migrate_from_1_2_only_backfills_hw_version() {
        let data = json!({
            "devices": [{"id": "abc", "entry_type": "bogus"}],
            "deleted_devices": []
        });

        let migrated = migrate(data, 1, 2).unwrap();
        assert_eq!(migrated["devices"][0]["hw_version"], Value::Null);
        assert_eq!(migrated["devices"][0]["entry_type"], json!("bogus"));
    }

    #[test]
    fn test_newer_major_version_is_rejected() {
        let result = migrate(json!({"devices": []}), 2, 0);
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedVersion { found: 2, .. })
        ));
    }
}
