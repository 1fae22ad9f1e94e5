//! Registry tuning knobs
//!
//! Every field has a default, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before a scheduled registry save is written
pub const SAVE_DELAY_SECS: u64 = 10;

/// Quiet period before a device cleanup pass runs
pub const CLEANUP_DELAY_SECS: u64 = 10;

/// How long an orphaned deleted device is kept before it is purged
pub const ORPHANED_DEVICE_KEEP_SECS: u64 = 86_400 * 30;

/// Device registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRegistryConfig {
    pub save_delay_secs: u64,
    pub cleanup_delay_secs: u64,
    pub orphaned_device_keep_secs: u64,
}

impl DeviceRegistryConfig {
    pub fn save_delay(&self) -> Duration {
        Duration::from_secs(self.save_delay_secs)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }

    pub fn orphaned_device_keep(&self) -> chrono::Duration {
        i64::try_from(self.orphaned_device_keep_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(365 * 1000))
    }
}

impl Default for DeviceRegistryConfig {
    fn default() -> Self {
        Self {
            save_delay_secs: SAVE_DELAY_SECS,
            cleanup_delay_secs: CLEANUP_DELAY_SECS,
            orphaned_device_keep_secs: ORPHANED_DEVICE_KEEP_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: DeviceRegistryConfig =
            serde_json::from_value(json!({"save_delay_secs": 1})).unwrap();
        assert_eq!(config.save_delay(), Duration::from_secs(1));
        assert_eq!(config.cleanup_delay(), Duration::from_secs(10));
        assert_eq!(config.orphaned_device_keep().num_days(), 30);
    }
}
