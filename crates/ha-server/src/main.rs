//! Home Assistant Rust Server
//!
//! Main entry point: loads the registries from `<config_dir>/.storage`,
//! installs the device cleanup and keeps running until Ctrl-C.

use anyhow::{Context as _, Result};
use ha_core::events::{HOMEASSISTANT_STARTED, HOMEASSISTANT_STOP};
use ha_core::{Context, Event};
use ha_event_bus::EventBus;
use ha_registries::{
    setup_cleanup, CleanupHandle, ConfigEntriesSnapshot, DeviceRegistryConfig,
    EntityReferencesSnapshot, Registries,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Optional registry settings file inside the config directory
const REGISTRY_CONFIG_FILE: &str = "registry.yaml";

/// The central Home Assistant instance
pub struct HomeAssistant {
    /// Event bus for pub/sub communication
    pub bus: Arc<EventBus>,
    /// Device and area registries
    pub registries: Registries,
}

impl HomeAssistant {
    /// Create a new Home Assistant instance
    pub fn new(config_dir: &Path, config: DeviceRegistryConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let registries = Registries::new(config_dir, bus.clone(), config);

        Self { bus, registries }
    }

    /// Load registries and install the device cleanup
    pub async fn start(&self) -> Result<CleanupHandle> {
        self.registries
            .load_all()
            .await
            .context("Failed to load registries")?;

        let config_entries = ConfigEntriesSnapshot::load(&self.registries.storage).await?;
        let entities = EntityReferencesSnapshot::load(&self.registries.storage).await?;

        let cleanup = setup_cleanup(
            self.registries.devices.clone(),
            self.bus.clone(),
            Arc::new(config_entries),
            Arc::new(entities),
            false,
        );

        self.fire(HOMEASSISTANT_STARTED);
        Ok(cleanup)
    }

    /// Announce shutdown and write everything still pending
    pub async fn stop(&self) -> Result<()> {
        self.fire(HOMEASSISTANT_STOP);
        self.registries
            .flush_all()
            .await
            .context("Failed to save registries")?;
        Ok(())
    }

    fn fire(&self, event_type: &str) {
        self.bus
            .fire(Event::new(event_type, serde_json::json!({}), Context::new()));
    }
}

/// Read `registry.yaml`, falling back to defaults when it is absent
async fn load_config(config_dir: &Path) -> Result<DeviceRegistryConfig> {
    let path = config_dir.join(REGISTRY_CONFIG_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid registry config: {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(DeviceRegistryConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    info!("Starting Home Assistant (Rust) in {}", config_dir.display());

    let config = load_config(&config_dir).await?;
    let hass = HomeAssistant::new(&config_dir, config);
    let cleanup = hass.start().await?;

    info!(
        "Home Assistant is running with {} devices",
        hass.registries.devices.len()
    );

    // Keep the server running
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    drop(cleanup);
    hass.stop().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_registries::DeviceInfo;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_config_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_config(temp_dir.path()).await.unwrap();
        assert_eq!(config, DeviceRegistryConfig::default());
    }

    #[tokio::test]
    async fn test_config_file_overrides() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(REGISTRY_CONFIG_FILE),
            "save_delay_secs: 1\norphaned_device_keep_secs: 60\n",
        )
        .unwrap();

        let config = load_config(temp_dir.path()).await.unwrap();
        assert_eq!(config.save_delay_secs, 1);
        assert_eq!(config.orphaned_device_keep_secs, 60);
        assert_eq!(config.cleanup_delay_secs, 10);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_devices() {
        let temp_dir = TempDir::new().unwrap();
        let hass = HomeAssistant::new(temp_dir.path(), DeviceRegistryConfig::default());
        let _cleanup = hass.start().await.unwrap();

        let device = hass
            .registries
            .devices
            .get_or_create(DeviceInfo::new("entry").with_identifier("hue", "1"))
            .unwrap();
        hass.stop().await.unwrap();

        let reopened = HomeAssistant::new(temp_dir.path(), DeviceRegistryConfig::default());
        reopened.registries.load_all().await.unwrap();
        assert!(reopened.registries.devices.get(&device.id).is_some());
    }
}
