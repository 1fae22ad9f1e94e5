//! Core types for Home Assistant
//!
//! This crate provides the event primitives shared by the registries and the
//! event bus: Event, EventData, EventType and Context.

mod context;
mod event;

pub use context::Context;
pub use event::{Event, EventData, EventOrigin, EventType};

/// Standard event types used by Home Assistant
pub mod events {
    use serde::{Deserialize, Serialize};

    use super::EventData;

    /// Fired once all integrations have been set up
    pub const HOMEASSISTANT_STARTED: &str = "homeassistant_started";

    /// Fired when Home Assistant begins shutting down
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Fired after every device registry mutation
    pub const DEVICE_REGISTRY_UPDATED: &str = "device_registry_updated";

    /// Fired after every entity registry mutation
    pub const ENTITY_REGISTRY_UPDATED: &str = "entity_registry_updated";

    /// What happened to a registry entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RegistryAction {
        Create,
        Update,
        Remove,
    }

    impl RegistryAction {
        pub fn as_str(&self) -> &'static str {
            match self {
                RegistryAction::Create => "create",
                RegistryAction::Update => "update",
                RegistryAction::Remove => "remove",
            }
        }
    }

    /// Data for ENTITY_REGISTRY_UPDATED events
    ///
    /// `changes` maps each changed attribute to its previous value and is
    /// only present for updates.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EntityRegistryUpdatedData {
        pub action: RegistryAction,
        pub entity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub changes: Option<serde_json::Map<String, serde_json::Value>>,
    }

    impl EntityRegistryUpdatedData {
        /// Whether this change may have dropped the last reference to a device
        pub fn affects_device_references(&self) -> bool {
            match self.action {
                RegistryAction::Create | RegistryAction::Remove => true,
                RegistryAction::Update => self
                    .changes
                    .as_ref()
                    .is_some_and(|changes| changes.contains_key("device_id")),
            }
        }
    }

    impl EventData for EntityRegistryUpdatedData {
        fn event_type() -> &'static str {
            ENTITY_REGISTRY_UPDATED
        }
    }

}
