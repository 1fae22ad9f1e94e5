//! Event types for the Home Assistant event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Trait for typed event payloads
///
/// Each payload type is bound to exactly one event type string.
pub trait EventData: Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Special event type that matches all events
    pub fn match_all() -> Self {
        Self("*".to_string())
    }

    pub fn is_match_all(&self) -> bool {
        self.0 == "*"
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event fired on the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,

    pub data: T,

    pub origin: EventOrigin,

    pub time_fired: DateTime<Utc>,

    /// Causality tracking
    pub context: Context,
}

impl<T> Event<T> {
    /// Create a new event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context,
        }
    }

    /// Replace the payload, keeping type, origin, time and context
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data: f(self.data),
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

/// Origin of an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EntityRegistryUpdatedData, RegistryAction, ENTITY_REGISTRY_UPDATED};

    #[test]
    fn test_typed_event_uses_payload_type() {
        let data = EntityRegistryUpdatedData {
            action: RegistryAction::Create,
            entity_id: "sensor.power".to_string(),
            changes: None,
        };
        let event = Event::typed(data, Context::new());
        assert_eq!(event.event_type.as_str(), ENTITY_REGISTRY_UPDATED);
        assert_eq!(event.origin, EventOrigin::Local);
    }

    #[test]
    fn test_map_keeps_metadata() {
        let event = Event::new("custom", 1u32, Context::with_id_for_test("ctx"));
        let fired = event.time_fired;
        let mapped = event.map(|n| n.to_string());
        assert_eq!(mapped.data, "1");
        assert_eq!(mapped.time_fired, fired);
        assert_eq!(mapped.context.id, "ctx");
    }

    #[test]
    fn test_match_all() {
        assert!(EventType::match_all().is_match_all());
        assert!(!EventType::from("device_registry_updated").is_match_all());
    }

    impl Context {
        fn with_id_for_test(id: &str) -> Self {
            Self {
                id: id.to_string(),
                user_id: None,
                parent_id: None,
            }
        }
    }
}
