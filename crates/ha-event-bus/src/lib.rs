//! Event bus with typed pub/sub for Home Assistant
//!
//! The EventBus is the process-wide message broker. Registries fire their
//! change events here and background tasks (such as the device registry
//! cleanup) subscribe to the events they react to.

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, EventType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, trace, warn};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

type RawEvent = Event<serde_json::Value>;

/// The event bus for publishing and subscribing to events
///
/// Every event type gets its own broadcast channel, created lazily on first
/// subscription. Firing an event nobody listens to is a no-op apart from the
/// match-all channel.
pub struct EventBus {
    listeners: DashMap<EventType, broadcast::Sender<RawEvent>>,
    match_all_sender: broadcast::Sender<RawEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<RawEvent> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event
    pub fn subscribe_typed<T: EventData + DeserializeOwned>(&self) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<RawEvent> {
        self.match_all_sender.subscribe()
    }

    /// Fire an event to the subscribers of its type and to match-all subscribers
    pub fn fire(&self, event: RawEvent) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // A send error only means there are no live receivers
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event);
    }

    /// Fire a typed event
    pub fn fire_typed<T: EventData + Serialize>(&self, data: T, context: Context) {
        match serde_json::to_value(&data) {
            Ok(json) => self.fire(Event::new(T::event_type(), json, context)),
            Err(err) => warn!(
                event_type = T::event_type(),
                "Dropping event with unserializable payload: {}", err
            ),
        }
    }

    /// Number of event types with a channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver that only yields events whose payload parses as `T`
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<RawEvent>,
    _phantom: PhantomData<T>,
}

impl<T: EventData + DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<RawEvent>) -> Self {
        Self {
            rx,
            _phantom: PhantomData,
        }
    }

    /// Wait for the next event with a well-formed payload
    pub async fn recv(&mut self) -> Result<Event<T>, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Some(typed) = Self::parse(event) {
                return Ok(typed);
            }
        }
    }

    /// Take the next already-delivered event without waiting
    pub fn try_recv(&mut self) -> Result<Event<T>, TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if let Some(typed) = Self::parse(event) {
                return Ok(typed);
            }
        }
    }

    /// Drain every already-delivered event
    pub fn drain(&mut self) -> Vec<Event<T>> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, event_type = T::event_type(), "Receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            }
        }
    }

    fn parse(event: RawEvent) -> Option<Event<T>> {
        let data = serde_json::from_value::<T>(event.data.clone()).ok()?;
        Some(event.map(|_| data))
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
