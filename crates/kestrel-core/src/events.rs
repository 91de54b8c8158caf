//! Typed publish/subscribe bus
//!
//! - Events are registered with a payload schema; re-registering an id
//!   replaces it.
//! - `publish` validates the payload, then calls every listener for that id
//!   and every wildcard listener synchronously, in registration order.
//! - `listen` returns a [`ListenerHandle`] that deregisters the listener.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

use crate::constants::events as core_events;
use crate::container::{Container, Service};
use crate::error::{Error, Result};
use crate::schema::Schema;

#[derive(Debug, Clone)]
pub struct EventDefinition {
    pub id: String,
    pub description: String,
    pub schema: Schema,
}

impl EventDefinition {
    pub fn new(id: impl Into<String>, description: impl Into<String>, schema: Schema) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            schema,
        }
    }
}

/// What listeners receive.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub user_id: Option<String>,
}

impl PublishOptions {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

type Listener = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;
type RegistrationHook = Arc<dyn Fn(&EventDefinition) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    /// `None` listens to every event.
    event: Option<String>,
    handler: Listener,
}

#[derive(Default)]
struct BusInner {
    events: RwLock<HashMap<String, EventDefinition>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    hooks: RwLock<Vec<RegistrationHook>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Cancels a listener registration.
#[must_use = "dropping the handle keeps the listener registered forever"]
pub struct ListenerHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl ListenerHandle {
    /// Remove the listener. Returns false if it was already gone.
    pub fn cancel(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut listeners = bus.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != self.id);
        listeners.len() != before
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with the `prompt.*` lifecycle events registered.
    pub fn with_core_events() -> Self {
        let bus = Self::new();
        let payload = Schema::new(json!({
            "type": "object",
            "properties": { "prompt_id": { "type": "string" } },
            "required": ["prompt_id"]
        }))
        .unwrap_or_default();
        for (id, description) in [
            (core_events::PROMPT_STARTED, "A prompt run started"),
            (core_events::PROMPT_TEXT_DELTA, "Streamed model text"),
            (core_events::PROMPT_TEXT, "A text item was appended"),
            (core_events::PROMPT_TOOL_CALL, "The model requested a tool call"),
            (core_events::PROMPT_TOOL_RESULT, "A tool result was appended"),
            (core_events::PROMPT_APPROVAL_REQUESTED, "A tool call awaits approval"),
            (core_events::PROMPT_APPROVAL_RESOLVED, "A pending tool call was approved or rejected"),
            (core_events::PROMPT_USAGE, "Token usage for one model round"),
            (core_events::PROMPT_COMPLETED, "A prompt reached its terminal state"),
            (core_events::PROMPT_ERROR, "A prompt run failed"),
        ] {
            bus.register_event(EventDefinition::new(id, description, payload.clone()));
        }
        bus
    }

    pub fn register_event(&self, definition: EventDefinition) {
        self.inner
            .events
            .write()
            .insert(definition.id.clone(), definition.clone());
        let hooks: Vec<RegistrationHook> = self.inner.hooks.read().clone();
        for hook in hooks {
            hook(&definition);
        }
    }

    /// Called synchronously for every later `register_event`.
    pub fn on_event_registered(&self, hook: impl Fn(&EventDefinition) + Send + Sync + 'static) {
        self.inner.hooks.write().push(Arc::new(hook));
    }

    pub fn definition(&self, id: &str) -> Option<EventDefinition> {
        self.inner.events.read().get(id).cloned()
    }

    pub fn event_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.events.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn listen(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.add_listener(Some(event.into()), Arc::new(handler))
    }

    /// Listen to every event.
    pub fn listen_all(
        &self,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.add_listener(None, Arc::new(handler))
    }

    /// Validate and deliver; returns how many listeners were called.
    pub fn publish(&self, event: &str, data: Value, options: PublishOptions) -> Result<usize> {
        let schema = self
            .inner
            .events
            .read()
            .get(event)
            .map(|definition| definition.schema.clone())
            .ok_or_else(|| Error::UnknownEvent(event.to_string()))?;
        schema
            .check(&data)
            .map_err(|message| Error::InvalidEventPayload {
                event: event.to_string(),
                message,
            })?;

        let targets: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.event.as_deref().map_or(true, |id| id == event))
            .map(|entry| entry.handler.clone())
            .collect();

        let envelope = EventEnvelope {
            event: event.to_string(),
            user_id: options.user_id,
            data,
        };
        for handler in &targets {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope))).is_err() {
                warn!(event, "Event listener panicked");
            }
        }
        Ok(targets.len())
    }

    fn add_listener(&self, event: Option<String>, handler: Listener) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push(ListenerEntry { id, event, handler });
        ListenerHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }
}

#[async_trait]
impl Service for EventBus {
    async fn create(_container: &Container) -> anyhow::Result<Self> {
        Ok(Self::with_core_events())
    }
}
