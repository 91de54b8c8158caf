//! Namespaced plugin state
//!
//! One record per plugin id. Reads and writes go through the owning plugin's
//! state schema: a stored record that no longer validates reads as absent,
//! and writing an invalid record is rejected. During `prepare` a plugin only
//! ever holds a [`StateSlot`] for its own id.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::error::{Error, Result};
use crate::schema::Schema;

/// Plain record map, as persisted between runs.
pub type StateSnapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct StateStore {
    records: StateSnapshot,
    schemas: HashMap<String, Schema>,
}

impl StateStore {
    pub fn new(schemas: HashMap<String, Schema>, initial: StateSnapshot) -> Self {
        Self {
            records: initial,
            schemas,
        }
    }

    pub fn register_schema(&mut self, plugin_id: impl Into<String>, schema: Schema) {
        self.schemas.insert(plugin_id.into(), schema);
    }

    /// The plugin's record, if present and valid against its schema.
    pub fn get_state(&self, plugin_id: &str) -> Option<Value> {
        let record = self.records.get(plugin_id)?;
        match self.schema(plugin_id).check(record) {
            Ok(()) => Some(record.clone()),
            Err(message) => {
                warn!(plugin = plugin_id, %message, "Dropping invalid stored state");
                None
            }
        }
    }

    /// Replace the plugin's record; fails without writing if invalid.
    pub fn set_state(&mut self, plugin_id: &str, record: Value) -> Result<()> {
        self.schema(plugin_id)
            .check(&record)
            .map_err(|message| Error::InvalidState {
                plugin: plugin_id.to_string(),
                message,
            })?;
        self.records.insert(plugin_id.to_string(), record);
        Ok(())
    }

    pub fn clear_state(&mut self, plugin_id: &str) {
        self.records.remove(plugin_id);
    }

    /// Scoped handle onto one plugin's record.
    pub fn slot(&mut self, plugin_id: &str) -> StateSlot<'_> {
        StateSlot {
            plugin_id: plugin_id.to_string(),
            store: self,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.records.clone()
    }

    fn schema(&self, plugin_id: &str) -> Schema {
        self.schemas.get(plugin_id).cloned().unwrap_or_default()
    }
}

/// A plugin's view of its own state record.
pub struct StateSlot<'a> {
    plugin_id: String,
    store: &'a mut StateStore,
}

impl StateSlot<'_> {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn get(&self) -> Option<Value> {
        self.store.get_state(&self.plugin_id)
    }

    /// Typed read; a record that does not deserialize reads as absent.
    pub fn get_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.get()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn set(&mut self, record: Value) -> Result<()> {
        self.store.set_state(&self.plugin_id, record)
    }

    pub fn set_as<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.set(serde_json::to_value(record)?)
    }

    pub fn clear(&mut self) {
        self.store.clear_state(&self.plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        }))
        .expect("schema")
    }

    #[test]
    fn slots_are_namespaced() {
        let mut store = StateStore::default();
        store.register_schema("a", counter_schema());
        store.slot("a").set(json!({"x": 1})).expect("write a");

        assert_eq!(store.slot("b").get(), None);
        assert_eq!(store.get_state("b"), None);
        assert_eq!(store.get_state("a"), Some(json!({"x": 1})));
    }

    #[test]
    fn invalid_writes_are_rejected() {
        let mut store = StateStore::default();
        store.register_schema("a", counter_schema());
        store.set_state("a", json!({"x": 1})).expect("valid");

        let err = store.set_state("a", json!({"x": "one"})).unwrap_err();
        assert!(matches!(err, Error::InvalidState { ref plugin, .. } if plugin == "a"));
        assert_eq!(store.get_state("a"), Some(json!({"x": 1})));
    }

    #[test]
    fn invalid_stored_records_read_as_absent() {
        let initial = StateSnapshot::from([("a".to_string(), json!({"x": "stale"}))]);
        let store = StateStore::new(HashMap::from([("a".to_string(), counter_schema())]), initial);
        assert_eq!(store.get_state("a"), None);
    }

    #[test]
    fn typed_access() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Counter {
            x: i64,
        }

        let mut store = StateStore::default();
        let mut slot = store.slot("a");
        slot.set_as(&Counter { x: 4 }).expect("write");
        assert_eq!(slot.get_as::<Counter>(), Some(Counter { x: 4 }));
        slot.clear();
        assert_eq!(slot.get(), None);
    }
}
