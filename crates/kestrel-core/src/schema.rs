//! JSON Schema wrapper used for plugin config, plugin state, event payloads
//! and tool input.

use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A compiled JSON Schema.
#[derive(Clone)]
pub struct Schema {
    raw: Value,
    validator: Arc<jsonschema::Validator>,
}

impl Schema {
    pub fn new(raw: Value) -> Result<Self> {
        let validator =
            jsonschema::Validator::new(&raw).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        Ok(Self {
            raw,
            validator: Arc::new(validator),
        })
    }

    /// Schema accepting every value.
    pub fn any() -> Self {
        Self::new(json!({})).unwrap_or_else(|_| unreachable!("empty schema always compiles"))
    }

    /// Derive a schema from a Rust type.
    pub fn of<T: schemars::JsonSchema>() -> Result<Self> {
        let root = schemars::schema_for!(T);
        Self::new(serde_json::to_value(root)?)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.validator.is_valid(value)
    }

    /// Validate, collecting every violation message.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Like [`Schema::validate`] with the violations joined into one line.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        self.validate(value).map_err(|errors| errors.join("; "))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schema").field(&self.raw).finish()
    }
}
