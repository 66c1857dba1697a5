//! Variable contexts for template rendering.
//!
//! A `VarContext` is the immutable, flat key-to-value view of everything an
//! operation brings to a workspace render: instance identifiers, user
//! parameters, and outputs captured from earlier runs. Keys are strings,
//! values are JSON scalars or nested structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable mapping of operation inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarContext {
    values: BTreeMap<String, Value>,
}

impl VarContext {
    pub fn builder() -> VarContextBuilder {
        VarContextBuilder::default()
    }

    /// Flat key-to-value view used for template substitution.
    pub fn to_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String form of a value, without JSON quoting for plain strings.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Returns the keys from `required` that are absent from this context.
    pub fn missing_keys(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|key| !self.values.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Accumulates values from several sources before freezing them into a
/// `VarContext`. Later inserts win on key collision, so callers layer
/// defaults first and request parameters last.
#[derive(Debug, Default)]
pub struct VarContextBuilder {
    values: BTreeMap<String, Value>,
}

impl VarContextBuilder {
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn merge_map(mut self, map: &BTreeMap<String, Value>) -> Self {
        for (key, value) in map {
            self.values.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn merge_context(self, other: &VarContext) -> Self {
        self.merge_map(other.to_map())
    }

    pub fn build(self) -> VarContext {
        VarContext {
            values: self.values,
        }
    }
}
