//! Case (row) representations.
//!
//! A case has no storage of its own: its row is the value at the case's
//! position in every attribute column. These types are the two ways a row
//! crosses the data set boundary.
//!
//! # Invariants
//! - `NamedCase` keys are attribute names; `CanonicalCase` keys are attribute
//!   ids and stay valid across renames.
//! - `id: None` only appears on input that still needs a generated id.

use crate::model::ids::CaseId;
use crate::model::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row keyed by attribute name, used for external input/output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamedCase {
    pub id: Option<CaseId>,
    pub values: BTreeMap<String, Value>,
}

/// Row keyed by attribute id, used internally and by derivation/sync.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalCase {
    pub id: Option<CaseId>,
    pub values: BTreeMap<String, Value>,
}

impl NamedCase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<CaseId>) -> Self {
        Self {
            id: Some(id.into()),
            values: BTreeMap::new(),
        }
    }

    /// Adds one `name => value` pair, builder style. String values are
    /// coerced like typed input, so `"3"` stores a number.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Returns the value for `name`, `Absent` when missing.
    pub fn value(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Absent)
    }
}

impl CanonicalCase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<CaseId>) -> Self {
        Self {
            id: Some(id.into()),
            values: BTreeMap::new(),
        }
    }

    pub fn set(mut self, attribute_id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(attribute_id.into(), value.into());
        self
    }

    pub fn value(&self, attribute_id: &str) -> &Value {
        self.values.get(attribute_id).unwrap_or(&Value::Absent)
    }
}
