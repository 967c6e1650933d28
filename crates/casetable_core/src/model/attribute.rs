//! Attribute (column) model.
//!
//! # Responsibility
//! - Define the stored column shape and the snapshot used to create one.
//!
//! # Invariants
//! - `Attribute::id` never changes after creation.
//! - `values` is indexed by the owning data set's case order; the data set
//!   keeps its length equal to the case count.

use crate::model::ids::AttributeId;
use crate::model::value::Value;
use serde::{Deserialize, Serialize};

/// Stored attribute column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    /// Provenance pointer to the attribute this one was derived from.
    pub source_id: Option<AttributeId>,
    pub name: String,
    pub hidden: bool,
    pub units: String,
    pub formula: String,
    pub values: Vec<Value>,
}

impl Attribute {
    /// Returns a creation snapshot for a derived copy of this attribute.
    ///
    /// The derived column keeps this attribute's id so canonical cases can be
    /// forwarded without translation; values are left empty.
    pub fn derive(&self) -> AttributeSnapshot {
        AttributeSnapshot {
            id: Some(self.id.clone()),
            source_id: Some(self.id.clone()),
            name: self.name.clone(),
            hidden: self.hidden,
            units: self.units.clone(),
            formula: self.formula.clone(),
            values: Vec::new(),
        }
    }

    pub fn to_snapshot(&self) -> AttributeSnapshot {
        AttributeSnapshot {
            id: Some(self.id.clone()),
            source_id: self.source_id.clone(),
            name: self.name.clone(),
            hidden: self.hidden,
            units: self.units.clone(),
            formula: self.formula.clone(),
            values: self.values.clone(),
        }
    }
}

/// Input shape for attribute creation.
///
/// `id: None` means "generate one"; the convenience wrapper on the data set
/// fills it before the action is dispatched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    pub id: Option<AttributeId>,
    pub source_id: Option<AttributeId>,
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub formula: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl AttributeSnapshot {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<AttributeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = formula.into();
        self
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }
}
