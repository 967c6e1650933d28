//! Closed set of data set mutations.
//!
//! # Responsibility
//! - Describe every mutation a data set accepts as one serializable value.
//! - Give each variant a stable action name for logs and interceptors.
//!
//! # Invariants
//! - Variant payloads carry ids, never positions, so an action stays
//!   meaningful when replayed against another store.

use crate::model::attribute::AttributeSnapshot;
use crate::model::case::{CanonicalCase, NamedCase};
use crate::model::ids::{AttributeId, CaseId};
use serde::{Deserialize, Serialize};

/// Insertion point for a batch of new cases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseInsertion {
    /// Append after the last case.
    #[default]
    Append,
    /// Insert every new case before this case, keeping batch order.
    Before(CaseId),
    /// One entry per new case; `None` appends that case.
    Each(Vec<Option<CaseId>>),
}

impl CaseInsertion {
    /// Returns the requested before-id for the `index`-th case of a batch.
    pub fn before_for(&self, index: usize) -> Option<&str> {
        match self {
            Self::Append => None,
            Self::Before(id) => Some(id.as_str()),
            Self::Each(ids) => ids.get(index).and_then(|id| id.as_deref()),
        }
    }
}

/// One mutation of a data set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DataSetAction {
    AddAttribute {
        snapshot: AttributeSnapshot,
        before_id: Option<AttributeId>,
    },
    RemoveAttribute {
        attribute_id: AttributeId,
    },
    MoveAttribute {
        attribute_id: AttributeId,
        before_id: Option<AttributeId>,
    },
    SetAttributeName {
        attribute_id: AttributeId,
        name: String,
    },
    AddCases {
        cases: Vec<CanonicalCase>,
        before: CaseInsertion,
    },
    SetCaseValues {
        cases: Vec<NamedCase>,
    },
    SetCanonicalCaseValues {
        cases: Vec<CanonicalCase>,
    },
    RemoveCases {
        case_ids: Vec<CaseId>,
    },
}

impl DataSetAction {
    /// Stable action name, matching the serialized `action` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddAttribute { .. } => "add_attribute",
            Self::RemoveAttribute { .. } => "remove_attribute",
            Self::MoveAttribute { .. } => "move_attribute",
            Self::SetAttributeName { .. } => "set_attribute_name",
            Self::AddCases { .. } => "add_cases",
            Self::SetCaseValues { .. } => "set_case_values",
            Self::SetCanonicalCaseValues { .. } => "set_canonical_case_values",
            Self::RemoveCases { .. } => "remove_cases",
        }
    }
}
