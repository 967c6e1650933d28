//! In-memory table state and action application.
//!
//! # Responsibility
//! - Own the attribute columns, case order and their lookup maps.
//! - Apply `DataSetAction`s with defensive no-op semantics.
//!
//! # Invariants
//! - `case_index[cases[i]] == i` for every position, and nothing else is in
//!   `case_index`.
//! - `attribute_index[attributes[i].id] == i`; `attribute_names` maps every
//!   attribute name to its id and nothing else.
//! - Every attribute's `values.len() == cases.len()`.
//! - Unknown ids, duplicate ids and id-less entries are skipped, never
//!   reported as errors; the rest of a batch still applies.

use crate::model::attribute::{Attribute, AttributeSnapshot};
use crate::model::case::{CanonicalCase, NamedCase};
use crate::model::ids::{AttributeId, CaseId, DataSetId};
use crate::model::value::Value;
use crate::pipeline::action::{CaseInsertion, DataSetAction};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Full serializable copy of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetSnapshot {
    pub id: DataSetId,
    pub source_id: Option<DataSetId>,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub cases: Vec<CaseId>,
}

/// Attribute columns plus case order, with id/name/position indexes.
#[derive(Debug, Clone)]
pub struct Table {
    id: DataSetId,
    source_id: Option<DataSetId>,
    name: String,
    attributes: Vec<Attribute>,
    attribute_index: HashMap<AttributeId, usize>,
    attribute_names: HashMap<String, AttributeId>,
    cases: Vec<CaseId>,
    case_index: HashMap<CaseId, usize>,
}

impl Table {
    pub fn new(id: impl Into<DataSetId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: None,
            name: name.into(),
            attributes: Vec::new(),
            attribute_index: HashMap::new(),
            attribute_names: HashMap::new(),
            cases: Vec::new(),
            case_index: HashMap::new(),
        }
    }

    /// Rebuilds a table from a snapshot, normalizing column lengths and
    /// dropping duplicate ids or names.
    pub fn from_snapshot(snapshot: DataSetSnapshot) -> Self {
        let mut table = Self::new(snapshot.id, snapshot.name);
        table.source_id = snapshot.source_id;

        let mut seen_cases = HashSet::new();
        let keep: Vec<bool> = snapshot
            .cases
            .iter()
            .map(|case_id| seen_cases.insert(case_id.clone()))
            .collect();
        table.cases = snapshot
            .cases
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(case_id, keep)| keep.then_some(case_id))
            .collect();
        table.reindex_cases_from(0);

        for mut attribute in snapshot.attributes {
            if table.attribute_index.contains_key(&attribute.id)
                || table.attribute_names.contains_key(&attribute.name)
            {
                continue;
            }
            let mut values = attribute.values.into_iter();
            attribute.values = keep
                .iter()
                .filter_map(|keep| {
                    let value = values.next().unwrap_or_default();
                    keep.then_some(value)
                })
                .collect();
            attribute.values.resize(table.cases.len(), Value::Absent);
            table
                .attribute_names
                .insert(attribute.name.clone(), attribute.id.clone());
            table.attributes.push(attribute);
        }
        table.reindex_attributes_from(0);
        table
    }

    pub fn snapshot(&self) -> DataSetSnapshot {
        DataSetSnapshot {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            cases: self.cases.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_source_id(&mut self, source_id: Option<DataSetId>) {
        self.source_id = source_id;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // ---- reads ------------------------------------------------------------

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, attribute_id: &str) -> Option<&Attribute> {
        self.attribute_index
            .get(attribute_id)
            .map(|index| &self.attributes[*index])
    }

    pub fn attribute_by_name(&self, name: &str) -> Option<&Attribute> {
        self.attribute_names
            .get(name)
            .and_then(|attribute_id| self.attribute(attribute_id))
    }

    pub fn attribute_position(&self, attribute_id: &str) -> Option<usize> {
        self.attribute_index.get(attribute_id).copied()
    }

    pub fn case_ids(&self) -> &[CaseId] {
        &self.cases
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    pub fn contains_case(&self, case_id: &str) -> bool {
        self.case_index.contains_key(case_id)
    }

    pub fn case_index(&self, case_id: &str) -> Option<usize> {
        self.case_index.get(case_id).copied()
    }

    pub fn case_id_at(&self, index: usize) -> Option<&str> {
        self.cases.get(index).map(String::as_str)
    }

    /// Returns the id of the case following `case_id` in row order.
    pub fn next_case_id(&self, case_id: &str) -> Option<&str> {
        let index = self.case_index(case_id)?;
        self.case_id_at(index + 1)
    }

    pub fn value(&self, case_id: &str, attribute_id: &str) -> Option<&Value> {
        let row = self.case_index(case_id)?;
        self.attribute(attribute_id)
            .and_then(|attribute| attribute.values.get(row))
    }

    pub fn named_case(&self, case_id: &str) -> Option<NamedCase> {
        let row = self.case_index(case_id)?;
        Some(self.named_case_at_row(row))
    }

    pub fn named_case_at(&self, index: usize) -> Option<NamedCase> {
        (index < self.cases.len()).then(|| self.named_case_at_row(index))
    }

    pub fn canonical_case(&self, case_id: &str) -> Option<CanonicalCase> {
        let row = self.case_index(case_id)?;
        let mut case = CanonicalCase::with_id(case_id);
        for attribute in &self.attributes {
            case.values
                .insert(attribute.id.clone(), attribute.values[row].clone());
        }
        Some(case)
    }

    /// Converts a named case to a canonical one; unknown names are dropped.
    pub fn canonicalize(&self, case: &NamedCase) -> CanonicalCase {
        CanonicalCase {
            id: case.id.clone(),
            values: case
                .values
                .iter()
                .filter_map(|(name, value)| {
                    self.attribute_names
                        .get(name)
                        .map(|attribute_id| (attribute_id.clone(), value.clone()))
                })
                .collect(),
        }
    }

    /// Converts a canonical case to a named one; unknown ids are dropped.
    pub fn to_named(&self, case: &CanonicalCase) -> NamedCase {
        NamedCase {
            id: case.id.clone(),
            values: case
                .values
                .iter()
                .filter_map(|(attribute_id, value)| {
                    self.attribute(attribute_id)
                        .map(|attribute| (attribute.name.clone(), value.clone()))
                })
                .collect(),
        }
    }

    /// Verifies every index invariant. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.case_index.len() != self.cases.len() {
            return Err(format!(
                "case index holds {} entries for {} cases",
                self.case_index.len(),
                self.cases.len()
            ));
        }
        for (position, case_id) in self.cases.iter().enumerate() {
            if self.case_index.get(case_id) != Some(&position) {
                return Err(format!("case `{case_id}` is not indexed at {position}"));
            }
        }
        if self.attribute_index.len() != self.attributes.len()
            || self.attribute_names.len() != self.attributes.len()
        {
            return Err("attribute maps and attribute list differ in size".to_string());
        }
        for (position, attribute) in self.attributes.iter().enumerate() {
            if self.attribute_index.get(&attribute.id) != Some(&position) {
                return Err(format!(
                    "attribute `{}` is not indexed at {position}",
                    attribute.id
                ));
            }
            if self.attribute_names.get(&attribute.name) != Some(&attribute.id) {
                return Err(format!("attribute name `{}` is not indexed", attribute.name));
            }
            if attribute.values.len() != self.cases.len() {
                return Err(format!(
                    "attribute `{}` holds {} values for {} cases",
                    attribute.id,
                    attribute.values.len(),
                    self.cases.len()
                ));
            }
        }
        Ok(())
    }

    // ---- mutation ---------------------------------------------------------

    /// Applies one action. Returns whether any state changed.
    pub fn apply(&mut self, action: &DataSetAction) -> bool {
        match action {
            DataSetAction::AddAttribute {
                snapshot,
                before_id,
            } => self.add_attribute(snapshot, before_id.as_deref()),
            DataSetAction::RemoveAttribute { attribute_id } => self.remove_attribute(attribute_id),
            DataSetAction::MoveAttribute {
                attribute_id,
                before_id,
            } => self.move_attribute(attribute_id, before_id.as_deref()),
            DataSetAction::SetAttributeName { attribute_id, name } => {
                self.set_attribute_name(attribute_id, name)
            }
            DataSetAction::AddCases { cases, before } => self.add_cases(cases, before),
            DataSetAction::SetCaseValues { cases } => {
                let canonical: Vec<CanonicalCase> =
                    cases.iter().map(|case| self.canonicalize(case)).collect();
                self.set_canonical_case_values(&canonical)
            }
            DataSetAction::SetCanonicalCaseValues { cases } => {
                self.set_canonical_case_values(cases)
            }
            DataSetAction::RemoveCases { case_ids } => self.remove_cases(case_ids),
        }
    }

    fn add_attribute(&mut self, snapshot: &AttributeSnapshot, before_id: Option<&str>) -> bool {
        let Some(attribute_id) = snapshot.id.clone() else {
            debug!("event=add_attribute module=table status=skip reason=missing_id");
            return false;
        };
        if self.attribute_index.contains_key(&attribute_id) {
            debug!(
                "event=add_attribute module=table status=skip reason=duplicate_id attribute={attribute_id}"
            );
            return false;
        }
        if self.attribute_names.contains_key(&snapshot.name) {
            debug!(
                "event=add_attribute module=table status=skip reason=duplicate_name attribute={attribute_id}"
            );
            return false;
        }

        let mut values = snapshot.values.clone();
        values.resize(self.cases.len(), Value::Absent);
        let position = before_id
            .and_then(|before_id| self.attribute_position(before_id))
            .unwrap_or(self.attributes.len());

        self.attribute_names
            .insert(snapshot.name.clone(), attribute_id.clone());
        self.attributes.insert(
            position,
            Attribute {
                id: attribute_id,
                source_id: snapshot.source_id.clone(),
                name: snapshot.name.clone(),
                hidden: snapshot.hidden,
                units: snapshot.units.clone(),
                formula: snapshot.formula.clone(),
                values,
            },
        );
        self.reindex_attributes_from(position);
        true
    }

    fn remove_attribute(&mut self, attribute_id: &str) -> bool {
        let Some(position) = self.attribute_position(attribute_id) else {
            return false;
        };
        let removed = self.attributes.remove(position);
        self.attribute_index.remove(&removed.id);
        self.attribute_names.remove(&removed.name);
        self.reindex_attributes_from(position);
        true
    }

    fn move_attribute(&mut self, attribute_id: &str, before_id: Option<&str>) -> bool {
        let Some(from) = self.attribute_position(attribute_id) else {
            return false;
        };
        if before_id == Some(attribute_id) {
            return false;
        }
        let target = before_id
            .and_then(|before_id| self.attribute_position(before_id))
            .map(|position| if position > from { position - 1 } else { position })
            .unwrap_or(self.attributes.len() - 1);
        if target == from {
            return false;
        }

        let attribute = self.attributes.remove(from);
        self.attributes.insert(target, attribute);
        self.reindex_attributes_from(from.min(target));
        true
    }

    fn set_attribute_name(&mut self, attribute_id: &str, name: &str) -> bool {
        let Some(position) = self.attribute_position(attribute_id) else {
            return false;
        };
        if self.attributes[position].name == name {
            return false;
        }
        if self.attribute_names.contains_key(name) {
            debug!(
                "event=set_attribute_name module=table status=skip reason=duplicate_name attribute={attribute_id}"
            );
            return false;
        }
        let previous = std::mem::replace(&mut self.attributes[position].name, name.to_string());
        self.attribute_names.remove(&previous);
        self.attribute_names
            .insert(name.to_string(), attribute_id.to_string());
        true
    }

    fn add_cases(&mut self, cases: &[CanonicalCase], before: &CaseInsertion) -> bool {
        let mut changed = false;
        for (batch_index, case) in cases.iter().enumerate() {
            let Some(case_id) = case.id.as_ref() else {
                debug!("event=add_cases module=table status=skip reason=missing_id");
                continue;
            };
            if self.case_index.contains_key(case_id) {
                debug!("event=add_cases module=table status=skip reason=duplicate_id case={case_id}");
                continue;
            }

            let position = before
                .before_for(batch_index)
                .and_then(|before_id| self.case_index(before_id))
                .unwrap_or(self.cases.len());
            self.cases.insert(position, case_id.clone());
            for attribute in &mut self.attributes {
                let value = case.values.get(&attribute.id).cloned().unwrap_or_default();
                attribute.values.insert(position, value);
            }
            self.reindex_cases_from(position);
            changed = true;
        }
        changed
    }

    fn set_canonical_case_values(&mut self, cases: &[CanonicalCase]) -> bool {
        let mut changed = false;
        for case in cases {
            let Some(row) = case.id.as_deref().and_then(|id| self.case_index(id)) else {
                continue;
            };
            for (attribute_id, value) in &case.values {
                let Some(position) = self.attribute_index.get(attribute_id).copied() else {
                    continue;
                };
                let cell = &mut self.attributes[position].values[row];
                if *cell != *value {
                    *cell = value.clone();
                    changed = true;
                }
            }
        }
        changed
    }

    fn remove_cases(&mut self, case_ids: &[CaseId]) -> bool {
        let doomed: HashSet<usize> = case_ids
            .iter()
            .filter_map(|case_id| self.case_index(case_id))
            .collect();
        let Some(first) = doomed.iter().min().copied() else {
            return false;
        };

        for position in &doomed {
            self.case_index.remove(&self.cases[*position]);
        }
        retain_positions(&mut self.cases, &doomed);
        for attribute in &mut self.attributes {
            retain_positions(&mut attribute.values, &doomed);
        }
        self.reindex_cases_from(first);
        true
    }

    fn reindex_cases_from(&mut self, start: usize) {
        for (position, case_id) in self.cases.iter().enumerate().skip(start) {
            self.case_index.insert(case_id.clone(), position);
        }
    }

    fn reindex_attributes_from(&mut self, start: usize) {
        for (position, attribute) in self.attributes.iter().enumerate().skip(start) {
            self.attribute_index.insert(attribute.id.clone(), position);
        }
    }

    fn named_case_at_row(&self, row: usize) -> NamedCase {
        let mut case = NamedCase::with_id(self.cases[row].clone());
        for attribute in &self.attributes {
            case.values
                .insert(attribute.name.clone(), attribute.values[row].clone());
        }
        case
    }
}

fn retain_positions<T>(items: &mut Vec<T>, doomed: &HashSet<usize>) {
    let mut position = 0;
    items.retain(|_| {
        let keep = !doomed.contains(&position);
        position += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::model::attribute::AttributeSnapshot;
    use crate::model::case::CanonicalCase;
    use crate::model::value::Value;
    use crate::pipeline::action::{CaseInsertion, DataSetAction};

    fn add_attribute(table: &mut Table, id: &str, name: &str) {
        table.apply(&DataSetAction::AddAttribute {
            snapshot: AttributeSnapshot::named(name).with_id(id),
            before_id: None,
        });
    }

    fn add_case(table: &mut Table, id: &str, before: CaseInsertion) {
        table.apply(&DataSetAction::AddCases {
            cases: vec![CanonicalCase::with_id(id).set("a", Value::from(1.0))],
            before,
        });
    }

    fn table_with_cases(ids: &[&str]) -> Table {
        let mut table = Table::new("ds", "Data");
        add_attribute(&mut table, "a", "A");
        for id in ids {
            add_case(&mut table, id, CaseInsertion::Append);
        }
        table
    }

    #[test]
    fn add_cases_before_existing_id_reindexes_tail() {
        let mut table = table_with_cases(&["c1", "c2"]);
        add_case(&mut table, "c0", CaseInsertion::Before("c2".to_string()));

        assert_eq!(table.case_ids(), ["c1", "c0", "c2"]);
        assert_eq!(table.case_index("c2"), Some(2));
        assert_eq!(table.next_case_id("c0"), Some("c2"));
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn add_cases_with_unknown_before_appends() {
        let mut table = table_with_cases(&["c1"]);
        add_case(&mut table, "c2", CaseInsertion::Before("missing".to_string()));
        assert_eq!(table.case_ids(), ["c1", "c2"]);
    }

    #[test]
    fn add_cases_skips_duplicates_and_missing_ids() {
        let mut table = table_with_cases(&["c1"]);
        let changed = table.apply(&DataSetAction::AddCases {
            cases: vec![
                CanonicalCase::with_id("c1"),
                CanonicalCase::new(),
                CanonicalCase::with_id("c2"),
            ],
            before: CaseInsertion::Append,
        });
        assert!(changed);
        assert_eq!(table.case_ids(), ["c1", "c2"]);
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn remove_cases_compacts_columns() {
        let mut table = table_with_cases(&["c1", "c2", "c3", "c4"]);
        table.apply(&DataSetAction::RemoveCases {
            case_ids: vec!["c3".to_string(), "c1".to_string(), "zz".to_string()],
        });
        assert_eq!(table.case_ids(), ["c2", "c4"]);
        assert_eq!(table.attribute("a").expect("attribute a").values.len(), 2);
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn move_attribute_handles_both_directions() {
        let mut table = Table::new("ds", "Data");
        add_attribute(&mut table, "a", "A");
        add_attribute(&mut table, "b", "B");
        add_attribute(&mut table, "c", "C");

        table.apply(&DataSetAction::MoveAttribute {
            attribute_id: "c".to_string(),
            before_id: Some("a".to_string()),
        });
        let order: Vec<&str> = table.attributes().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(order, ["c", "a", "b"]);

        table.apply(&DataSetAction::MoveAttribute {
            attribute_id: "c".to_string(),
            before_id: Some("b".to_string()),
        });
        let order: Vec<&str> = table.attributes().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(order, ["a", "c", "b"]);

        table.apply(&DataSetAction::MoveAttribute {
            attribute_id: "a".to_string(),
            before_id: None,
        });
        let order: Vec<&str> = table.attributes().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(order, ["c", "b", "a"]);
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn rename_rejects_taken_name() {
        let mut table = Table::new("ds", "Data");
        add_attribute(&mut table, "a", "A");
        add_attribute(&mut table, "b", "B");

        let changed = table.apply(&DataSetAction::SetAttributeName {
            attribute_id: "a".to_string(),
            name: "B".to_string(),
        });
        assert!(!changed);

        table.apply(&DataSetAction::SetAttributeName {
            attribute_id: "a".to_string(),
            name: "Alpha".to_string(),
        });
        assert_eq!(table.attribute_by_name("Alpha").map(|a| a.id.as_str()), Some("a"));
        assert!(table.attribute_by_name("A").is_none());
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn add_attribute_pads_values_to_case_count() {
        let mut table = table_with_cases(&["c1", "c2"]);
        table.apply(&DataSetAction::AddAttribute {
            snapshot: AttributeSnapshot::named("B")
                .with_id("b")
                .with_values(vec![Value::from(9.0)]),
            before_id: Some("a".to_string()),
        });
        assert_eq!(table.attributes()[0].id, "b");
        assert_eq!(table.value("c2", "b"), Some(&Value::Absent));
        table.check_invariants().expect("indexes stay consistent");
    }

    #[test]
    fn from_snapshot_normalizes_lengths_and_duplicates() {
        let mut source = table_with_cases(&["c1", "c2"]);
        add_attribute(&mut source, "b", "B");
        let mut snapshot = source.snapshot();
        snapshot.cases.push("c1".to_string());
        snapshot.attributes[0].values.push(Value::from(5.0));
        snapshot.attributes[1].values.clear();

        let rebuilt = Table::from_snapshot(snapshot);
        assert_eq!(rebuilt.case_ids(), ["c1", "c2"]);
        rebuilt.check_invariants().expect("rebuilt indexes are consistent");
    }
}
