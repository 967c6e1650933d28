//! Derived data sets and incremental synchronization.
//!
//! # Responsibility
//! - Build a filtered/projected copy of a source data set (`DataSet::derive`).
//! - For synchronized derivations, translate every source action into the
//!   equivalent derived actions without rescanning the source.
//!
//! # Invariants
//! - Derived actions are computed against the source state *before* the
//!   source applies its action, but only queued once the source has actually
//!   applied it. A plan for a suppressed source action is dropped.
//! - Queued derived actions apply on a later scheduler tick.
//! - Retained cases keep the source's relative order: insertion points are
//!   remapped by walking forward in the source to the next derived member.
//! - Membership checks see queued-but-unapplied derived work, so several
//!   source actions issued within one tick still remap correctly.
//! - A flush that targets a dropped or destroyed derived store is a no-op.

use crate::dataset::{DataSet, DataSetOptions, Upstream, WeakDataSet};
use crate::error::ActionResult;
use crate::model::attribute::{Attribute, AttributeSnapshot};
use crate::model::case::{CanonicalCase, NamedCase};
use crate::model::ids::{AttributeId, CaseId};
use crate::model::table::Table;
use crate::pipeline::action::{CaseInsertion, DataSetAction};
use crate::pipeline::chain::{ActionInterceptor, ActionObserver, Interception};
use log::{debug, info};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

/// Row predicate deciding derived membership.
pub type CaseFilter = Rc<dyn Fn(&NamedCase) -> bool>;

/// What to copy from the source and whether to keep following it.
#[derive(Clone, Default)]
pub struct DerivationSpec {
    /// Attribute subset to project; `None` keeps every source attribute.
    pub attribute_ids: Option<Vec<AttributeId>>,
    /// Row filter; `None` keeps every case.
    pub filter: Option<CaseFilter>,
    pub synchronize: bool,
}

impl DerivationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attributes<I, S>(mut self, attribute_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AttributeId>,
    {
        self.attribute_ids = Some(attribute_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, filter: impl Fn(&NamedCase) -> bool + 'static) -> Self {
        self.filter = Some(Rc::new(filter));
        self
    }

    pub fn synchronized(mut self) -> Self {
        self.synchronize = true;
        self
    }

    fn passes(&self, case: &NamedCase) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(case))
    }
}

impl Debug for DerivationSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationSpec")
            .field("attribute_ids", &self.attribute_ids)
            .field("filter", &self.filter.is_some())
            .field("synchronize", &self.synchronize)
            .finish()
    }
}

impl DataSet {
    /// Creates a derived data set from this one.
    ///
    /// The result is pre-populated with the projected attributes and the
    /// cases passing `spec.filter`, in source order. With
    /// `spec.synchronize`, it keeps following this store until
    /// `before_destroy` is called on it or it is dropped.
    pub fn derive(&self, name: Option<&str>, spec: DerivationSpec) -> ActionResult<DataSet> {
        let options = DataSetOptions::default()
            .with_name(name.map_or_else(|| self.name(), str::to_string))
            .with_id_generator(self.id_generator())
            .with_scheduler(self.scheduler().clone());
        let derived = DataSet::new(options);
        derived.set_source_id(Some(self.id()));

        let (attributes, cases) = self.with_table(|table| initial_contents(table, &spec));
        let attribute_count = attributes.len();
        for snapshot in attributes {
            derived.add_attribute_with_id(snapshot, None)?;
        }
        let case_count = cases.len();
        derived.add_canonical_cases_with_ids(cases, CaseInsertion::Append)?;

        if spec.synchronize {
            let link = Rc::new(DerivationLink {
                derived: derived.downgrade(),
                attribute_ids: spec
                    .attribute_ids
                    .as_ref()
                    .map(|ids| ids.iter().cloned().collect()),
                spec,
                pending: Rc::new(RefCell::new(HashMap::new())),
                staged: RefCell::new(Vec::new()),
            });
            let interceptor = self.add_interceptor(link.clone());
            let observer = self.add_observer(link);
            derived.set_upstream(Upstream {
                source: Rc::downgrade(&self.shared),
                interceptor,
                observer,
            });
        }

        info!(
            "event=derive module=derive status=ok source={} derived={} attributes={} cases={} synchronized={}",
            self.id(),
            derived.id(),
            attribute_count,
            case_count,
            derived.is_subscribed_to_source()
        );
        Ok(derived)
    }
}

fn initial_contents(
    source: &Table,
    spec: &DerivationSpec,
) -> (Vec<AttributeSnapshot>, Vec<CanonicalCase>) {
    let attributes: Vec<AttributeSnapshot> = match &spec.attribute_ids {
        Some(ids) => ids
            .iter()
            .filter_map(|attribute_id| source.attribute(attribute_id))
            .map(Attribute::derive)
            .collect(),
        None => source.attributes().iter().map(Attribute::derive).collect(),
    };
    let tracked: HashSet<&str> = attributes
        .iter()
        .filter_map(|snapshot| snapshot.id.as_deref())
        .collect();

    let cases = source
        .case_ids()
        .iter()
        .filter(|case_id| {
            source
                .named_case(case_id)
                .is_some_and(|case| spec.passes(&case))
        })
        .filter_map(|case_id| source.canonical_case(case_id))
        .map(|mut case| {
            case.values
                .retain(|attribute_id, _| tracked.contains(attribute_id.as_str()));
            case
        })
        .collect();
    (attributes, cases)
}

/// Derived effects planned for one source action that has not applied yet.
struct StagedPlan {
    action: DataSetAction,
    effects: Vec<DataSetAction>,
    overlay: HashMap<CaseId, bool>,
}

/// Interceptor and observer registered on the source of a synchronized
/// derivation. Plans on intercept, queues on observe.
struct DerivationLink {
    derived: WeakDataSet,
    spec: DerivationSpec,
    attribute_ids: Option<HashSet<AttributeId>>,
    /// Membership changes queued for the derived store but not yet applied.
    /// Cleared whenever the derived store's in-flight count returns to zero.
    pending: Rc<RefCell<HashMap<CaseId, bool>>>,
    /// Plans awaiting the source apply, innermost dispatch last.
    staged: RefCell<Vec<StagedPlan>>,
}

impl DerivationLink {
    fn take_staged(&self, action: &DataSetAction) -> Option<StagedPlan> {
        let mut staged = self.staged.borrow_mut();
        let index = staged.iter().rposition(|plan| plan.action == *action)?;
        Some(staged.remove(index))
    }
}

impl ActionInterceptor for DerivationLink {
    fn intercept(&self, source: &DataSet, action: &DataSetAction) -> ActionResult<Interception> {
        let Some(derived) = self.derived.upgrade() else {
            return Ok(Interception::Proceed);
        };
        if derived.is_destroyed() {
            return Ok(Interception::Proceed);
        }

        let mut overlay = HashMap::new();
        let effects = {
            let source_table = source.table();
            let derived_table = derived.table();
            let pending = self.pending.borrow();
            let mut planner = Planner {
                source: &source_table,
                derived: &derived_table,
                pending: &pending,
                overlay: &mut overlay,
                spec: &self.spec,
                attribute_ids: self.attribute_ids.as_ref(),
            };
            planner.plan(action)
        };
        if !effects.is_empty() {
            self.staged.borrow_mut().push(StagedPlan {
                action: action.clone(),
                effects,
                overlay,
            });
        }
        Ok(Interception::Proceed)
    }

    fn on_suppressed(&self, source: &DataSet, action: &DataSetAction) {
        if self.take_staged(action).is_some() {
            debug!(
                "event=derive_queue module=derive status=skip reason=suppressed source={} action={}",
                source.id(),
                action.name()
            );
        }
    }
}

impl ActionObserver for DerivationLink {
    fn on_action(&self, source: &DataSet, action: &DataSetAction) {
        let Some(plan) = self.take_staged(action) else {
            return;
        };
        let Some(derived) = self.derived.upgrade() else {
            return;
        };
        if derived.is_destroyed() {
            return;
        }

        debug!(
            "event=derive_queue module=derive status=ok source={} derived={} action={} effects={}",
            source.id(),
            derived.id(),
            action.name(),
            plan.effects.len()
        );
        self.pending.borrow_mut().extend(plan.overlay);
        derived.begin_flush();
        let target = derived.downgrade();
        let pending = Rc::clone(&self.pending);
        let effects = plan.effects;
        derived.scheduler().schedule(move || {
            let Some(derived) = target.upgrade() else {
                return;
            };
            // Detached between queueing and flushing.
            let effects = if derived.is_subscribed_to_source() {
                effects
            } else {
                Vec::new()
            };
            for effect in effects {
                if let Err(err) = derived.apply_action(effect) {
                    debug!(
                        "event=derive_flush module=derive status=skip derived={} error={}",
                        derived.id(),
                        err
                    );
                    break;
                }
            }
            if derived.end_flush() == 0 {
                pending.borrow_mut().clear();
            }
        });
    }
}

/// Computes derived effects for one source action.
struct Planner<'a> {
    source: &'a Table,
    derived: &'a Table,
    /// Queued membership from earlier source actions.
    pending: &'a HashMap<CaseId, bool>,
    /// Membership changes made by the action being planned.
    overlay: &'a mut HashMap<CaseId, bool>,
    spec: &'a DerivationSpec,
    attribute_ids: Option<&'a HashSet<AttributeId>>,
}

impl Planner<'_> {
    fn plan(&mut self, action: &DataSetAction) -> Vec<DataSetAction> {
        match action {
            DataSetAction::AddAttribute {
                snapshot,
                before_id,
            } => self.plan_add_attribute(snapshot, before_id.as_deref()),
            DataSetAction::RemoveAttribute { attribute_id } => {
                if self.attribute_ids.is_none() || self.derived.attribute(attribute_id).is_some() {
                    vec![action.clone()]
                } else {
                    Vec::new()
                }
            }
            DataSetAction::AddCases { cases, before } => self.plan_add_cases(cases, before),
            DataSetAction::SetCaseValues { cases } => {
                let canonical: Vec<CanonicalCase> = cases
                    .iter()
                    .map(|case| self.source.canonicalize(case))
                    .collect();
                self.plan_set_values(&canonical)
            }
            DataSetAction::SetCanonicalCaseValues { cases } => self.plan_set_values(cases),
            DataSetAction::RemoveCases { case_ids } => {
                let held: Vec<CaseId> = case_ids
                    .iter()
                    .filter(|case_id| self.is_member(case_id))
                    .cloned()
                    .collect();
                for case_id in &held {
                    self.overlay.insert(case_id.clone(), false);
                }
                if held.is_empty() {
                    Vec::new()
                } else {
                    vec![DataSetAction::RemoveCases { case_ids: held }]
                }
            }
            // Column order and naming are local to each store.
            DataSetAction::MoveAttribute { .. } | DataSetAction::SetAttributeName { .. } => {
                Vec::new()
            }
        }
    }

    fn is_member(&self, case_id: &str) -> bool {
        self.overlay
            .get(case_id)
            .or_else(|| self.pending.get(case_id))
            .copied()
            .unwrap_or_else(|| self.derived.contains_case(case_id))
    }

    /// First derived member at or after `start` in source order.
    fn member_from(&self, start: usize) -> Option<CaseId> {
        self.source.case_ids()[start.min(self.source.case_count())..]
            .iter()
            .find(|case_id| self.is_member(case_id))
            .cloned()
    }

    fn plan_add_attribute(
        &mut self,
        snapshot: &AttributeSnapshot,
        before_id: Option<&str>,
    ) -> Vec<DataSetAction> {
        if self.attribute_ids.is_some() {
            return Vec::new();
        }
        let Some(attribute_id) = snapshot.id.as_deref() else {
            return Vec::new();
        };
        // The source will skip it as well.
        if self.source.attribute(attribute_id).is_some()
            || self.source.attribute_by_name(&snapshot.name).is_some()
        {
            return Vec::new();
        }

        let mut derived_snapshot = snapshot.clone();
        derived_snapshot.source_id = Some(attribute_id.to_string());
        derived_snapshot.values = Vec::new();
        let mut effects = vec![DataSetAction::AddAttribute {
            snapshot: derived_snapshot,
            before_id: before_id.map(str::to_string),
        }];

        let seeded: Vec<CanonicalCase> = self
            .source
            .case_ids()
            .iter()
            .zip(snapshot.values.iter())
            .filter(|(case_id, value)| !value.is_absent() && self.is_member(case_id))
            .map(|(case_id, value)| {
                CanonicalCase::with_id(case_id.clone()).set(attribute_id, value.clone())
            })
            .collect();
        if !seeded.is_empty() {
            effects.push(DataSetAction::SetCanonicalCaseValues { cases: seeded });
        }
        effects
    }

    fn plan_add_cases(
        &mut self,
        cases: &[CanonicalCase],
        before: &CaseInsertion,
    ) -> Vec<DataSetAction> {
        let mut seen = HashSet::new();
        // Derived insertion point of batch cases that failed the filter, so a
        // later batch case placed before one of them lands correctly.
        let mut skipped_before: HashMap<CaseId, Option<CaseId>> = HashMap::new();
        let mut added = Vec::new();
        let mut added_before = Vec::new();

        for (batch_index, case) in cases.iter().enumerate() {
            let Some(case_id) = case.id.as_ref() else {
                continue;
            };
            if self.source.contains_case(case_id) || !seen.insert(case_id.clone()) {
                continue;
            }

            let target = match before.before_for(batch_index) {
                None => None,
                Some(before_id) if seen.contains(before_id) => {
                    if self.is_member(before_id) {
                        Some(before_id.to_string())
                    } else {
                        skipped_before.get(before_id).cloned().flatten()
                    }
                }
                Some(before_id) => self
                    .source
                    .case_index(before_id)
                    .and_then(|position| self.member_from(position)),
            };

            if self.spec.passes(&self.source.to_named(case)) {
                self.overlay.insert(case_id.clone(), true);
                added.push(case.clone());
                added_before.push(target);
            } else {
                skipped_before.insert(case_id.clone(), target);
            }
        }

        if added.is_empty() {
            return Vec::new();
        }
        vec![DataSetAction::AddCases {
            cases: added,
            before: CaseInsertion::Each(added_before),
        }]
    }

    /// Value updates plus filter transitions, in the order: updates for
    /// retained members, removals, additions.
    fn plan_set_values(&mut self, cases: &[CanonicalCase]) -> Vec<DataSetAction> {
        let mut updates = Vec::new();
        let mut removals = Vec::new();
        let mut entering = Vec::new();

        for case in cases {
            let Some(case_id) = case.id.as_deref() else {
                continue;
            };
            let Some(mut merged) = self.source.canonical_case(case_id) else {
                continue;
            };
            for (attribute_id, value) in &case.values {
                if merged.values.contains_key(attribute_id) {
                    merged.values.insert(attribute_id.clone(), value.clone());
                }
            }

            let member = self.is_member(case_id);
            let passes =
                self.spec.filter.is_none() || self.spec.passes(&self.source.to_named(&merged));
            match (member, passes) {
                (true, true) => updates.push(case.clone()),
                (true, false) => removals.push(case_id.to_string()),
                (false, true) if self.spec.filter.is_some() => entering.push(merged),
                _ => {}
            }
        }

        let mut effects = Vec::new();
        if !updates.is_empty() {
            effects.push(DataSetAction::SetCanonicalCaseValues { cases: updates });
        }
        if !removals.is_empty() {
            for case_id in &removals {
                self.overlay.insert(case_id.clone(), false);
            }
            effects.push(DataSetAction::RemoveCases { case_ids: removals });
        }
        if !entering.is_empty() {
            let mut before = Vec::with_capacity(entering.len());
            for case in &entering {
                let Some(case_id) = case.id.as_deref() else {
                    continue;
                };
                let next = self
                    .source
                    .case_index(case_id)
                    .and_then(|position| self.member_from(position + 1));
                self.overlay.insert(case_id.to_string(), true);
                before.push(next);
            }
            effects.push(DataSetAction::AddCases {
                cases: entering,
                before: CaseInsertion::Each(before),
            });
        }
        effects
    }
}
