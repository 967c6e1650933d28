//! Data set handle: action dispatch, reads and lifecycle.
//!
//! # Responsibility
//! - Funnel every mutation through `apply_action` and the interception
//!   pipeline.
//! - Expose the read API over the owned table.
//! - Track in-flight derived work and expose convergence (`on_synchronized`).
//!
//! # Invariants
//! - No `RefCell` borrow of the table is held while interceptors or
//!   observers run.
//! - A destroyed data set rejects actions with `ActionError::Destroyed`.
//! - A derived data set unsubscribes from its source on `before_destroy`
//!   and when its last handle drops.

use crate::error::{ActionError, ActionResult};
use crate::model::attribute::{Attribute, AttributeSnapshot};
use crate::model::case::{CanonicalCase, NamedCase};
use crate::model::ids::{AttributeId, CaseId, DataSetId, IdGenerator, UuidIdGenerator};
use crate::model::table::{DataSetSnapshot, Table};
use crate::model::value::Value;
use crate::pipeline::action::{CaseInsertion, DataSetAction};
use crate::pipeline::chain::{
    ActionInterceptor, ActionObserver, ActionPipeline, Interception, SubscriptionId,
};
use crate::scheduler::Scheduler;
use log::{debug, info};
use std::cell::{Cell, Ref, RefCell};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Construction options for a data set.
#[derive(Clone)]
pub struct DataSetOptions {
    /// Explicit id; generated from `ids` when `None`.
    pub id: Option<DataSetId>,
    pub name: String,
    pub read_only: bool,
    pub ids: Rc<dyn IdGenerator>,
    pub scheduler: Scheduler,
}

impl Default for DataSetOptions {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            read_only: false,
            ids: Rc::new(UuidIdGenerator),
            scheduler: Scheduler::new(),
        }
    }
}

impl DataSetOptions {
    pub fn with_id(mut self, id: impl Into<DataSetId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_id_generator(mut self, ids: Rc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// Subscription a derived data set holds on its source.
pub(crate) struct Upstream {
    pub(crate) source: Weak<DataSetShared>,
    pub(crate) interceptor: SubscriptionId,
    pub(crate) observer: SubscriptionId,
}

impl Upstream {
    fn release(self) {
        if let Some(source) = self.source.upgrade() {
            source.pipeline.remove(self.interceptor);
            source.pipeline.remove(self.observer);
        }
    }
}

pub(crate) struct DataSetShared {
    table: RefCell<Table>,
    pipeline: ActionPipeline,
    ids: Rc<dyn IdGenerator>,
    scheduler: Scheduler,
    read_only: Cell<bool>,
    destroyed: Cell<bool>,
    in_flight: Cell<usize>,
    wakers: RefCell<Vec<Waker>>,
    upstream: RefCell<Option<Upstream>>,
}

impl DataSetShared {
    fn detach_upstream(&self) -> bool {
        let Some(upstream) = self.upstream.borrow_mut().take() else {
            return false;
        };
        upstream.release();
        true
    }

    fn is_synchronizing(&self) -> bool {
        if self.in_flight.get() > 0 {
            return true;
        }
        self.upstream_source()
            .is_some_and(|source| source.is_synchronizing())
    }

    fn upstream_source(&self) -> Option<Rc<DataSetShared>> {
        self.upstream
            .borrow()
            .as_ref()
            .and_then(|upstream| upstream.source.upgrade())
    }

    fn register_waker(&self, waker: &Waker) {
        if self.in_flight.get() > 0 {
            self.wakers.borrow_mut().push(waker.clone());
        }
        if let Some(source) = self.upstream_source() {
            source.register_waker(waker);
        }
    }
}

impl Drop for DataSetShared {
    fn drop(&mut self) {
        if let Some(upstream) = self.upstream.get_mut().take() {
            upstream.release();
        }
    }
}

/// Cloneable handle to one tabular store.
#[derive(Clone)]
pub struct DataSet {
    pub(crate) shared: Rc<DataSetShared>,
}

/// Non-owning data set handle.
#[derive(Clone, Default)]
pub struct WeakDataSet {
    shared: Weak<DataSetShared>,
}

impl WeakDataSet {
    pub fn upgrade(&self) -> Option<DataSet> {
        self.shared.upgrade().map(|shared| DataSet { shared })
    }
}

impl DataSet {
    pub fn new(options: DataSetOptions) -> Self {
        let id = options.id.unwrap_or_else(|| options.ids.next_id());
        let table = Table::new(id, options.name);
        Self {
            shared: Rc::new(DataSetShared {
                table: RefCell::new(table),
                pipeline: ActionPipeline::default(),
                ids: options.ids,
                scheduler: options.scheduler,
                read_only: Cell::new(options.read_only),
                destroyed: Cell::new(false),
                in_flight: Cell::new(0),
                wakers: RefCell::new(Vec::new()),
                upstream: RefCell::new(None),
            }),
        }
    }

    /// Creates a store holding a copy of `snapshot`, with no subscriptions.
    pub fn from_snapshot(snapshot: DataSetSnapshot, options: DataSetOptions) -> Self {
        let data_set = Self::new(options);
        *data_set.shared.table.borrow_mut() = Table::from_snapshot(snapshot);
        data_set
    }

    pub fn downgrade(&self) -> WeakDataSet {
        WeakDataSet {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn ptr_eq(&self, other: &DataSet) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn id(&self) -> DataSetId {
        self.shared.table.borrow().id().to_string()
    }

    pub fn source_id(&self) -> Option<DataSetId> {
        self.shared.table.borrow().source_id().map(str::to_string)
    }

    pub fn name(&self) -> String {
        self.shared.table.borrow().name().to_string()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.get()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.set(read_only);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.get()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn id_generator(&self) -> Rc<dyn IdGenerator> {
        Rc::clone(&self.shared.ids)
    }

    /// Borrows the table for reads.
    ///
    /// The borrow must not be held across calls that dispatch actions.
    pub fn table(&self) -> Ref<'_, Table> {
        self.shared.table.borrow()
    }

    pub fn with_table<R>(&self, read: impl FnOnce(&Table) -> R) -> R {
        read(&self.shared.table.borrow())
    }

    pub fn snapshot(&self) -> DataSetSnapshot {
        self.shared.table.borrow().snapshot()
    }

    pub(crate) fn set_source_id(&self, source_id: Option<DataSetId>) {
        self.shared.table.borrow_mut().set_source_id(source_id);
    }

    pub(crate) fn set_name_from_remote(&self, name: &str) {
        self.shared.table.borrow_mut().set_name(name);
    }

    // ---- pipeline -----------------------------------------------------------

    pub fn add_interceptor(&self, interceptor: Rc<dyn ActionInterceptor>) -> SubscriptionId {
        self.shared.pipeline.add_interceptor(interceptor)
    }

    /// Registers an interceptor that runs before all existing ones, so a
    /// suppressing interceptor hides the action from the rest of the chain.
    pub fn prepend_interceptor(&self, interceptor: Rc<dyn ActionInterceptor>) -> SubscriptionId {
        self.shared.pipeline.prepend_interceptor(interceptor)
    }

    pub fn add_observer(&self, observer: Rc<dyn ActionObserver>) -> SubscriptionId {
        self.shared.pipeline.add_observer(observer)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.shared.pipeline.remove(subscription)
    }

    pub fn interceptor_count(&self) -> usize {
        self.shared.pipeline.interceptor_count()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.pipeline.observer_count()
    }

    /// Dispatches one action through interceptors, the table and observers.
    pub fn apply_action(&self, action: DataSetAction) -> ActionResult<()> {
        if self.is_destroyed() {
            return Err(ActionError::Destroyed(self.id()));
        }

        let interceptors = self.shared.pipeline.interceptors();
        for (index, interceptor) in interceptors.iter().enumerate() {
            let decision = interceptor.intercept(self, &action);
            if matches!(decision, Ok(Interception::Proceed)) {
                continue;
            }
            // Interceptors that already let the action through learn it
            // will not apply after all.
            for earlier in interceptors[..index].iter().rev() {
                earlier.on_suppressed(self, &action);
            }
            decision?;
            debug!(
                "event=action_apply module=dataset status=suppressed data_set={} action={}",
                self.id(),
                action.name()
            );
            return Ok(());
        }

        let changed = self.shared.table.borrow_mut().apply(&action);
        debug!(
            "event=action_apply module=dataset status=ok data_set={} action={} changed={}",
            self.id(),
            action.name(),
            changed
        );

        for observer in self.shared.pipeline.observers() {
            observer.on_action(self, &action);
        }
        Ok(())
    }

    // ---- actions -----------------------------------------------------------

    pub fn add_attribute_with_id(
        &self,
        snapshot: AttributeSnapshot,
        before_id: Option<&str>,
    ) -> ActionResult<()> {
        self.apply_action(DataSetAction::AddAttribute {
            snapshot,
            before_id: before_id.map(str::to_string),
        })
    }

    /// Adds an attribute, generating its id when missing. Returns the id.
    pub fn add_attribute_to_data_set(
        &self,
        mut snapshot: AttributeSnapshot,
        before_id: Option<&str>,
    ) -> ActionResult<AttributeId> {
        let attribute_id = match snapshot.id.clone() {
            Some(attribute_id) => attribute_id,
            None => {
                let generated = self.shared.ids.next_id();
                snapshot.id = Some(generated.clone());
                generated
            }
        };
        self.add_attribute_with_id(snapshot, before_id)?;
        Ok(attribute_id)
    }

    pub fn remove_attribute(&self, attribute_id: &str) -> ActionResult<()> {
        self.apply_action(DataSetAction::RemoveAttribute {
            attribute_id: attribute_id.to_string(),
        })
    }

    pub fn move_attribute(&self, attribute_id: &str, before_id: Option<&str>) -> ActionResult<()> {
        self.apply_action(DataSetAction::MoveAttribute {
            attribute_id: attribute_id.to_string(),
            before_id: before_id.map(str::to_string),
        })
    }

    pub fn set_attribute_name(&self, attribute_id: &str, name: &str) -> ActionResult<()> {
        self.apply_action(DataSetAction::SetAttributeName {
            attribute_id: attribute_id.to_string(),
            name: name.to_string(),
        })
    }

    /// Adds named cases; every case must already carry an id.
    pub fn add_cases_with_ids(
        &self,
        cases: &[NamedCase],
        before: CaseInsertion,
    ) -> ActionResult<()> {
        let canonical = self.with_table(|table| {
            cases
                .iter()
                .map(|case| table.canonicalize(case))
                .collect::<Vec<_>>()
        });
        self.add_canonical_cases_with_ids(canonical, before)
    }

    pub fn add_canonical_cases_with_ids(
        &self,
        cases: Vec<CanonicalCase>,
        before: CaseInsertion,
    ) -> ActionResult<()> {
        self.apply_action(DataSetAction::AddCases { cases, before })
    }

    /// Adds named cases, generating ids for cases without one.
    ///
    /// Returns the ids in input order.
    pub fn add_cases_to_data_set(
        &self,
        cases: &[NamedCase],
        before: CaseInsertion,
    ) -> ActionResult<Vec<CaseId>> {
        let with_ids: Vec<NamedCase> = cases
            .iter()
            .map(|case| {
                let mut case = case.clone();
                if case.id.is_none() {
                    case.id = Some(self.shared.ids.next_id());
                }
                case
            })
            .collect();
        let ids = with_ids
            .iter()
            .filter_map(|case| case.id.clone())
            .collect();
        self.add_cases_with_ids(&with_ids, before)?;
        Ok(ids)
    }

    pub fn set_case_values(&self, cases: Vec<NamedCase>) -> ActionResult<()> {
        self.apply_action(DataSetAction::SetCaseValues { cases })
    }

    pub fn set_canonical_case_values(&self, cases: Vec<CanonicalCase>) -> ActionResult<()> {
        self.apply_action(DataSetAction::SetCanonicalCaseValues { cases })
    }

    pub fn remove_cases(&self, case_ids: &[&str]) -> ActionResult<()> {
        self.apply_action(DataSetAction::RemoveCases {
            case_ids: case_ids.iter().map(|id| id.to_string()).collect(),
        })
    }

    // ---- reads ---------------------------------------------------------------

    pub fn attributes(&self) -> Vec<Attribute> {
        self.shared.table.borrow().attributes().to_vec()
    }

    pub fn attr_from_id(&self, attribute_id: &str) -> Option<Attribute> {
        self.shared.table.borrow().attribute(attribute_id).cloned()
    }

    pub fn attr_from_name(&self, name: &str) -> Option<Attribute> {
        self.shared.table.borrow().attribute_by_name(name).cloned()
    }

    pub fn case_ids(&self) -> Vec<CaseId> {
        self.shared.table.borrow().case_ids().to_vec()
    }

    pub fn case_count(&self) -> usize {
        self.shared.table.borrow().case_count()
    }

    pub fn case_index_from_id(&self, case_id: &str) -> Option<usize> {
        self.shared.table.borrow().case_index(case_id)
    }

    pub fn next_case_id(&self, case_id: &str) -> Option<CaseId> {
        self.shared
            .table
            .borrow()
            .next_case_id(case_id)
            .map(str::to_string)
    }

    pub fn get_value(&self, case_id: &str, attribute_id: &str) -> Option<Value> {
        self.shared
            .table
            .borrow()
            .value(case_id, attribute_id)
            .cloned()
    }

    pub fn get_case(&self, case_id: &str) -> Option<NamedCase> {
        self.shared.table.borrow().named_case(case_id)
    }

    pub fn get_canonical_case(&self, case_id: &str) -> Option<CanonicalCase> {
        self.shared.table.borrow().canonical_case(case_id)
    }

    /// Returns the named cases for `case_ids`, skipping unknown ids.
    pub fn get_cases(&self, case_ids: &[&str]) -> Vec<NamedCase> {
        let table = self.shared.table.borrow();
        case_ids
            .iter()
            .filter_map(|case_id| table.named_case(case_id))
            .collect()
    }

    pub fn get_canonical_cases(&self, case_ids: &[&str]) -> Vec<CanonicalCase> {
        let table = self.shared.table.borrow();
        case_ids
            .iter()
            .filter_map(|case_id| table.canonical_case(case_id))
            .collect()
    }

    pub fn get_case_at_index(&self, index: usize) -> Option<NamedCase> {
        self.shared.table.borrow().named_case_at(index)
    }

    // ---- synchronization -----------------------------------------------------

    /// Whether derived work targeting this store, or any store it derives
    /// from, is still queued.
    pub fn is_synchronizing(&self) -> bool {
        self.shared.is_synchronizing()
    }

    /// Completion that resolves once `is_synchronizing()` turns false.
    ///
    /// Already complete when nothing is in flight.
    pub fn on_synchronized(&self) -> Synchronized {
        Synchronized {
            target: Rc::downgrade(&self.shared),
        }
    }

    pub(crate) fn begin_flush(&self) {
        let shared = &self.shared;
        shared.in_flight.set(shared.in_flight.get() + 1);
    }

    /// Returns the remaining in-flight count.
    pub(crate) fn end_flush(&self) -> usize {
        let shared = &self.shared;
        let remaining = shared.in_flight.get().saturating_sub(1);
        shared.in_flight.set(remaining);
        if remaining == 0 {
            let wakers = std::mem::take(&mut *shared.wakers.borrow_mut());
            for waker in wakers {
                waker.wake();
            }
        }
        remaining
    }

    // ---- lifecycle -----------------------------------------------------------

    pub(crate) fn set_upstream(&self, upstream: Upstream) {
        *self.shared.upstream.borrow_mut() = Some(upstream);
    }

    pub fn is_subscribed_to_source(&self) -> bool {
        self.shared.upstream.borrow().is_some()
    }

    /// Unsubscribes from the source store, if any. Idempotent.
    pub fn before_destroy(&self) {
        if self.shared.detach_upstream() {
            info!(
                "event=derive_detach module=dataset status=ok data_set={}",
                self.id()
            );
        }
    }

    /// Detaches and rejects every later action. Idempotent.
    pub fn destroy(&self) {
        self.before_destroy();
        self.shared.destroyed.set(true);
    }
}

impl Debug for DataSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.table.borrow();
        f.debug_struct("DataSet")
            .field("id", &table.id())
            .field("name", &table.name())
            .field("attributes", &table.attributes().len())
            .field("cases", &table.case_count())
            .finish()
    }
}

/// Completion returned by `DataSet::on_synchronized`.
///
/// Usable either by polling `is_complete()` between scheduler ticks or as a
/// `Future`.
#[derive(Clone)]
pub struct Synchronized {
    target: Weak<DataSetShared>,
}

impl Synchronized {
    /// A dropped store counts as settled.
    pub fn is_complete(&self) -> bool {
        self.target
            .upgrade()
            .map_or(true, |shared| !shared.is_synchronizing())
    }
}

impl Future for Synchronized {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.target.upgrade() {
            Some(shared) if shared.is_synchronizing() => {
                shared.register_waker(cx.waker());
                Poll::Pending
            }
            _ => Poll::Ready(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataSet, DataSetOptions};
    use crate::model::attribute::AttributeSnapshot;
    use crate::model::case::NamedCase;
    use crate::model::ids::SequentialIdGenerator;
    use crate::pipeline::action::CaseInsertion;
    use std::rc::Rc;

    fn data_set() -> DataSet {
        DataSet::new(
            DataSetOptions::default()
                .with_name("People")
                .with_id_generator(Rc::new(SequentialIdGenerator::new("id-"))),
        )
    }

    #[test]
    fn wrappers_generate_missing_ids() {
        let data_set = data_set();
        assert_eq!(data_set.id(), "id-1");

        let attribute_id = data_set
            .add_attribute_to_data_set(AttributeSnapshot::named("age"), None)
            .expect("attribute should be added");
        assert_eq!(attribute_id, "id-2");

        let ids = data_set
            .add_cases_to_data_set(
                &[NamedCase::new().set("age", 30.0), NamedCase::with_id("fixed")],
                CaseInsertion::Append,
            )
            .expect("cases should be added");
        assert_eq!(ids, vec!["id-3".to_string(), "fixed".to_string()]);
        assert_eq!(
            data_set.get_value("id-3", &attribute_id).and_then(|v| v.as_number()),
            Some(30.0)
        );
    }

    #[test]
    fn destroyed_data_set_rejects_actions() {
        let data_set = data_set();
        data_set.destroy();
        data_set.destroy();
        let err = data_set
            .remove_attribute("anything")
            .expect_err("destroyed store must reject actions");
        assert!(err.to_string().contains("destroyed"));
    }

    #[test]
    fn idle_store_is_already_synchronized() {
        let data_set = data_set();
        assert!(!data_set.is_synchronizing());
        assert!(data_set.on_synchronized().is_complete());
    }
}
