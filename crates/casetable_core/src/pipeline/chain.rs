//! Interceptor and observer registry for one data set.
//!
//! # Responsibility
//! - Hold the ordered interceptor chain consulted before an action applies.
//! - Hold the observers notified after an action applied.
//!
//! # Invariants
//! - Interceptors run in registration order; the first `Suppress` stops the
//!   chain and skips the default apply. Interceptors that already proceeded
//!   are told through `on_suppressed`.
//! - Callbacks always run on a cloned list, so a callback may register or
//!   remove subscriptions without invalidating the iteration.

use crate::dataset::DataSet;
use crate::error::ActionResult;
use crate::pipeline::action::DataSetAction;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handle returned by registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Decision returned by an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// Continue down the chain and apply locally.
    Proceed,
    /// Stop here; the action does not touch local state.
    Suppress,
}

/// Runs before an action applies and may redirect it.
///
/// The data set state seen through `data_set` is the state *before* the
/// action applies.
pub trait ActionInterceptor {
    fn intercept(&self, data_set: &DataSet, action: &DataSetAction) -> ActionResult<Interception>;

    /// Called when this interceptor returned `Proceed` but a later one
    /// suppressed `action` or failed, so it never applies.
    fn on_suppressed(&self, _data_set: &DataSet, _action: &DataSetAction) {}
}

/// Runs after an action applied to local state.
pub trait ActionObserver {
    fn on_action(&self, data_set: &DataSet, action: &DataSetAction);
}

#[derive(Default)]
pub(crate) struct ActionPipeline {
    next_id: Cell<u64>,
    interceptors: RefCell<Vec<(SubscriptionId, Rc<dyn ActionInterceptor>)>>,
    observers: RefCell<Vec<(SubscriptionId, Rc<dyn ActionObserver>)>>,
}

impl ActionPipeline {
    pub(crate) fn add_interceptor(&self, interceptor: Rc<dyn ActionInterceptor>) -> SubscriptionId {
        let id = self.allocate_id();
        self.interceptors.borrow_mut().push((id, interceptor));
        id
    }

    /// Registers `interceptor` ahead of every existing one.
    pub(crate) fn prepend_interceptor(
        &self,
        interceptor: Rc<dyn ActionInterceptor>,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.interceptors.borrow_mut().insert(0, (id, interceptor));
        id
    }

    pub(crate) fn add_observer(&self, observer: Rc<dyn ActionObserver>) -> SubscriptionId {
        let id = self.allocate_id();
        self.observers.borrow_mut().push((id, observer));
        id
    }

    /// Removes one subscription of either kind. Returns `false` when unknown.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let removed_interceptor = {
            let mut interceptors = self.interceptors.borrow_mut();
            interceptors
                .iter()
                .position(|(entry_id, _)| *entry_id == id)
                .map(|index| interceptors.remove(index))
        };
        if removed_interceptor.is_some() {
            return true;
        }

        let removed_observer = {
            let mut observers = self.observers.borrow_mut();
            observers
                .iter()
                .position(|(entry_id, _)| *entry_id == id)
                .map(|index| observers.remove(index))
        };
        // Removed entries must drop after the borrow ends.
        removed_observer.is_some()
    }

    pub(crate) fn interceptors(&self) -> Vec<Rc<dyn ActionInterceptor>> {
        self.interceptors
            .borrow()
            .iter()
            .map(|(_, interceptor)| Rc::clone(interceptor))
            .collect()
    }

    pub(crate) fn observers(&self) -> Vec<Rc<dyn ActionObserver>> {
        self.observers
            .borrow()
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect()
    }

    pub(crate) fn interceptor_count(&self) -> usize {
        self.interceptors.borrow().len()
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    fn allocate_id(&self) -> SubscriptionId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        SubscriptionId(id)
    }
}
