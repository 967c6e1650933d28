//! Recording observer for applied actions.

use crate::dataset::DataSet;
use crate::error::ActionResult;
use crate::pipeline::action::DataSetAction;
use crate::pipeline::chain::ActionObserver;
use log::debug;
use std::cell::RefCell;

/// Observer that keeps every applied action in order.
///
/// Replaying the recorded entries into a store cloned from the same starting
/// snapshot reproduces the recorded store's state.
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: RefCell<Vec<DataSetAction>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn entries(&self) -> Vec<DataSetAction> {
        self.entries.borrow().clone()
    }

    /// Returns recorded action names, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.borrow().iter().map(DataSetAction::name).collect()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Applies every recorded action to `target`, oldest first.
    pub fn replay_into(&self, target: &DataSet) -> ActionResult<()> {
        for action in self.entries() {
            target.apply_action(action)?;
        }
        Ok(())
    }
}

impl ActionObserver for ActionLog {
    fn on_action(&self, data_set: &DataSet, action: &DataSetAction) {
        debug!(
            "event=action_logged module=pipeline data_set={} action={}",
            data_set.id(),
            action.name()
        );
        self.entries.borrow_mut().push(action.clone());
    }
}
