//! Single-threaded deferred work queue.
//!
//! # Responsibility
//! - Break synchronous recursion between stores: work scheduled while an
//!   action is being dispatched runs on a later tick.
//! - Deliver remote store notifications in the order they were produced.
//!
//! # Invariants
//! - Tasks run in FIFO order, one per tick.
//! - No queue borrow is held while a task runs, so tasks may schedule more
//!   tasks.

use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

/// Upper bound on ticks drained by `run_until_idle`.
pub const DEFAULT_TICK_LIMIT: usize = 100_000;

/// Cloneable handle to one shared work queue.
#[derive(Clone, Default)]
pub struct Scheduler {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` to run on a later tick.
    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Runs one queued task. Returns `false` when the queue was empty.
    pub fn run_next(&self) -> bool {
        let task = self.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Drains the queue, including tasks scheduled while draining.
    ///
    /// Returns the number of tasks run. Stops after `DEFAULT_TICK_LIMIT`
    /// ticks so a feedback loop cannot hang the caller.
    pub fn run_until_idle(&self) -> usize {
        self.run_with_limit(DEFAULT_TICK_LIMIT)
    }

    pub fn run_with_limit(&self, max_ticks: usize) -> usize {
        let mut ran = 0;
        while ran < max_ticks && self.run_next() {
            ran += 1;
        }
        if ran == max_ticks && !self.is_idle() {
            warn!(
                "event=scheduler_drain module=scheduler status=limit ticks={} pending={}",
                ran,
                self.pending()
            );
        } else if ran > 0 {
            debug!("event=scheduler_drain module=scheduler status=ok ticks={ran}");
        }
        ran
    }

    pub fn same_queue(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.queue, &other.queue)
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
