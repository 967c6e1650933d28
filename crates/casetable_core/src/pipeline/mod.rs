//! Action interception pipeline.
//!
//! # Responsibility
//! - Define the closed action set every data set mutation goes through.
//! - Let other components intercept actions before they apply and observe
//!   them afterwards.
//!
//! # Invariants
//! - Interception happens before the default apply; observation after.

pub mod action;
pub mod chain;
pub mod action_log;
