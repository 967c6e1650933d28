//! Identifier types and injectable id generation.
//!
//! # Responsibility
//! - Name the string identifiers used for data sets, attributes and cases.
//! - Provide the `IdGenerator` capability injected into every data set.
//!
//! # Invariants
//! - A generator never returns the same id twice over its lifetime.

use std::cell::Cell;
use uuid::Uuid;

/// Opaque case identifier, unique within one data set.
pub type CaseId = String;

/// Immutable attribute identifier, unique within one data set.
pub type AttributeId = String;

/// Data set identifier.
pub type DataSetId = String;

/// Source of fresh identifiers for attributes, cases and data sets.
pub trait IdGenerator {
    fn next_id(&self) -> String;
}

/// Default generator producing random UUID v4 strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic generator yielding `<prefix><n>` with an increasing counter.
///
/// Intended for tests and replayable demos.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: Cell<u64>,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: Cell::new(1),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new("id-")
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let current = self.next.get();
        self.next.set(current + 1);
        format!("{}{}", self.prefix, current)
    }
}
