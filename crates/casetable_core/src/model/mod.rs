//! Tabular domain model.
//!
//! # Responsibility
//! - Define values, attributes, cases and identifiers shared by the data
//!   set, derivation and sync layers.
//! - Own the in-memory table state and its index maintenance (`table`).
//!
//! # Invariants
//! - Attributes and cases are identified by stable string ids.
//! - Table state is only mutated by applying `DataSetAction`s.

pub mod attribute;
pub mod case;
pub mod ids;
pub mod table;
pub mod value;
