//! Remote persistence: store primitives, the sync middleware and store
//! implementations.

pub mod error;
pub mod middleware;
pub mod phase;
pub mod remote_store;
pub mod sqlite_store;
