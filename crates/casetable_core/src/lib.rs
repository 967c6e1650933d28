//! Core engine for casetable: tabular data sets, synchronized derived views
//! and remote persistence.
//! Every mutation goes through the action pipeline in `dataset`.

pub mod dataset;
pub mod db;
pub mod derive;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod sync;

pub use dataset::{DataSet, DataSetOptions, Synchronized, WeakDataSet};
pub use derive::{CaseFilter, DerivationSpec};
pub use error::{ActionError, ActionResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::attribute::{Attribute, AttributeSnapshot};
pub use model::case::{CanonicalCase, NamedCase};
pub use model::ids::{
    AttributeId, CaseId, DataSetId, IdGenerator, SequentialIdGenerator, UuidIdGenerator,
};
pub use model::table::DataSetSnapshot;
pub use model::value::Value;
pub use pipeline::action::{CaseInsertion, DataSetAction};
pub use pipeline::action_log::ActionLog;
pub use pipeline::chain::{ActionInterceptor, ActionObserver, Interception, SubscriptionId};
pub use scheduler::Scheduler;
pub use sync::error::{RemoteError, RemoteResult};
pub use sync::middleware::{RemoteSync, RemoteSyncOptions};
pub use sync::remote_store::{
    ListenerId, MemoryRemoteStore, RemoteEvent, RemoteListener, RemoteRecord, RemoteStore,
};
pub use sync::sqlite_store::SqliteRemoteStore;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
