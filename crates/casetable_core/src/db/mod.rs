//! On-disk backing for [`SqliteRemoteStore`](crate::SqliteRemoteStore).
//!
//! Every remote child lives as one `remote_children` row keyed by
//! `(region, child_key)` with a JSON payload. `seq` keeps first-insertion
//! order across rewrites, which is the order `RemoteStore::get` reports.
//! Connections come from [`open_db`] or [`open_db_in_memory`] and are
//! migrated before they are handed out.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The file was written by a newer build; refuse rather than guess.
    SchemaTooNew { found: u32, supported: u32 },
    /// A migration step failed and its transaction was rolled back.
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
}

impl DbError {
    pub(crate) fn migration(version: u32) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Migration { version, source }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "remote store file has schema v{found}, this build reads up to v{supported}"
            ),
            Self::Migration { version, source } => {
                write!(f, "migration to schema v{version} failed: {source}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
