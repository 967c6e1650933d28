//! Remote store error types.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug)]
pub enum RemoteError {
    /// The store cannot be reached; nothing was written.
    Unavailable(String),
    /// A stored record could not be interpreted.
    InvalidRecord {
        region: String,
        key: String,
        message: String,
    },
    Serialization(serde_json::Error),
    Db(DbError),
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "remote store unavailable: {reason}"),
            Self::InvalidRecord {
                region,
                key,
                message,
            } => write!(f, "invalid remote record `{region}/{key}`: {message}"),
            Self::Serialization(err) => write!(f, "remote payload serialization failed: {err}"),
            Self::Db(err) => write!(f, "remote store database error: {err}"),
        }
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unavailable(_) | Self::InvalidRecord { .. } => None,
            Self::Serialization(err) => Some(err),
            Self::Db(err) => Some(err),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

impl From<DbError> for RemoteError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RemoteError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}
