//! Action dispatch errors.
//!
//! Business-level problems (unknown ids, malformed entries) never surface
//! here: they degrade to no-ops inside the table. Only contract violations
//! and remote write failures reach the caller.

use crate::model::ids::DataSetId;
use crate::sync::error::RemoteError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ActionResult<T> = Result<T, ActionError>;

/// Error returned by `DataSet::apply_action` and its wrappers.
#[derive(Debug)]
pub enum ActionError {
    /// The data set was destroyed; no further actions are accepted.
    Destroyed(DataSetId),
    /// An interceptor forwarded the action remotely and the write failed.
    Remote(RemoteError),
}

impl Display for ActionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed(id) => write!(f, "data set was destroyed: {id}"),
            Self::Remote(err) => write!(f, "remote write failed: {err}"),
        }
    }
}

impl Error for ActionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Destroyed(_) => None,
            Self::Remote(err) => Some(err),
        }
    }
}

impl From<RemoteError> for ActionError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}
