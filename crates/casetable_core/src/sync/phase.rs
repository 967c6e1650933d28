//! Middleware state machine separating local edits from remote replays.

use std::collections::VecDeque;

/// Remote region a write or event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Properties,
    Attributes,
    Cases,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Properties, Region::Attributes, Region::Cases];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Attributes => "attributes",
            Self::Cases => "cases",
        }
    }
}

/// A local write whose echo has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub region: Region,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// No local write outstanding.
    #[default]
    Idle,
    /// Local writes forwarded; their echoes are still on the way.
    AwaitingEcho(VecDeque<PendingWrite>),
    /// A remote-origin change is being applied locally. Actions seen in this
    /// phase apply locally and are never forwarded.
    ApplyingRemote { awaiting: VecDeque<PendingWrite> },
}

impl SyncPhase {
    pub fn is_applying_remote(&self) -> bool {
        matches!(self, Self::ApplyingRemote { .. })
    }

    pub fn pending(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::AwaitingEcho(awaiting) | Self::ApplyingRemote { awaiting } => awaiting.len(),
        }
    }

    /// Whether a write to `key` in `region` still awaits its echo.
    pub fn is_awaiting(&self, region: Region, key: &str) -> bool {
        match self {
            Self::Idle => false,
            Self::AwaitingEcho(awaiting) | Self::ApplyingRemote { awaiting } => awaiting
                .iter()
                .any(|write| write.region == region && write.key == key),
        }
    }

    pub fn record_write(&mut self, write: PendingWrite) {
        match self {
            Self::Idle => *self = Self::AwaitingEcho(VecDeque::from([write])),
            Self::AwaitingEcho(awaiting) | Self::ApplyingRemote { awaiting } => {
                awaiting.push_back(write)
            }
        }
    }

    /// Consumes the oldest pending write matching the event, if any.
    /// Returns whether the event echoes one of our writes.
    pub fn acknowledge(&mut self, region: Region, key: &str) -> bool {
        let (Self::AwaitingEcho(awaiting) | Self::ApplyingRemote { awaiting }) = self else {
            return false;
        };
        let Some(index) = awaiting
            .iter()
            .position(|write| write.region == region && write.key == key)
        else {
            return false;
        };
        awaiting.remove(index);
        if awaiting.is_empty() && matches!(self, Self::AwaitingEcho(_)) {
            *self = Self::Idle;
        }
        true
    }

    /// Enters `ApplyingRemote`. Returns `false` when already applying.
    pub fn begin_remote(&mut self) -> bool {
        let awaiting = match std::mem::take(self) {
            Self::Idle => VecDeque::new(),
            Self::AwaitingEcho(awaiting) => awaiting,
            applying @ Self::ApplyingRemote { .. } => {
                *self = applying;
                return false;
            }
        };
        *self = Self::ApplyingRemote { awaiting };
        true
    }

    pub fn end_remote(&mut self) {
        if let Self::ApplyingRemote { awaiting } = std::mem::take(self) {
            *self = if awaiting.is_empty() {
                Self::Idle
            } else {
                Self::AwaitingEcho(awaiting)
            };
        }
    }
}
