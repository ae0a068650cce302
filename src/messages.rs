use std::fmt;

use chrono::{DateTime, Utc};

/// Control messages received from outside the poll loop.
#[derive(Clone, Debug, PartialEq)]
pub enum StateAnnouncement {
    /// Run a poll cycle now instead of waiting for the next tick.
    ScanRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceKind {
    Arrived,
    Departed,
}

impl fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceKind::Arrived => write!(f, "arrived"),
            PresenceKind::Departed => write!(f, "departed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PresenceEvent {
    pub person: String,
    pub kind: PresenceKind,
    pub timestamp: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn is_home(&self) -> bool {
        self.kind == PresenceKind::Arrived
    }
}
