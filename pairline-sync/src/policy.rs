//! Reconciliation rules shared by every component.
//!
//! - Self-authored updates are never re-applied.
//! - Documents: the last update received wins.
//! - Timestamps are monotonic per sender; reordering within one sender is
//!   dropped, no ordering is attempted across senders.
//! - Removing a participant from the roster purges their media.
//! - A "live" session past its scheduled end is read as ended.

use std::collections::HashMap;
use std::fmt;

use crate::error::{MediaError, StoreError, SyncError, TransportError};
use crate::protocol::ParticipantId;
use crate::store::{SessionRow, SessionStatus};

/// How long past its scheduled end a live session is still trusted.
pub const LIVE_GRACE_MS: u64 = 30 * 60 * 1000;

/// Whether an inbound update should be applied at all.
pub fn accepts_remote(local: ParticipantId, sender: ParticipantId) -> bool {
    local != sender
}

/// Last timestamp applied per sender.
#[derive(Debug, Default, Clone)]
pub struct SenderClock {
    last: HashMap<ParticipantId, u64>,
}

impl SenderClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ts` from `sender`; false when it is older than what was
    /// already applied from the same sender.
    pub fn observe(&mut self, sender: ParticipantId, ts: u64) -> bool {
        match self.last.get(&sender) {
            Some(&last) if ts < last => false,
            _ => {
                self.last.insert(sender, ts);
                true
            }
        }
    }

    pub fn last(&self, sender: &ParticipantId) -> Option<u64> {
        self.last.get(sender).copied()
    }

    pub fn forget(&mut self, sender: &ParticipantId) {
        self.last.remove(sender);
    }
}

/// Status of a session as it should be read at `now_ms`.
pub fn effective_status(row: &SessionRow, now_ms: u64) -> SessionStatus {
    if row.status != SessionStatus::Live {
        return row.status;
    }
    let Some(start) = row.scheduled_start else {
        return SessionStatus::Live;
    };
    let end = start
        .saturating_add(u64::from(row.duration_minutes) * 60_000)
        .saturating_add(LIVE_GRACE_MS);
    if now_ms > end {
        SessionStatus::Ended
    } else {
        SessionStatus::Live
    }
}

/// Error classes surfaced to the UI. Nothing is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity; the transport retries on its own.
    Connectivity,
    /// The current call attempt was aborted.
    Media,
    /// Logged; the next save cycle supersedes it.
    Persistence,
    /// The session was left; the action was ignored.
    Closed,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::Media => "media",
            ErrorClass::Persistence => "persistence",
            ErrorClass::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub fn classify(error: &SyncError) -> ErrorClass {
    match error {
        SyncError::Transport(_) | SyncError::Protocol(_) => ErrorClass::Connectivity,
        SyncError::Media(_) => ErrorClass::Media,
        SyncError::Store(_) => ErrorClass::Persistence,
        SyncError::SessionClosed => ErrorClass::Closed,
    }
}

impl From<&TransportError> for ErrorClass {
    fn from(_: &TransportError) -> Self {
        ErrorClass::Connectivity
    }
}

impl From<&MediaError> for ErrorClass {
    fn from(_: &MediaError) -> Self {
        ErrorClass::Media
    }
}

impl From<&StoreError> for ErrorClass {
    fn from(_: &StoreError) -> Self {
        ErrorClass::Persistence
    }
}
