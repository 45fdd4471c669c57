//! External collaborators: durable documents, session rows, cold-start
//! roster, media credentials and profile lookup.
//!
//! The core only talks to the traits below. Three adapters exist:
//!
//! | Adapter | Backing |
//! |---------|---------|
//! | [`HttpSessionApi`] | JSON REST API (reqwest) |
//! | [`RocksSessionStore`] | local RocksDB, LZ4 document bodies |
//! | [`MemoryStore`] | in-process maps, with failure injection |

pub mod http;
pub mod memory;
pub mod rocks;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::document::Language;
use crate::error::StoreError;
use crate::media::MediaGrant;
use crate::protocol::{ParticipantId, SessionId};

pub use http::HttpSessionApi;
pub use memory::MemoryStore;
pub use rocks::RocksSessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Live,
    Ended,
}

/// A session row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub host_id: ParticipantId,
    pub status: SessionStatus,
    /// Scheduled start, ms since epoch.
    pub scheduled_start: Option<u64>,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub code: String,
    pub language: Language,
}

/// One row of the cold-start participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub participant_id: ParticipantId,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub participant_id: ParticipantId,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<RosterEntry> for Profile {
    fn from(entry: RosterEntry) -> Self {
        Self {
            participant_id: entry.participant_id,
            name: entry.name,
            avatar_url: entry.avatar_url,
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn fetch_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<SessionRow, StoreError>>;

    /// `Ok(None)` when the session has no document yet.
    fn fetch_document(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<Option<StoredDocument>, StoreError>>;

    fn save_document(
        &self,
        session_id: SessionId,
        document: StoredDocument,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn fetch_roster(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<RosterEntry>, StoreError>>;
}

/// Issues a short-lived media credential per call join.
pub trait GrantIssuer: Send + Sync {
    fn issue_grant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<MediaGrant, StoreError>>;
}

pub trait ProfileLookup: Send + Sync {
    fn lookup_profile(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<Option<Profile>, StoreError>>;
}
