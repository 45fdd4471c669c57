//! In-memory store for tests and the single-process demo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use uuid::Uuid;

use super::{
    GrantIssuer, Profile, ProfileLookup, RosterEntry, SessionRow, SessionStore, StoredDocument,
};
use crate::error::StoreError;
use crate::media::MediaGrant;
use crate::protocol::{now_millis, ParticipantId, SessionId};

const GRANT_TTL_MS: u64 = 10 * 60 * 1000;

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRow>,
    documents: HashMap<SessionId, StoredDocument>,
    rosters: HashMap<SessionId, Vec<RosterEntry>>,
    profiles: HashMap<ParticipantId, Profile>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_saves: AtomicBool,
    fail_grants: AtomicBool,
    saves: AtomicUsize,
    grants: AtomicUsize,
    lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_session(&self, row: SessionRow) {
        self.tables().sessions.insert(row.id, row);
    }

    pub fn insert_document(&self, session_id: SessionId, document: StoredDocument) {
        self.tables().documents.insert(session_id, document);
    }

    pub fn insert_roster(&self, session_id: SessionId, roster: Vec<RosterEntry>) {
        self.tables().rosters.insert(session_id, roster);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.tables().profiles.insert(profile.participant_id, profile);
    }

    pub fn document(&self, session_id: &SessionId) -> Option<StoredDocument> {
        self.tables().documents.get(session_id).cloned()
    }

    /// Make every later save fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_grants(&self, fail: bool) {
        self.fail_grants.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn grant_count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SessionStore for MemoryStore {
    fn fetch_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<SessionRow, StoreError>> {
        Box::pin(async move {
            self.tables()
                .sessions
                .get(&session_id)
                .cloned()
                .ok_or(StoreError::NotFound(session_id))
        })
    }

    fn fetch_document(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<Option<StoredDocument>, StoreError>> {
        Box::pin(async move { Ok(self.tables().documents.get(&session_id).cloned()) })
    }

    fn save_document(
        &self,
        session_id: SessionId,
        document: StoredDocument,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Request("injected save failure".into()));
            }
            self.tables().documents.insert(session_id, document);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn fetch_roster(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<RosterEntry>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .rosters
                .get(&session_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}

impl GrantIssuer for MemoryStore {
    fn issue_grant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<MediaGrant, StoreError>> {
        Box::pin(async move {
            if self.fail_grants.load(Ordering::SeqCst) {
                return Err(StoreError::Request("injected grant failure".into()));
            }
            self.grants.fetch_add(1, Ordering::SeqCst);
            Ok(MediaGrant {
                token: format!("{session_id}:{participant_id}:{}", Uuid::new_v4()),
                url: "synthetic://sfu".into(),
                expires_at: now_millis() + GRANT_TTL_MS,
            })
        })
    }
}

impl ProfileLookup for MemoryStore {
    fn lookup_profile(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<Option<Profile>, StoreError>> {
        Box::pin(async move {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.tables().profiles.get(&participant_id).cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Language;
    use crate::store::SessionStatus;

    #[tokio::test]
    async fn test_document_roundtrip_and_counter() {
        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        assert_eq!(store.fetch_document(session).await.unwrap(), None);

        let doc = StoredDocument { code: "x".into(), language: Language::Go };
        store.save_document(session, doc.clone()).await.unwrap();
        assert_eq!(store.fetch_document(session).await.unwrap(), Some(doc));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        let doc = StoredDocument { code: "x".into(), language: Language::Go };
        assert!(store.save_document(Uuid::new_v4(), doc).await.is_err());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.fetch_session(id).await, Err(StoreError::NotFound(id)));

        let row = SessionRow {
            id,
            host_id: Uuid::new_v4(),
            status: SessionStatus::Live,
            scheduled_start: None,
            duration_minutes: 45,
        };
        store.insert_session(row.clone());
        assert_eq!(store.fetch_session(id).await, Ok(row));
    }

    #[tokio::test]
    async fn test_grants_and_profiles() {
        let store = MemoryStore::new();
        let grant = store.issue_grant(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        assert!(grant.expires_at > now_millis());
        assert_eq!(store.grant_count(), 1);

        let id = Uuid::new_v4();
        assert_eq!(store.lookup_profile(id).await.unwrap(), None);
        store.insert_profile(Profile { participant_id: id, name: Some("Ada".into()), avatar_url: None });
        assert_eq!(
            store.lookup_profile(id).await.unwrap().and_then(|p| p.name),
            Some("Ada".to_string())
        );
        assert_eq!(store.lookup_count(), 2);
    }
}
