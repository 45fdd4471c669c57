//! Document sync engine.
//!
//! Whole-document replacement with last-write-wins. Two independent flows
//! leave every local edit:
//!
//! ```text
//! local_edit ──► CodeChange (published immediately)
//!      └──────► save debounce ──[2 s quiet]──► poll_save() ──► store
//! ```
//!
//! Remote updates are applied when they come from someone else and are not
//! older than the last update applied from that same sender. Receivers never
//! persist; the author's own debounce does.

mod templates;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::debounce::DebouncedAction;
use crate::policy::{accepts_remote, SenderClock};
use crate::protocol::{now_millis, ChannelEvent, ParticipantId, SessionId};
use crate::store::{SessionStore, StoredDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
    TypeScript,
    Java,
    Cpp,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::Cpp,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }

    /// Starter code a document is reset to on a language change.
    pub fn template(&self) -> &'static str {
        templates::template(*self)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// The shared document as seen by this participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub text: String,
    pub language: Language,
    /// Bumped by genuine local edits only.
    pub revision: u64,
}

impl DocumentState {
    pub fn from_template(language: Language) -> Self {
        Self {
            text: language.template().to_string(),
            language,
            revision: 0,
        }
    }

    fn from_stored(stored: StoredDocument) -> Self {
        Self {
            text: stored.code,
            language: stored.language,
            revision: 0,
        }
    }

    pub fn to_stored(&self) -> StoredDocument {
        StoredDocument {
            code: self.text.clone(),
            language: self.language,
        }
    }
}

/// What `apply_remote` did with an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The document was replaced.
    Replaced,
    /// Accepted, but the content was already identical.
    Unchanged,
    /// Own echo, stale, not a document event, or the engine is closed.
    Ignored,
}

pub struct DocumentSyncEngine {
    local_id: ParticipantId,
    state: DocumentState,
    save: DebouncedAction,
    senders: SenderClock,
    last_local_ts: u64,
    dirty: bool,
    closed: bool,
}

impl DocumentSyncEngine {
    pub fn new(local_id: ParticipantId, state: DocumentState, save_debounce: Duration) -> Self {
        Self {
            local_id,
            state,
            save: DebouncedAction::new(save_debounce),
            senders: SenderClock::new(),
            last_local_ts: 0,
            dirty: false,
            closed: false,
        }
    }

    /// Cold start: fetch the current document. A missing or unreadable
    /// document starts from the default template.
    pub async fn load(
        local_id: ParticipantId,
        session_id: SessionId,
        store: &dyn SessionStore,
        save_debounce: Duration,
    ) -> Self {
        let state = match store.fetch_document(session_id).await {
            Ok(Some(stored)) => DocumentState::from_stored(stored),
            Ok(None) => DocumentState::from_template(Language::default()),
            Err(e) => {
                log::warn!("Could not load document for {session_id}, starting from template: {e}");
                DocumentState::from_template(Language::default())
            }
        };
        Self::new(local_id, state, save_debounce)
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn text(&self) -> &str {
        &self.state.text
    }

    pub fn language(&self) -> Language {
        self.state.language
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    /// A local edit. Returns the event to publish, or `None` when the text is
    /// unchanged (typically the editor echoing a remote replacement).
    pub fn local_edit(&mut self, text: String, now: Instant) -> Option<ChannelEvent> {
        if self.closed || text == self.state.text {
            return None;
        }
        self.state.text = text;
        self.touch_local(now);
        Some(ChannelEvent::CodeChange {
            text: self.state.text.clone(),
            language: self.state.language,
            sender_id: self.local_id,
            ts: self.next_ts(),
        })
    }

    /// Switch language, resetting the document to the language template.
    pub fn change_language(&mut self, language: Language, now: Instant) -> Option<ChannelEvent> {
        if self.closed || language == self.state.language {
            return None;
        }
        self.state.language = language;
        self.state.text = language.template().to_string();
        self.touch_local(now);
        Some(ChannelEvent::LanguageChange {
            language,
            template: self.state.text.clone(),
            sender_id: self.local_id,
            ts: self.next_ts(),
        })
    }

    /// The whole current document as a fresh broadcast, used to catch peers
    /// up after local edits were made while offline.
    pub fn current_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        Some(ChannelEvent::CodeChange {
            text: self.state.text.clone(),
            language: self.state.language,
            sender_id: self.local_id,
            ts: self.next_ts(),
        })
    }

    pub fn apply_remote(&mut self, event: &ChannelEvent) -> RemoteApply {
        if self.closed {
            return RemoteApply::Ignored;
        }
        let (text, language, sender, ts) = match event {
            ChannelEvent::CodeChange { text, language, sender_id, ts } => (text, *language, *sender_id, *ts),
            ChannelEvent::LanguageChange { template, language, sender_id, ts } => {
                (template, *language, *sender_id, *ts)
            }
            _ => return RemoteApply::Ignored,
        };
        if !accepts_remote(self.local_id, sender) {
            return RemoteApply::Ignored;
        }
        if !self.senders.observe(sender, ts) {
            log::debug!("Dropping stale document update from {sender} (ts {ts})");
            return RemoteApply::Ignored;
        }
        if *text == self.state.text && language == self.state.language {
            return RemoteApply::Unchanged;
        }
        self.state.text = text.clone();
        self.state.language = language;
        RemoteApply::Replaced
    }

    /// Take the pending durable save once its quiet period has elapsed.
    pub fn poll_save(&mut self, now: Instant) -> Option<StoredDocument> {
        if self.save.fire(now) && self.dirty {
            self.dirty = false;
            return Some(self.state.to_stored());
        }
        None
    }

    /// A save failed; the next cycle (or the final flush) retries the latest text.
    pub fn save_failed(&mut self) {
        self.dirty = true;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.save.deadline()
    }

    /// Cancel the debounce and hand back any unsaved document.
    pub fn flush(&mut self) -> Option<StoredDocument> {
        self.save.cancel();
        if self.dirty {
            self.dirty = false;
            Some(self.state.to_stored())
        } else {
            None
        }
    }

    /// Stop the engine. Every later call is a no-op.
    pub fn close(&mut self) {
        self.save.cancel();
        self.closed = true;
    }

    /// Forget a participant's ordering history once they leave the roster.
    pub fn forget(&mut self, sender: &ParticipantId) {
        self.senders.forget(sender);
    }

    fn touch_local(&mut self, now: Instant) {
        self.state.revision += 1;
        self.dirty = true;
        self.save.trigger(now);
    }

    fn next_ts(&mut self) -> u64 {
        self.last_local_ts = now_millis().max(self.last_local_ts + 1);
        self.last_local_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    const DEBOUNCE: Duration = Duration::from_secs(2);

    fn engine() -> DocumentSyncEngine {
        DocumentSyncEngine::new(
            Uuid::new_v4(),
            DocumentState::from_template(Language::Python),
            DEBOUNCE,
        )
    }

    fn code_change(text: &str, sender_id: ParticipantId, ts: u64) -> ChannelEvent {
        ChannelEvent::CodeChange {
            text: text.into(),
            language: Language::Python,
            sender_id,
            ts,
        }
    }

    #[test]
    fn test_local_edit_publishes_and_arms_save() {
        let mut doc = engine();
        let now = Instant::now();
        let event = doc.local_edit("x = 1".into(), now).unwrap();
        match event {
            ChannelEvent::CodeChange { text, language, .. } => {
                assert_eq!(text, "x = 1");
                assert_eq!(language, Language::Python);
            }
            other => panic!("expected CodeChange, got {other:?}"),
        }
        assert_eq!(doc.state().revision, 1);
        assert_eq!(doc.next_deadline(), Some(now + DEBOUNCE));
    }

    #[test]
    fn test_identical_text_is_not_rebroadcast() {
        let mut doc = engine();
        let other = Uuid::new_v4();
        assert_eq!(doc.apply_remote(&code_change("remote", other, 5)), RemoteApply::Replaced);

        // The editor reflects the remote value back as a local change.
        assert!(doc.local_edit("remote".into(), Instant::now()).is_none());
        assert_eq!(doc.state().revision, 0);
        assert!(!doc.has_unsaved_changes());
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut doc = engine();
        let me = doc.local_id;
        assert_eq!(doc.apply_remote(&code_change("mine", me, 1)), RemoteApply::Ignored);
        assert_ne!(doc.text(), "mine");
    }

    #[test]
    fn test_stale_update_from_same_sender_dropped() {
        let mut doc = engine();
        let other = Uuid::new_v4();
        assert_eq!(doc.apply_remote(&code_change("new", other, 10)), RemoteApply::Replaced);
        assert_eq!(doc.apply_remote(&code_change("old", other, 9)), RemoteApply::Ignored);
        assert_eq!(doc.text(), "new");

        // A different sender is not ordered against the first.
        let third = Uuid::new_v4();
        assert_eq!(doc.apply_remote(&code_change("third", third, 1)), RemoteApply::Replaced);
        assert_eq!(doc.text(), "third");
    }

    #[test]
    fn test_language_change_resets_to_template() {
        let mut doc = engine();
        let event = doc.change_language(Language::Rust, Instant::now()).unwrap();
        assert_eq!(doc.text(), Language::Rust.template());
        match event {
            ChannelEvent::LanguageChange { language, template, .. } => {
                assert_eq!(language, Language::Rust);
                assert_eq!(template, Language::Rust.template());
            }
            other => panic!("expected LanguageChange, got {other:?}"),
        }
        assert!(doc.change_language(Language::Rust, Instant::now()).is_none());
    }

    #[test]
    fn test_remote_language_change() {
        let mut doc = engine();
        let event = ChannelEvent::LanguageChange {
            language: Language::Go,
            template: Language::Go.template().into(),
            sender_id: Uuid::new_v4(),
            ts: 3,
        };
        assert_eq!(doc.apply_remote(&event), RemoteApply::Replaced);
        assert_eq!(doc.language(), Language::Go);
        // Receivers do not persist.
        assert!(!doc.has_unsaved_changes());
    }

    #[test]
    fn test_debounced_save_takes_latest_text() {
        let mut doc = engine();
        let start = Instant::now();
        doc.local_edit("a".into(), start);
        doc.local_edit("ab".into(), start + Duration::from_millis(1500));

        assert!(doc.poll_save(start + Duration::from_millis(2500)).is_none());
        let saved = doc.poll_save(start + Duration::from_millis(3500)).unwrap();
        assert_eq!(saved.code, "ab");
        assert!(doc.poll_save(start + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_failed_save_is_flushed_later() {
        let mut doc = engine();
        let start = Instant::now();
        doc.local_edit("a".into(), start);
        assert!(doc.poll_save(start + DEBOUNCE).is_some());
        doc.save_failed();
        assert_eq!(doc.flush().map(|d| d.code), Some("a".to_string()));
        assert!(doc.flush().is_none());
    }

    #[test]
    fn test_closed_engine_is_inert() {
        let mut doc = engine();
        doc.close();
        assert!(doc.local_edit("late".into(), Instant::now()).is_none());
        assert_eq!(
            doc.apply_remote(&code_change("late", Uuid::new_v4(), 1)),
            RemoteApply::Ignored
        );
        assert_eq!(doc.next_deadline(), None);
    }

    #[test]
    fn test_outgoing_timestamps_are_monotonic() {
        let mut doc = engine();
        let now = Instant::now();
        let ts = |event: ChannelEvent| match event {
            ChannelEvent::CodeChange { ts, .. } => ts,
            other => panic!("unexpected {other:?}"),
        };
        let a = ts(doc.local_edit("1".into(), now).unwrap());
        let b = ts(doc.local_edit("2".into(), now).unwrap());
        assert!(b > a);
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("C++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("ts".parse::<Language>().unwrap(), Language::TypeScript);
        let err = "COBOL".parse::<Language>().unwrap_err();
        assert_eq!(err, UnknownLanguage("cobol".into()));
        assert_eq!(err.to_string(), "unknown language: cobol");
        for language in Language::ALL {
            assert_eq!(language.as_str().parse::<Language>().unwrap(), language);
            assert!(!language.template().is_empty());
        }
    }

    #[tokio::test]
    async fn test_cold_start_load() {
        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        let me = Uuid::new_v4();

        let fresh = DocumentSyncEngine::load(me, session, &store, DEBOUNCE).await;
        assert_eq!(fresh.text(), Language::Python.template());

        store.insert_document(session, StoredDocument { code: "saved".into(), language: Language::Java });
        let loaded = DocumentSyncEngine::load(me, session, &store, DEBOUNCE).await;
        assert_eq!(loaded.text(), "saved");
        assert_eq!(loaded.language(), Language::Java);
    }
}
