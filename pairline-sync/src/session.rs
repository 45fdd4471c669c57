//! One participant's live session.
//!
//! [`open`] loads the cold-start state, subscribes to the channel and spawns
//! the session core: a single task that owns the transport, presence tracker,
//! document engine, signal layer and media manager, and drives them from one
//! `select!` loop.
//!
//! ```text
//!   SessionHandle ──commands──►┐
//!   ChannelTransport::recv ───►│
//!   MediaSessionManager ──────►├── SessionCore ──events──► SessionHandle
//!   background results ───────►│
//!   earliest timer ───────────►┘
//! ```
//!
//! Slow work (durable saves, profile lookups, media negotiation) runs in
//! spawned tasks and reports back as messages, so no step blocks the loop.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::debounce::{earliest, sleep_until_opt};
use crate::document::{DocumentState, DocumentSyncEngine, Language, RemoteApply};
use crate::error::{StoreError, SyncError};
use crate::media::{CallState, MediaBackend, MediaNotice, MediaSessionManager, SourceKind, SyntheticBackend, SyntheticSfu, Tile};
use crate::policy::{accepts_remote, effective_status, ErrorClass};
use crate::presence::{PresenceTracker, ProfileOutcome, RosterChange};
use crate::protocol::{
    now_millis, ChannelEvent, ChatMessage, CursorPosition, ParticipantId, ParticipantRecord, SessionId,
};
use crate::signals::{EphemeralSignals, RemoteCursor};
use crate::store::{GrantIssuer, MemoryStore, Profile, ProfileLookup, SessionRow, SessionStatus, SessionStore};
use crate::transport::{ChannelTransport, ConnectionState, Connector, LocalHub, ReconnectOutcome, TransportEvent};

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn SessionStore>,
    pub grants: Arc<dyn GrantIssuer>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub media: Arc<dyn MediaBackend>,
}

impl SessionServices {
    /// Everything in-process: hub relay, memory store, synthetic media.
    pub fn local(hub: &Arc<LocalHub>, store: Arc<MemoryStore>, sfu: &Arc<SyntheticSfu>) -> Self {
        Self {
            connector: Arc::new(hub.connector()),
            store: store.clone(),
            grants: store.clone(),
            profiles: store,
            media: Arc::new(SyntheticBackend::new(sfu.clone())),
        }
    }
}

/// Who is joining which session.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionState),
    Roster {
        participants: Vec<ParticipantRecord>,
        changes: Vec<RosterChange>,
    },
    /// A remote update (or a local language switch) replaced the document.
    DocumentReplaced(DocumentState),
    TypingChanged(Vec<ParticipantId>),
    CursorMoved {
        participant: ParticipantId,
        cursor: RemoteCursor,
    },
    Chat(ChatMessage),
    CallState(CallState),
    Tiles(Vec<Tile>),
    Speaking(bool),
    Error {
        class: ErrorClass,
        message: String,
    },
}

/// Point-in-time copy of everything the UI renders.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Option<SessionRow>,
    /// Status after stale-session reclassification.
    pub status: Option<SessionStatus>,
    pub connection: ConnectionState,
    pub document: DocumentState,
    pub roster: Vec<ParticipantRecord>,
    pub typing: Vec<ParticipantId>,
    pub cursors: BTreeMap<ParticipantId, RemoteCursor>,
    pub chat: Vec<ChatMessage>,
    pub call: CallState,
    pub tiles: Vec<Tile>,
    pub speaking: bool,
}

enum SessionCommand {
    Edit(String),
    ChangeLanguage(Language),
    MoveCursor(CursorPosition),
    SendChat(String),
    JoinCall,
    LeaveCall,
    ToggleMute(SourceKind),
    ShareScreen(bool),
    RetryConnection,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Leave(oneshot::Sender<()>),
}

enum Background {
    Saved(Result<(), StoreError>),
    Profile {
        participant: ParticipantId,
        result: Result<Option<Profile>, StoreError>,
    },
}

pub struct SessionHandle {
    session_id: SessionId,
    participant_id: ParticipantId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    connection: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Replace the document with the editor's current text.
    pub fn edit(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.send(SessionCommand::Edit(text.into()))
    }

    pub fn change_language(&self, language: Language) -> Result<(), SyncError> {
        self.send(SessionCommand::ChangeLanguage(language))
    }

    pub fn move_cursor(&self, position: CursorPosition) -> Result<(), SyncError> {
        self.send(SessionCommand::MoveCursor(position))
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.send(SessionCommand::SendChat(text.into()))
    }

    pub fn join_call(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::JoinCall)
    }

    pub fn leave_call(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::LeaveCall)
    }

    pub fn toggle_mute(&self, kind: SourceKind) -> Result<(), SyncError> {
        self.send(SessionCommand::ToggleMute(kind))
    }

    pub fn share_screen(&self, on: bool) -> Result<(), SyncError> {
        self.send(SessionCommand::ShareScreen(on))
    }

    /// Retry the channel now, also after the transport gave up.
    pub fn retry_connection(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::RetryConnection)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Drain events that are already queued.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Leave the session: stop timers, release media, flush the document and
    /// unsubscribe. Waits for the final save (bounded).
    pub async fn leave(self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Leave(tx))?;
        let _ = rx.await;
        self.task.await.map_err(|_| SyncError::SessionClosed)
    }

    fn send(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::SessionClosed)
    }
}

/// Load the session and start syncing.
///
/// Connect failures are not fatal: the transport has already scheduled a
/// retry and the failure is reported as a connectivity event.
pub async fn open(config: &SyncConfig, services: SessionServices, request: JoinRequest) -> SessionHandle {
    let JoinRequest {
        session_id,
        participant_id,
        display_name,
    } = request;
    log::info!("Opening session {session_id} as {participant_id}");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (background_tx, background_rx) = mpsc::unbounded_channel();

    let session = match services.store.fetch_session(session_id).await {
        Ok(row) => Some(row),
        Err(e) => {
            log::warn!("Session row for {session_id} unavailable: {e}");
            None
        }
    };

    let document = DocumentSyncEngine::load(
        participant_id,
        session_id,
        services.store.as_ref(),
        config.document.save_debounce(),
    )
    .await;

    let mut presence = PresenceTracker::new(participant_id, display_name);
    match services.store.fetch_roster(session_id).await {
        Ok(entries) => presence.seed_profiles(entries),
        Err(e) => log::warn!("Cold-start roster for {session_id} unavailable: {e}"),
    }

    let media = MediaSessionManager::new(
        services.media.clone(),
        services.grants.clone(),
        session_id,
        participant_id,
        config.media.clone(),
    );

    let mut transport = ChannelTransport::new(services.connector.clone(), config.transport.clone(), session_id);
    transport.subscribe_all();
    let connection = transport.watch();

    let mut core = SessionCore {
        session_id,
        local_id: participant_id,
        config: config.clone(),
        services,
        session,
        transport,
        presence,
        document,
        signals: EphemeralSignals::new(participant_id, &config.signals),
        media,
        commands: commands_rx,
        events: events_tx,
        background_tx,
        background_rx,
        unsent_document: false,
    };

    core.presence.begin_join();
    core.emit(SessionEvent::Connection(ConnectionState::Connecting));
    match core.transport.connect().await {
        Ok(_) => core.on_subscribed().await,
        Err(e) => {
            core.presence.on_disconnected();
            core.emit(SessionEvent::Connection(ConnectionState::Disconnected));
            core.report(ErrorClass::from(&e), e.to_string());
        }
    }
    core.request_profiles();

    let task = tokio::spawn(core.run());
    SessionHandle {
        session_id,
        participant_id,
        commands: commands_tx,
        events: events_rx,
        connection,
        task,
    }
}

struct SessionCore {
    session_id: SessionId,
    local_id: ParticipantId,
    config: SyncConfig,
    services: SessionServices,
    session: Option<SessionRow>,

    transport: ChannelTransport,
    presence: PresenceTracker,
    document: DocumentSyncEngine,
    signals: EphemeralSignals,
    media: MediaSessionManager,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    background_tx: mpsc::UnboundedSender<Background>,
    background_rx: mpsc::UnboundedReceiver<Background>,

    /// A document broadcast was lost while disconnected.
    unsent_document: bool,
}

impl SessionCore {
    async fn run(mut self) {
        loop {
            let deadline = earliest([self.document.next_deadline(), self.signals.next_deadline()]);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await.is_break() {
                            return;
                        }
                    }
                    None => {
                        log::debug!("Session handle dropped, leaving {}", self.session_id);
                        self.shutdown().await;
                        return;
                    }
                },
                event = self.transport.recv() => self.on_transport(event).await,
                input = self.media.next_input() => {
                    let notices = self.media.handle(input);
                    self.on_media(notices).await;
                }
                Some(result) = self.background_rx.recv() => self.on_background(result).await,
                _ = sleep_until_opt(deadline) => self.on_timers(Instant::now()).await,
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, class: ErrorClass, message: String) {
        self.emit(SessionEvent::Error { class, message });
    }

    /// Publish, tolerating a missing link. Returns whether the event left.
    async fn publish(&mut self, event: ChannelEvent) -> bool {
        match self.transport.publish(event).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Publish skipped on {}: {e}", self.session_id);
                false
            }
        }
    }

    async fn publish_document(&mut self, event: ChannelEvent) {
        if !self.publish(event).await {
            self.unsent_document = true;
        }
    }

    // ── commands ──────────────────────────────────────────────────

    async fn on_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        let now = Instant::now();
        match command {
            SessionCommand::Edit(text) => {
                if let Some(event) = self.document.local_edit(text, now) {
                    self.publish_document(event).await;
                    if let Some(typing) = self.signals.on_local_edit(now) {
                        self.publish(typing).await;
                    }
                }
            }
            SessionCommand::ChangeLanguage(language) => {
                if let Some(event) = self.document.change_language(language, now) {
                    self.emit(SessionEvent::DocumentReplaced(self.document.state().clone()));
                    self.publish_document(event).await;
                }
            }
            SessionCommand::MoveCursor(position) => {
                if let Some(event) = self.signals.move_cursor(position, now) {
                    self.publish(event).await;
                }
            }
            SessionCommand::SendChat(text) => {
                if let Some((message, event)) = self.signals.send_chat(&text, now_millis()) {
                    self.emit(SessionEvent::Chat(message));
                    self.publish(event).await;
                }
            }
            SessionCommand::JoinCall => {
                let notices = self.media.join_call();
                self.on_media(notices).await;
            }
            SessionCommand::LeaveCall => {
                let notices = self.media.leave_call();
                self.on_media(notices).await;
            }
            SessionCommand::ToggleMute(kind) => {
                let notices = self.media.toggle_mute(kind);
                self.on_media(notices).await;
            }
            SessionCommand::ShareScreen(on) => {
                let notices = self.media.share_screen(on);
                self.on_media(notices).await;
            }
            SessionCommand::RetryConnection => self.transport.retry_now(),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Leave(done) => {
                self.shutdown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            status: self.session.as_ref().map(|row| effective_status(row, now_millis())),
            connection: self.transport.state(),
            document: self.document.state().clone(),
            roster: self.presence.roster(),
            typing: self.signals.typing(),
            cursors: self.signals.cursors().clone(),
            chat: self.signals.chat().messages().to_vec(),
            call: self.media.state(),
            tiles: self.media.tiles(),
            speaking: self.media.is_speaking(),
        }
    }

    // ── transport ─────────────────────────────────────────────────

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Presence(records) => self.on_roster(records).await,
            TransportEvent::Message(envelope) => self.dispatch(envelope.event).await,
            TransportEvent::Dropped(error) => {
                self.presence.on_disconnected();
                self.emit(SessionEvent::Connection(ConnectionState::Disconnected));
                self.report(ErrorClass::from(&error), error.to_string());
            }
            TransportEvent::RetryDue => {
                self.presence.on_reconnecting();
                self.emit(SessionEvent::Connection(ConnectionState::Connecting));
                match self.transport.resubscribe().await {
                    ReconnectOutcome::Resumed => self.on_subscribed().await,
                    ReconnectOutcome::Retrying { attempt, error } => {
                        log::info!("Re-subscribe attempt {attempt} failed: {error}");
                        self.presence.on_disconnected();
                        self.emit(SessionEvent::Connection(ConnectionState::Disconnected));
                    }
                    ReconnectOutcome::GaveUp { attempts } => {
                        self.presence.on_disconnected();
                        self.emit(SessionEvent::Connection(ConnectionState::Disconnected));
                        self.report(
                            ErrorClass::Connectivity,
                            format!("could not reach the session after {attempts} attempts"),
                        );
                    }
                }
            }
        }
    }

    /// A (re)subscription succeeded: announce ourselves and catch peers up.
    async fn on_subscribed(&mut self) {
        self.emit(SessionEvent::Connection(ConnectionState::Connected));
        if let Some(join) = self.presence.on_connected() {
            self.publish(join).await;
        }
        if std::mem::take(&mut self.unsent_document) {
            if let Some(event) = self.document.current_event() {
                self.publish_document(event).await;
            }
        }
    }

    async fn on_roster(&mut self, records: Vec<ParticipantRecord>) {
        let changes = self.presence.apply_snapshot(records);
        if changes.is_empty() {
            return;
        }

        let mut typing_changed = false;
        for change in &changes {
            if let RosterChange::Left(id) = change {
                self.document.forget(id);
                typing_changed |= self.signals.forget(id);
            }
        }
        let roster = self.presence.roster();
        let notices = self.media.on_roster(&roster);

        self.emit(SessionEvent::Roster {
            participants: roster,
            changes,
        });
        if typing_changed {
            self.emit(SessionEvent::TypingChanged(self.signals.typing()));
        }
        self.on_media(notices).await;
        self.request_profiles();
    }

    async fn dispatch(&mut self, event: ChannelEvent) {
        let sender = event.sender_id();
        if !accepts_remote(self.local_id, sender) {
            return;
        }
        self.presence.touch(sender, now_millis());

        match event {
            // The relay folds these into its presence snapshots.
            ChannelEvent::Join(_) | ChannelEvent::Leave { .. } => {}
            ChannelEvent::CodeChange { .. } | ChannelEvent::LanguageChange { .. } => {
                if self.document.apply_remote(&event) == RemoteApply::Replaced {
                    self.emit(SessionEvent::DocumentReplaced(self.document.state().clone()));
                }
            }
            ChannelEvent::Typing { is_typing, sender_id } => {
                if let Some(typing) = self.signals.apply_typing(sender_id, is_typing, Instant::now()) {
                    self.presence.set_remote_typing(sender_id, typing);
                    self.emit(SessionEvent::TypingChanged(self.signals.typing()));
                }
            }
            ChannelEvent::CursorMove {
                position,
                color,
                sender_id,
            } => {
                if self.signals.apply_cursor(sender_id, position, color) {
                    self.emit(SessionEvent::CursorMoved {
                        participant: sender_id,
                        cursor: RemoteCursor { position, color },
                    });
                }
            }
            ChannelEvent::ChatMessage(message) => {
                if self.signals.apply_chat(message.clone()) {
                    self.emit(SessionEvent::Chat(message));
                }
            }
            ChannelEvent::CallJoin { sender_id } => {
                if self.presence.set_remote_in_call(sender_id, true) {
                    self.emit_roster();
                }
            }
            ChannelEvent::CallLeave { sender_id } => {
                if self.presence.set_remote_in_call(sender_id, false) {
                    self.emit_roster();
                }
                let notices = self.media.on_remote_call_leave(sender_id);
                self.on_media(notices).await;
            }
            ChannelEvent::MediaSignal {
                sender_id,
                target_id,
                payload,
            } => {
                if target_id == self.local_id {
                    self.media.on_signal(sender_id, payload);
                }
            }
        }
    }

    fn emit_roster(&self) {
        self.emit(SessionEvent::Roster {
            participants: self.presence.roster(),
            changes: Vec::new(),
        });
    }

    // ── media ─────────────────────────────────────────────────────

    async fn on_media(&mut self, notices: Vec<MediaNotice>) {
        for notice in notices {
            match notice {
                MediaNotice::State(state) => self.emit(SessionEvent::CallState(state)),
                MediaNotice::Joined => {
                    if let Some(announce) = self.presence.set_in_call(true) {
                        self.publish(announce).await;
                    }
                    self.publish(ChannelEvent::CallJoin { sender_id: self.local_id }).await;
                    self.emit_roster();
                }
                MediaNotice::Left => {
                    if let Some(announce) = self.presence.set_in_call(false) {
                        self.publish(announce).await;
                    }
                    self.publish(ChannelEvent::CallLeave { sender_id: self.local_id }).await;
                    self.emit_roster();
                }
                MediaNotice::Tiles(tiles) => self.emit(SessionEvent::Tiles(tiles)),
                MediaNotice::Speaking(speaking) => self.emit(SessionEvent::Speaking(speaking)),
                MediaNotice::Signal { target, payload } => {
                    self.publish(ChannelEvent::MediaSignal {
                        sender_id: self.local_id,
                        target_id: target,
                        payload,
                    })
                    .await;
                }
                MediaNotice::Failed(error) => self.report(ErrorClass::from(&error), error.to_string()),
            }
        }
    }

    // ── timers and background work ───────────────────────────────

    async fn on_timers(&mut self, now: Instant) {
        if let Some(document) = self.document.poll_save(now) {
            let store = self.services.store.clone();
            let session_id = self.session_id;
            let done = self.background_tx.clone();
            tokio::spawn(async move {
                let result = store.save_document(session_id, document).await;
                let _ = done.send(Background::Saved(result));
            });
        }
        if let Some(event) = self.signals.poll_typing(now) {
            self.publish(event).await;
        }
        if let Some(event) = self.signals.poll_cursor(now) {
            self.publish(event).await;
        }
        let expired = self.signals.expire_typing(now);
        if !expired.is_empty() {
            for id in expired {
                self.presence.set_remote_typing(id, false);
            }
            self.emit(SessionEvent::TypingChanged(self.signals.typing()));
        }
    }

    async fn on_background(&mut self, result: Background) {
        match result {
            Background::Saved(Ok(())) => log::debug!("Document for {} saved", self.session_id),
            Background::Saved(Err(e)) => {
                log::warn!("Saving document for {} failed: {e}", self.session_id);
                self.document.save_failed();
                self.report(ErrorClass::from(&e), e.to_string());
            }
            Background::Profile { participant, result } => {
                let profile = result.unwrap_or_else(|e| {
                    log::debug!("Profile lookup for {participant} failed: {e}");
                    None
                });
                match self.presence.apply_profile(participant, profile) {
                    ProfileOutcome::Republish(announce) => {
                        self.publish(announce).await;
                        self.emit_roster();
                    }
                    ProfileOutcome::RosterUpdated => self.emit_roster(),
                    ProfileOutcome::Unchanged => {}
                }
            }
        }
    }

    fn request_profiles(&mut self) {
        for participant in self.presence.missing_enrichment() {
            let profiles = self.services.profiles.clone();
            let done = self.background_tx.clone();
            tokio::spawn(async move {
                let result = profiles.lookup_profile(participant).await;
                let _ = done.send(Background::Profile { participant, result });
            });
        }
    }

    // ── shutdown ──────────────────────────────────────────────────

    /// Timers first, then hardware, then the channel.
    async fn shutdown(&mut self) {
        let unsaved = self.document.flush();
        self.document.close();
        self.signals.stop();

        let notices = self.media.leave_call();
        self.on_media(notices).await;
        // Idempotent; the spawned disconnect may already have run.
        self.services.media.disconnect().await;

        if let Some(leave) = self.presence.leave() {
            self.publish(leave).await;
        }

        if let Some(document) = unsaved {
            let timeout = self.config.document.final_save_timeout();
            match tokio::time::timeout(timeout, self.services.store.save_document(self.session_id, document)).await
            {
                Ok(Ok(())) => log::info!("Final save for {} done", self.session_id),
                Ok(Err(e)) => log::warn!("Final save for {} failed: {e}", self.session_id),
                Err(_) => log::warn!("Final save for {} timed out after {timeout:?}", self.session_id),
            }
        }

        self.transport.unsubscribe_all();
        self.transport.disconnect();
        log::info!("Left session {}", self.session_id);
    }
}
