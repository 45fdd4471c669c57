//! Media session manager.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::backend::{LocalTrack, MediaBackend, MediaEvent, MediaLink};
use super::meter::AudioMeter;
use super::registry::{Direction, Tile, TrackRegistration, TrackRegistry};
use super::{RemotePublication, SourceKind, TrackHandle};
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::protocol::{ParticipantId, ParticipantRecord, SessionId, SignalPayload};
use crate::store::GrantIssuer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
}

/// Result of a join or recovery: a live link plus what others publish.
pub struct JoinedCall {
    link: MediaLink,
    local: Vec<LocalTrack>,
    remote: Vec<RemotePublication>,
}

impl fmt::Debug for JoinedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinedCall")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Work completed outside the owning task. Feed back via
/// [`MediaSessionManager::handle`].
#[derive(Debug)]
pub enum MediaInput {
    Joined {
        attempt: u64,
        result: Result<JoinedCall, MediaError>,
    },
    Recovered {
        attempt: u64,
        in_place: bool,
        result: Result<JoinedCall, MediaError>,
    },
    Subscribed {
        attempt: u64,
        publication: RemotePublication,
        result: Result<TrackHandle, MediaError>,
    },
    /// A local source was (re)acquired and published.
    TrackReady {
        attempt: u64,
        kind: SourceKind,
        result: Result<LocalTrack, MediaError>,
    },
    Speaking {
        generation: u64,
        speaking: bool,
    },
    Backend {
        attempt: u64,
        event: MediaEvent,
    },
    LinkClosed {
        attempt: u64,
    },
}

/// What the owner must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaNotice {
    State(CallState),
    /// Entered the call; announce it.
    Joined,
    /// Left the call (on request or after a failure); announce it.
    Left,
    Tiles(Vec<Tile>),
    Speaking(bool),
    /// Negotiation payload to relay to another participant.
    Signal {
        target: ParticipantId,
        payload: SignalPayload,
    },
    Failed(MediaError),
}

pub struct MediaSessionManager {
    backend: Arc<dyn MediaBackend>,
    grants: Arc<dyn GrantIssuer>,
    session_id: SessionId,
    local_id: ParticipantId,
    config: MediaConfig,

    state: CallState,
    /// Bumped on every join/leave; outcomes from older attempts are stale.
    attempt: u64,
    link: Option<MediaLink>,
    registry: TrackRegistry,
    local: HashMap<SourceKind, LocalTrack>,
    pending: HashSet<SourceKind>,
    meter: AudioMeter,

    known: HashSet<ParticipantId>,
    parked: HashMap<(ParticipantId, SourceKind), RemotePublication>,

    inputs_tx: mpsc::UnboundedSender<MediaInput>,
    inputs_rx: mpsc::UnboundedReceiver<MediaInput>,
}

impl MediaSessionManager {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        grants: Arc<dyn GrantIssuer>,
        session_id: SessionId,
        local_id: ParticipantId,
        config: MediaConfig,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let meter = AudioMeter::new(&config);
        Self {
            backend,
            grants,
            session_id,
            local_id,
            config,
            state: CallState::Idle,
            attempt: 0,
            link: None,
            registry: TrackRegistry::new(),
            local: HashMap::new(),
            pending: HashSet::new(),
            meter,
            known: HashSet::new(),
            parked: HashMap::new(),
            inputs_tx,
            inputs_rx,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn tiles(&self) -> Vec<Tile> {
        self.registry.tiles()
    }

    pub fn is_speaking(&self) -> bool {
        self.meter.is_speaking()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Next completed background step or backend event. Cancel-safe.
    pub async fn next_input(&mut self) -> MediaInput {
        let attempt = self.attempt;
        tokio::select! {
            input = self.inputs_rx.recv() => match input {
                Some(input) => input,
                // The sender lives in `self`.
                None => std::future::pending().await,
            },
            event = recv_media(self.link.as_mut()) => match event {
                Some(event) => MediaInput::Backend { attempt, event },
                None => {
                    self.link = None;
                    MediaInput::LinkClosed { attempt }
                }
            },
        }
    }

    /// Start joining. A no-op unless idle.
    pub fn join_call(&mut self) -> Vec<MediaNotice> {
        if self.state != CallState::Idle {
            log::debug!("join_call ignored while {:?}", self.state);
            return Vec::new();
        }
        self.attempt += 1;
        self.state = CallState::Connecting;
        log::info!("Joining call for session {}", self.session_id);

        let attempt = self.attempt;
        let backend = self.backend.clone();
        let grants = self.grants.clone();
        let session_id = self.session_id;
        let local_id = self.local_id;
        let mut kinds = vec![SourceKind::Microphone];
        if self.config.publish_camera {
            kinds.push(SourceKind::Camera);
        }
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = join(backend.as_ref(), grants.as_ref(), session_id, local_id, &kinds).await;
            let _ = inputs.send(MediaInput::Joined { attempt, result });
        });

        vec![MediaNotice::State(CallState::Connecting)]
    }

    /// Stop the meter, release local tracks, clear the registry and
    /// disconnect, in that order.
    pub fn leave_call(&mut self) -> Vec<MediaNotice> {
        if self.state == CallState::Idle {
            return Vec::new();
        }
        let was_in_call = self.state != CallState::Connecting;
        let mut notices = Vec::new();

        if self.meter.disarm() {
            notices.push(MediaNotice::Speaking(false));
        }
        for (_, track) in self.local.drain() {
            self.backend.release(track.handle);
        }
        self.pending.clear();
        self.registry.clear();
        self.parked.clear();
        self.attempt += 1;
        self.link = None;
        let backend = self.backend.clone();
        tokio::spawn(async move { backend.disconnect().await });

        self.state = CallState::Idle;
        log::info!("Left call for session {}", self.session_id);
        notices.push(MediaNotice::Tiles(Vec::new()));
        notices.push(MediaNotice::State(CallState::Idle));
        if was_in_call {
            notices.push(MediaNotice::Left);
        }
        notices
    }

    /// Mute or unmute a local camera or microphone. Muting releases the
    /// source; unmuting captures a fresh one.
    pub fn toggle_mute(&mut self, kind: SourceKind) -> Vec<MediaNotice> {
        if self.state != CallState::Active || kind == SourceKind::Screen || self.pending.contains(&kind) {
            return Vec::new();
        }
        match self.local.contains_key(&kind) {
            true => self.stop_local(kind, true),
            false => {
                self.start_local(kind);
                Vec::new()
            }
        }
    }

    pub fn share_screen(&mut self, on: bool) -> Vec<MediaNotice> {
        if self.state != CallState::Active || self.pending.contains(&SourceKind::Screen) {
            return Vec::new();
        }
        match (on, self.local.contains_key(&SourceKind::Screen)) {
            (true, false) => {
                self.start_local(SourceKind::Screen);
                Vec::new()
            }
            (false, true) => self.stop_local(SourceKind::Screen, false),
            _ => Vec::new(),
        }
    }

    /// Refresh the roster snapshot. Registrations of participants who left
    /// are purged; parked publications of newly known ones are subscribed.
    pub fn on_roster(&mut self, roster: &[ParticipantRecord]) -> Vec<MediaNotice> {
        self.known = roster
            .iter()
            .map(|r| r.participant_id)
            .filter(|id| *id != self.local_id)
            .collect();

        let purged = self.registry.retain_known(&self.known);
        if purged > 0 {
            log::debug!("Purged {purged} registrations of departed participants");
        }

        if self.state == CallState::Active {
            let ready: Vec<_> = self
                .parked
                .keys()
                .filter(|(participant, _)| self.known.contains(participant))
                .copied()
                .collect();
            for key in ready {
                if let Some(publication) = self.parked.remove(&key) {
                    self.subscribe_remote(publication);
                }
            }
        }

        if purged > 0 {
            vec![MediaNotice::Tiles(self.tiles())]
        } else {
            Vec::new()
        }
    }

    /// A participant announced leaving the call.
    pub fn on_remote_call_leave(&mut self, participant: ParticipantId) -> Vec<MediaNotice> {
        self.parked.retain(|(owner, _), _| *owner != participant);
        if self.registry.purge(&participant) > 0 {
            vec![MediaNotice::Tiles(self.tiles())]
        } else {
            Vec::new()
        }
    }

    /// Negotiation payload addressed to this participant.
    pub fn on_signal(&mut self, from: ParticipantId, payload: SignalPayload) {
        if self.state == CallState::Idle {
            return;
        }
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.handle_signal(from, payload).await {
                log::warn!("Media signal from {from} rejected: {e}");
            }
        });
    }

    pub fn handle(&mut self, input: MediaInput) -> Vec<MediaNotice> {
        match input {
            MediaInput::Joined { attempt, result } => self.on_joined(attempt, result),
            MediaInput::Recovered { attempt, in_place, result } => self.on_recovered(attempt, in_place, result),
            MediaInput::Subscribed { attempt, publication, result } => {
                self.on_subscribed(attempt, publication, result)
            }
            MediaInput::TrackReady { attempt, kind, result } => self.on_track_ready(attempt, kind, result),
            MediaInput::Speaking { generation, speaking } => self
                .meter
                .accept(generation, speaking)
                .map(|s| vec![MediaNotice::Speaking(s)])
                .unwrap_or_default(),
            MediaInput::Backend { attempt, event } if attempt == self.attempt => self.on_backend(event),
            MediaInput::LinkClosed { attempt } if attempt == self.attempt => {
                self.begin_recovery(MediaError::TransportLost("media link closed".into()))
            }
            MediaInput::Backend { .. } | MediaInput::LinkClosed { .. } => Vec::new(),
        }
    }

    fn on_joined(&mut self, attempt: u64, result: Result<JoinedCall, MediaError>) -> Vec<MediaNotice> {
        if attempt != self.attempt || self.state != CallState::Connecting {
            if let Ok(call) = result {
                log::debug!("Discarding stale join (attempt {attempt})");
                for track in call.local {
                    self.backend.release(track.handle);
                }
                if self.state == CallState::Idle {
                    let backend = self.backend.clone();
                    tokio::spawn(async move { backend.disconnect().await });
                }
            }
            return Vec::new();
        }

        match result {
            Ok(call) => {
                self.state = CallState::Active;
                self.link = Some(call.link);
                for track in call.local {
                    self.install_local(track);
                }
                for publication in call.remote {
                    self.route_publication(publication);
                }
                log::info!("Call active for session {}", self.session_id);
                vec![
                    MediaNotice::State(CallState::Active),
                    MediaNotice::Joined,
                    MediaNotice::Tiles(self.tiles()),
                ]
            }
            Err(e) => {
                log::warn!("Call join failed: {e}");
                self.state = CallState::Idle;
                vec![MediaNotice::Failed(e), MediaNotice::State(CallState::Idle)]
            }
        }
    }

    fn on_recovered(
        &mut self,
        attempt: u64,
        in_place: bool,
        result: Result<JoinedCall, MediaError>,
    ) -> Vec<MediaNotice> {
        if attempt != self.attempt || self.state != CallState::Reconnecting {
            if let Ok(call) = result {
                log::debug!("Discarding stale recovery (attempt {attempt})");
                for track in call.local {
                    self.backend.release(track.handle);
                }
                // Left the call while recovering: do not stay in the room.
                if self.state == CallState::Idle {
                    let backend = self.backend.clone();
                    tokio::spawn(async move { backend.disconnect().await });
                }
            }
            return Vec::new();
        }
        match result {
            Ok(call) => {
                log::info!(
                    "Media recovered ({})",
                    if in_place { "in place" } else { "after rejoin" }
                );
                self.state = CallState::Active;
                self.link = Some(call.link);
                for publication in call.remote {
                    self.route_publication(publication);
                }
                vec![MediaNotice::State(CallState::Active), MediaNotice::Tiles(self.tiles())]
            }
            Err(e) => {
                log::warn!("Media recovery failed: {e}");
                let mut notices = vec![MediaNotice::Failed(e)];
                notices.extend(self.leave_call());
                notices
            }
        }
    }

    fn on_subscribed(
        &mut self,
        attempt: u64,
        publication: RemotePublication,
        result: Result<TrackHandle, MediaError>,
    ) -> Vec<MediaNotice> {
        if attempt != self.attempt || self.state != CallState::Active {
            return Vec::new();
        }
        match result {
            Ok(track) if self.known.contains(&publication.participant) => {
                self.registry
                    .insert(TrackRegistration::remote(publication.participant, publication.kind, track));
                vec![MediaNotice::Tiles(self.tiles())]
            }
            Ok(_) => {
                // Left the roster while we were subscribing.
                Vec::new()
            }
            Err(e) => {
                log::warn!("Subscribe to {} {} failed: {e}", publication.participant, publication.kind);
                Vec::new()
            }
        }
    }

    fn on_track_ready(
        &mut self,
        attempt: u64,
        kind: SourceKind,
        result: Result<LocalTrack, MediaError>,
    ) -> Vec<MediaNotice> {
        if attempt != self.attempt || self.state != CallState::Active {
            if let Ok(track) = result {
                self.backend.release(track.handle);
            }
            return Vec::new();
        }
        self.pending.remove(&kind);
        match result {
            Ok(track) => {
                self.install_local(track);
                vec![MediaNotice::Tiles(self.tiles())]
            }
            Err(e) => {
                log::warn!("Could not start {kind}: {e}");
                vec![MediaNotice::Failed(e)]
            }
        }
    }

    fn on_backend(&mut self, event: MediaEvent) -> Vec<MediaNotice> {
        match event {
            MediaEvent::TrackPublished(publication) => {
                if self.state == CallState::Active {
                    self.route_publication(publication);
                }
                Vec::new()
            }
            MediaEvent::TrackUnpublished { participant, kind } => {
                self.parked.remove(&(participant, kind));
                if self.registry.remove(&participant, kind).is_some() {
                    vec![MediaNotice::Tiles(self.tiles())]
                } else {
                    Vec::new()
                }
            }
            MediaEvent::ParticipantLeft(participant) => self.on_remote_call_leave(participant),
            MediaEvent::Signal { target, payload } => vec![MediaNotice::Signal { target, payload }],
            MediaEvent::Disconnected(e) => self.begin_recovery(e),
        }
    }

    /// In-place reconnect first, then leave-and-rejoin.
    fn begin_recovery(&mut self, cause: MediaError) -> Vec<MediaNotice> {
        if self.state != CallState::Active {
            return Vec::new();
        }
        log::warn!("Media transport lost: {cause}");
        self.state = CallState::Reconnecting;
        self.link = None;
        self.attempt += 1;
        // Captures in flight belong to the old attempt and will be dropped.
        self.pending.clear();
        self.parked.clear();
        self.registry.clear_remote();

        let attempt = self.attempt;
        let backend = self.backend.clone();
        let grants = self.grants.clone();
        let session_id = self.session_id;
        let local_id = self.local_id;
        let tracks: Vec<LocalTrack> = self.local.values().cloned().collect();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let input = match reconnect_in_place(backend.as_ref()).await {
                Ok(call) => MediaInput::Recovered { attempt, in_place: true, result: Ok(call) },
                Err(e) => {
                    log::info!("In-place media reconnect failed ({e}), rejoining");
                    let result = rejoin(backend.as_ref(), grants.as_ref(), session_id, local_id, tracks).await;
                    MediaInput::Recovered { attempt, in_place: false, result }
                }
            };
            let _ = inputs.send(input);
        });

        vec![MediaNotice::State(CallState::Reconnecting), MediaNotice::Tiles(self.tiles())]
    }

    fn route_publication(&mut self, publication: RemotePublication) {
        if publication.participant == self.local_id {
            return;
        }
        if self.known.contains(&publication.participant) {
            self.subscribe_remote(publication);
        } else {
            log::debug!("Parking {} track of unknown participant {}", publication.kind, publication.participant);
            self.parked
                .insert((publication.participant, publication.kind), publication);
        }
    }

    fn subscribe_remote(&mut self, publication: RemotePublication) {
        let attempt = self.attempt;
        let backend = self.backend.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = backend.subscribe(publication.clone()).await;
            let _ = inputs.send(MediaInput::Subscribed { attempt, publication, result });
        });
    }

    fn install_local(&mut self, track: LocalTrack) {
        self.registry
            .insert(TrackRegistration::local(self.local_id, track.kind, track.handle));
        if let Some(sampler) = &track.sampler {
            self.meter.arm(sampler.clone(), self.inputs_tx.clone());
        }
        self.local.insert(track.kind, track);
    }

    fn start_local(&mut self, kind: SourceKind) {
        self.pending.insert(kind);
        let attempt = self.attempt;
        let backend = self.backend.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let track = backend.acquire(kind).await?;
                if let Err(e) = backend.publish(track.clone()).await {
                    backend.release(track.handle);
                    return Err(e);
                }
                Ok(track)
            }
            .await;
            let _ = inputs.send(MediaInput::TrackReady { attempt, kind, result });
        });
    }

    /// Release a local source. Muted sources keep a registration so the
    /// tile shows them as muted.
    fn stop_local(&mut self, kind: SourceKind, keep_registration: bool) -> Vec<MediaNotice> {
        let mut notices = Vec::new();
        let Some(track) = self.local.remove(&kind) else {
            return notices;
        };
        if track.sampler.is_some() && self.meter.disarm() {
            notices.push(MediaNotice::Speaking(false));
        }
        self.backend.release(track.handle);
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.unpublish(track.handle).await {
                log::warn!("Unpublish of {kind} failed: {e}");
            }
        });

        if keep_registration {
            if let Some(reg) = self.registry.get_mut(&self.local_id, kind) {
                reg.track = None;
                reg.muted = true;
                reg.published = false;
            }
        } else {
            self.registry.remove(&self.local_id, kind);
        }
        notices.push(MediaNotice::Tiles(self.tiles()));
        notices
    }

    /// Remote registrations currently held, for diagnostics.
    pub fn remote_count(&self) -> usize {
        self.registry.iter().filter(|r| r.direction == Direction::Remote).count()
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        for (_, track) in self.local.drain() {
            self.backend.release(track.handle);
        }
    }
}

async fn recv_media(link: Option<&mut MediaLink>) -> Option<MediaEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn join(
    backend: &dyn MediaBackend,
    grants: &dyn GrantIssuer,
    session_id: SessionId,
    local_id: ParticipantId,
    kinds: &[SourceKind],
) -> Result<JoinedCall, MediaError> {
    let grant = grants
        .issue_grant(session_id, local_id)
        .await
        .map_err(|e| MediaError::Credentials(e.to_string()))?;

    let mut local = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match backend.acquire(*kind).await {
            Ok(track) => local.push(track),
            Err(e) => {
                release_all(backend, &local);
                return Err(e);
            }
        }
    }

    let setup = async {
        let link = backend.connect(grant, local_id).await?;
        for track in &local {
            backend.publish(track.clone()).await?;
        }
        let remote = backend.remote_publications().await?;
        Ok::<_, MediaError>((link, remote))
    };
    match setup.await {
        Ok((link, remote)) => Ok(JoinedCall { link, local, remote }),
        Err(e) => {
            release_all(backend, &local);
            backend.disconnect().await;
            Err(e)
        }
    }
}

async fn reconnect_in_place(backend: &dyn MediaBackend) -> Result<JoinedCall, MediaError> {
    let link = backend.reconnect().await?;
    let remote = backend.remote_publications().await?;
    Ok(JoinedCall { link, local: Vec::new(), remote })
}

async fn rejoin(
    backend: &dyn MediaBackend,
    grants: &dyn GrantIssuer,
    session_id: SessionId,
    local_id: ParticipantId,
    tracks: Vec<LocalTrack>,
) -> Result<JoinedCall, MediaError> {
    backend.disconnect().await;
    let grant = grants
        .issue_grant(session_id, local_id)
        .await
        .map_err(|e| MediaError::Credentials(e.to_string()))?;
    let link = backend.connect(grant, local_id).await?;
    for track in tracks {
        backend.publish(track).await?;
    }
    let remote = backend.remote_publications().await?;
    Ok(JoinedCall { link, local: Vec::new(), remote })
}

fn release_all(backend: &dyn MediaBackend, tracks: &[LocalTrack]) {
    for track in tracks {
        backend.release(track.handle);
    }
}
