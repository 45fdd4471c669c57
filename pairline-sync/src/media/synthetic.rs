//! Hardware-free media stack.
//!
//! `SyntheticSfu` is an in-process selective forwarding unit shared by every
//! participant of a test or demo; `SyntheticBackend` is one participant's
//! view of it, with a tone generator in place of a microphone and knobs for
//! scripted failures.

use std::collections::{HashMap, HashSet};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::backend::{AudioSampler, LocalTrack, MediaBackend, MediaEvent, MediaLink};
use super::{MediaGrant, RemotePublication, SourceKind, TrackHandle};
use crate::error::MediaError;
use crate::protocol::{now_millis, ParticipantId, SignalPayload};

const EVENT_BUFFER: usize = 64;
const SAMPLE_RATE: f32 = 48_000.0;
const TONE_HZ: f32 = 220.0;

/// Sine tone with adjustable amplitude.
pub struct ToneSampler {
    amplitude: AtomicU32,
    phase: AtomicU64,
}

impl ToneSampler {
    pub fn new(amplitude: f32) -> Self {
        Self {
            amplitude: AtomicU32::new(amplitude.to_bits()),
            phase: AtomicU64::new(0),
        }
    }

    pub fn set_amplitude(&self, amplitude: f32) {
        self.amplitude.store(amplitude.to_bits(), Ordering::Relaxed);
    }

    pub fn amplitude(&self) -> f32 {
        f32::from_bits(self.amplitude.load(Ordering::Relaxed))
    }
}

impl AudioSampler for ToneSampler {
    fn read(&self, buf: &mut [f32]) -> usize {
        let amplitude = self.amplitude();
        let start = self.phase.fetch_add(buf.len() as u64, Ordering::Relaxed);
        for (i, sample) in buf.iter_mut().enumerate() {
            let t = (start + i as u64) as f32 / SAMPLE_RATE;
            *sample = amplitude * (TAU * TONE_HZ * t).sin();
        }
        buf.len()
    }
}

#[derive(Default)]
struct Peer {
    publications: HashMap<SourceKind, TrackHandle>,
    events: Option<mpsc::Sender<MediaEvent>>,
}

/// Shared in-process media room.
#[derive(Default)]
pub struct SyntheticSfu {
    peers: Mutex<HashMap<ParticipantId, Peer>>,
}

impl SyntheticSfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ParticipantId, Peer>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(peers: &HashMap<ParticipantId, Peer>, except: ParticipantId, event: MediaEvent) {
        for (id, peer) in peers {
            if *id == except {
                continue;
            }
            if let Some(events) = &peer.events {
                if events.try_send(event.clone()).is_err() {
                    log::warn!("Synthetic SFU dropped an event for {id}");
                }
            }
        }
    }

    /// Participants currently connected.
    pub fn participants(&self) -> HashSet<ParticipantId> {
        self.peers().keys().copied().collect()
    }

    pub fn publications_of(&self, participant: &ParticipantId) -> Vec<SourceKind> {
        let mut kinds: Vec<_> = self
            .peers()
            .get(participant)
            .map(|p| p.publications.keys().copied().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }
}

pub struct SyntheticBackend {
    sfu: Arc<SyntheticSfu>,
    me: Mutex<Option<ParticipantId>>,
    tone: Arc<ToneSampler>,
    live: Mutex<HashSet<TrackHandle>>,
    deny_permission: AtomicBool,
    fail_connect: AtomicBool,
    fail_reconnect: AtomicBool,
}

impl SyntheticBackend {
    pub fn new(sfu: Arc<SyntheticSfu>) -> Self {
        Self {
            sfu,
            me: Mutex::new(None),
            tone: Arc::new(ToneSampler::new(0.0)),
            live: Mutex::new(HashSet::new()),
            deny_permission: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_reconnect: AtomicBool::new(false),
        }
    }

    /// The microphone signal.
    pub fn tone(&self) -> &Arc<ToneSampler> {
        &self.tone
    }

    pub fn set_deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reconnect(&self, fail: bool) {
        self.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    /// Captured tracks not yet released.
    pub fn live_tracks(&self) -> usize {
        self.live().len()
    }

    /// Drop the media link without leaving the room, as a network fault would.
    pub fn sever(&self) {
        if let Some(me) = self.me() {
            if let Some(peer) = self.sfu.peers().get_mut(&me) {
                peer.events = None;
            }
        }
    }

    fn me(&self) -> Option<ParticipantId> {
        *self.me.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_me(&self, participant: Option<ParticipantId>) {
        *self.me.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = participant;
    }

    fn live(&self) -> MutexGuard<'_, HashSet<TrackHandle>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_me(&self) -> Result<ParticipantId, MediaError> {
        self.me()
            .ok_or_else(|| MediaError::TransportLost("not connected to the media room".into()))
    }
}

impl MediaBackend for SyntheticBackend {
    fn acquire(&self, kind: SourceKind) -> BoxFuture<'_, Result<LocalTrack, MediaError>> {
        Box::pin(async move {
            if self.deny_permission.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied(kind.to_string()));
            }
            let handle = TrackHandle::new();
            self.live().insert(handle);
            let sampler: Option<Arc<dyn AudioSampler>> = match kind {
                SourceKind::Microphone => Some(self.tone.clone()),
                _ => None,
            };
            Ok(LocalTrack { handle, kind, sampler })
        })
    }

    fn release(&self, track: TrackHandle) {
        self.live().remove(&track);
    }

    fn connect(
        &self,
        grant: MediaGrant,
        participant: ParticipantId,
    ) -> BoxFuture<'_, Result<MediaLink, MediaError>> {
        Box::pin(async move {
            if grant.token.is_empty() || grant.expires_at <= now_millis() {
                return Err(MediaError::Credentials("grant is empty or expired".into()));
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(MediaError::Negotiation("synthetic connect failure".into()));
            }
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            self.sfu.peers().insert(
                participant,
                Peer {
                    publications: HashMap::new(),
                    events: Some(tx),
                },
            );
            self.set_me(Some(participant));
            Ok(MediaLink { events: rx })
        })
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<MediaLink, MediaError>> {
        Box::pin(async move {
            if self.fail_reconnect.load(Ordering::SeqCst) {
                return Err(MediaError::TransportLost("synthetic reconnect failure".into()));
            }
            let me = self.require_me()?;
            let mut peers = self.sfu.peers();
            let peer = peers
                .get_mut(&me)
                .ok_or_else(|| MediaError::TransportLost("session expired on the SFU".into()))?;
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            peer.events = Some(tx);
            Ok(MediaLink { events: rx })
        })
    }

    fn publish(&self, track: LocalTrack) -> BoxFuture<'_, Result<(), MediaError>> {
        Box::pin(async move {
            let me = self.require_me()?;
            let mut peers = self.sfu.peers();
            let peer = peers
                .get_mut(&me)
                .ok_or_else(|| MediaError::TransportLost("not in the media room".into()))?;
            peer.publications.insert(track.kind, track.handle);
            SyntheticSfu::broadcast(
                &peers,
                me,
                MediaEvent::TrackPublished(RemotePublication {
                    participant: me,
                    kind: track.kind,
                    track: track.handle,
                }),
            );
            Ok(())
        })
    }

    fn unpublish(&self, track: TrackHandle) -> BoxFuture<'_, Result<(), MediaError>> {
        Box::pin(async move {
            let me = self.require_me()?;
            let mut peers = self.sfu.peers();
            let Some(peer) = peers.get_mut(&me) else {
                return Ok(());
            };
            let kind = peer
                .publications
                .iter()
                .find(|(_, handle)| **handle == track)
                .map(|(kind, _)| *kind);
            if let Some(kind) = kind {
                peer.publications.remove(&kind);
                SyntheticSfu::broadcast(&peers, me, MediaEvent::TrackUnpublished { participant: me, kind });
            }
            Ok(())
        })
    }

    fn subscribe(&self, publication: RemotePublication) -> BoxFuture<'_, Result<TrackHandle, MediaError>> {
        Box::pin(async move {
            let peers = self.sfu.peers();
            let published = peers
                .get(&publication.participant)
                .and_then(|p| p.publications.get(&publication.kind))
                .is_some_and(|handle| *handle == publication.track);
            if published {
                Ok(TrackHandle::new())
            } else {
                Err(MediaError::NotPublished {
                    participant: publication.participant,
                    kind: publication.kind.to_string(),
                })
            }
        })
    }

    fn remote_publications(&self) -> BoxFuture<'_, Result<Vec<RemotePublication>, MediaError>> {
        Box::pin(async move {
            let me = self.require_me()?;
            let peers = self.sfu.peers();
            let mut publications: Vec<RemotePublication> = peers
                .iter()
                .filter(|(id, _)| **id != me)
                .flat_map(|(id, peer)| {
                    peer.publications.iter().map(move |(kind, track)| RemotePublication {
                        participant: *id,
                        kind: *kind,
                        track: *track,
                    })
                })
                .collect();
            publications.sort_by_key(|p| (p.participant, p.kind));
            Ok(publications)
        })
    }

    fn handle_signal(
        &self,
        from: ParticipantId,
        payload: SignalPayload,
    ) -> BoxFuture<'_, Result<(), MediaError>> {
        Box::pin(async move {
            let me = self.require_me()?;
            // Offers are answered; everything else is absorbed.
            if let SignalPayload::Offer { sdp } = payload {
                let peers = self.sfu.peers();
                if let Some(events) = peers.get(&me).and_then(|p| p.events.as_ref()) {
                    let answer = MediaEvent::Signal {
                        target: from,
                        payload: SignalPayload::Answer { sdp: format!("answer:{sdp}") },
                    };
                    events
                        .try_send(answer)
                        .map_err(|e| MediaError::Negotiation(e.to_string()))?;
                }
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(me) = self.me() else { return };
            self.set_me(None);
            let mut peers = self.sfu.peers();
            if peers.remove(&me).is_some() {
                SyntheticSfu::broadcast(&peers, me, MediaEvent::ParticipantLeft(me));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn grant() -> MediaGrant {
        MediaGrant {
            token: "t".into(),
            url: "synthetic://sfu".into(),
            expires_at: now_millis() + 60_000,
        }
    }

    #[test]
    fn test_tone_level() {
        let tone = ToneSampler::new(0.5);
        let mut buf = vec![0.0; 4800];
        assert_eq!(tone.read(&mut buf), 4800);
        let level = crate::media::rms(&buf);
        assert!((level - 0.5 / 2f32.sqrt()).abs() < 0.01, "rms {level}");

        tone.set_amplitude(0.0);
        tone.read(&mut buf);
        assert_eq!(crate::media::rms(&buf), 0.0);
    }

    #[tokio::test]
    async fn test_publish_reaches_other_peer() {
        let sfu = SyntheticSfu::new();
        let a = SyntheticBackend::new(sfu.clone());
        let b = SyntheticBackend::new(sfu.clone());
        let (id_a, id_b) = (Uuid::new_v4(), Uuid::new_v4());
        let _link_a = a.connect(grant(), id_a).await.unwrap();
        let mut link_b = b.connect(grant(), id_b).await.unwrap();

        let track = a.acquire(SourceKind::Camera).await.unwrap();
        a.publish(track.clone()).await.unwrap();

        match link_b.events.recv().await {
            Some(MediaEvent::TrackPublished(publication)) => {
                assert_eq!(publication.participant, id_a);
                assert!(b.subscribe(publication).await.is_ok());
            }
            other => panic!("expected publication, got {other:?}"),
        }
        assert_eq!(b.remote_publications().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_grant_rejected() {
        let backend = SyntheticBackend::new(SyntheticSfu::new());
        let mut stale = grant();
        stale.expires_at = 0;
        assert!(matches!(
            backend.connect(stale, Uuid::new_v4()).await,
            Err(MediaError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_and_release() {
        let backend = SyntheticBackend::new(SyntheticSfu::new());
        let track = backend.acquire(SourceKind::Microphone).await.unwrap();
        assert!(track.sampler.is_some());
        assert_eq!(backend.live_tracks(), 1);
        backend.release(track.handle);
        assert_eq!(backend.live_tracks(), 0);

        backend.set_deny_permission(true);
        assert!(matches!(
            backend.acquire(SourceKind::Camera).await,
            Err(MediaError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_then_reconnect_in_place() {
        let sfu = SyntheticSfu::new();
        let backend = SyntheticBackend::new(sfu.clone());
        let me = Uuid::new_v4();
        let mut link = backend.connect(grant(), me).await.unwrap();

        backend.sever();
        assert!(link.events.recv().await.is_none());
        assert!(backend.reconnect().await.is_ok());
        assert!(sfu.participants().contains(&me));

        backend.disconnect().await;
        assert!(sfu.participants().is_empty());
        assert!(backend.reconnect().await.is_err());
    }
}
