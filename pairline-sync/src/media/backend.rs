//! The seam between the media manager and a media stack.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::{MediaGrant, RemotePublication, SourceKind, TrackHandle};
use crate::error::MediaError;
use crate::protocol::{ParticipantId, SignalPayload};

/// Pull-based access to captured audio.
pub trait AudioSampler: Send + Sync {
    /// Fill `buf` with the most recent samples; returns how many were written.
    fn read(&self, buf: &mut [f32]) -> usize;
}

/// A captured local track.
#[derive(Clone)]
pub struct LocalTrack {
    pub handle: TrackHandle,
    pub kind: SourceKind,
    /// Present for microphone tracks.
    pub sampler: Option<Arc<dyn AudioSampler>>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("sampler", &self.sampler.is_some())
            .finish()
    }
}

/// Events pushed by the media backend while connected.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    TrackPublished(RemotePublication),
    TrackUnpublished {
        participant: ParticipantId,
        kind: SourceKind,
    },
    ParticipantLeft(ParticipantId),
    /// Outbound negotiation payload to relay over the session channel.
    Signal {
        target: ParticipantId,
        payload: SignalPayload,
    },
    Disconnected(MediaError),
}

/// An open media room connection. The event stream ending means the media
/// transport was lost.
pub struct MediaLink {
    pub events: mpsc::Receiver<MediaEvent>,
}

pub trait MediaBackend: Send + Sync {
    /// Capture a local source.
    fn acquire(&self, kind: SourceKind) -> BoxFuture<'_, Result<LocalTrack, MediaError>>;

    /// Stop a captured source and release its hardware.
    fn release(&self, track: TrackHandle);

    fn connect(
        &self,
        grant: MediaGrant,
        participant: ParticipantId,
    ) -> BoxFuture<'_, Result<MediaLink, MediaError>>;

    /// Resume the current connection in place.
    fn reconnect(&self) -> BoxFuture<'_, Result<MediaLink, MediaError>>;

    fn publish(&self, track: LocalTrack) -> BoxFuture<'_, Result<(), MediaError>>;

    fn unpublish(&self, track: TrackHandle) -> BoxFuture<'_, Result<(), MediaError>>;

    fn subscribe(&self, publication: RemotePublication) -> BoxFuture<'_, Result<TrackHandle, MediaError>>;

    /// Everything other participants currently publish.
    fn remote_publications(&self) -> BoxFuture<'_, Result<Vec<RemotePublication>, MediaError>>;

    /// Negotiation payload received from another participant.
    fn handle_signal(
        &self,
        from: ParticipantId,
        payload: SignalPayload,
    ) -> BoxFuture<'_, Result<(), MediaError>>;

    /// Leave the media room. A second call is a no-op.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}
