//! Media session: audio/video call alongside the shared document.
//!
//! ```text
//!        join_call()          Joined            link lost
//! Idle ─────────────► Connecting ──────► Active ─────────► Reconnecting
//!   ▲                     │ error           │  ▲               │
//!   │                     ▼                 │  └── recovered ──┘
//!   └──────────────── leave_call() / failure ◄───────────────────┘
//! ```
//!
//! The manager owns the [`TrackRegistry`], the single source of truth for
//! what gets rendered. Slow work (credentials, negotiation, device capture)
//! runs in spawned tasks whose results come back through
//! [`MediaSessionManager::next_input`].

pub mod backend;
pub mod manager;
pub mod meter;
pub mod registry;
pub mod synthetic;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::protocol::ParticipantId;

pub use backend::{AudioSampler, LocalTrack, MediaBackend, MediaEvent, MediaLink};
pub use manager::{CallState, MediaInput, MediaNotice, MediaSessionManager};
pub use meter::{rms, AudioMeter, SpeakingDetector};
pub use registry::{Direction, Tile, TileKind, TrackRegistration, TrackRegistry};
pub use synthetic::{SyntheticBackend, SyntheticSfu, ToneSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    Camera,
    Screen,
    Microphone,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Screen => "screen",
            SourceKind::Microphone => "microphone",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-side identifier of a live track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(pub Uuid);

impl TrackHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A track some other participant published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePublication {
    pub participant: ParticipantId,
    pub kind: SourceKind,
    pub track: TrackHandle,
}

/// Short-lived credential for joining the media room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaGrant {
    pub token: String,
    pub url: String,
    /// ms since epoch
    pub expires_at: u64,
}
