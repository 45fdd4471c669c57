//! Track registry and tile coalescing.
//!
//! Registrations are keyed by `(participant, source kind)`, so a participant
//! holds at most one camera, one microphone and one screen registration.
//! Rendering reads [`TrackRegistry::tiles`]: camera and microphone fold into
//! one media tile, a screen share gets its own.

use std::collections::{BTreeMap, HashSet};

use super::{SourceKind, TrackHandle};
use crate::protocol::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRegistration {
    pub participant: ParticipantId,
    pub kind: SourceKind,
    pub direction: Direction,
    /// `None` while muted (the source is released).
    pub track: Option<TrackHandle>,
    pub muted: bool,
    pub published: bool,
}

impl TrackRegistration {
    pub fn local(participant: ParticipantId, kind: SourceKind, track: TrackHandle) -> Self {
        Self {
            participant,
            kind,
            direction: Direction::Local,
            track: Some(track),
            muted: false,
            published: true,
        }
    }

    pub fn remote(participant: ParticipantId, kind: SourceKind, track: TrackHandle) -> Self {
        Self {
            participant,
            kind,
            direction: Direction::Remote,
            track: Some(track),
            muted: false,
            published: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileKind {
    /// Camera and/or microphone.
    Media,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub participant: ParticipantId,
    pub kind: TileKind,
    pub local: bool,
    pub video: Option<TrackHandle>,
    pub audio: Option<TrackHandle>,
    pub video_muted: bool,
    pub audio_muted: bool,
}

#[derive(Debug, Default, Clone)]
pub struct TrackRegistry {
    entries: BTreeMap<(ParticipantId, SourceKind), TrackRegistration>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous registration for the key.
    pub fn insert(&mut self, registration: TrackRegistration) -> Option<TrackRegistration> {
        self.entries
            .insert((registration.participant, registration.kind), registration)
    }

    pub fn get(&self, participant: &ParticipantId, kind: SourceKind) -> Option<&TrackRegistration> {
        self.entries.get(&(*participant, kind))
    }

    pub fn get_mut(&mut self, participant: &ParticipantId, kind: SourceKind) -> Option<&mut TrackRegistration> {
        self.entries.get_mut(&(*participant, kind))
    }

    pub fn remove(&mut self, participant: &ParticipantId, kind: SourceKind) -> Option<TrackRegistration> {
        self.entries.remove(&(*participant, kind))
    }

    /// Drop every registration of a participant. Returns how many went.
    pub fn purge(&mut self, participant: &ParticipantId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(owner, _), _| owner != participant);
        before - self.entries.len()
    }

    /// Drop remote registrations of participants not in `known`.
    pub fn retain_known(&mut self, known: &HashSet<ParticipantId>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(owner, _), reg| reg.direction == Direction::Local || known.contains(owner));
        before - self.entries.len()
    }

    pub fn clear_remote(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, reg| reg.direction == Direction::Local);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRegistration> {
        self.entries.values()
    }

    pub fn count(&self, direction: Direction, kind: SourceKind) -> usize {
        self.entries
            .values()
            .filter(|r| r.direction == direction && r.kind == kind)
            .count()
    }

    /// Coalesced render tiles, local participant first.
    pub fn tiles(&self) -> Vec<Tile> {
        let mut media: BTreeMap<ParticipantId, Tile> = BTreeMap::new();
        let mut screens = Vec::new();

        for reg in self.entries.values() {
            let local = reg.direction == Direction::Local;
            match reg.kind {
                SourceKind::Screen => screens.push(Tile {
                    participant: reg.participant,
                    kind: TileKind::Screen,
                    local,
                    video: reg.track,
                    audio: None,
                    video_muted: reg.muted,
                    audio_muted: true,
                }),
                SourceKind::Camera | SourceKind::Microphone => {
                    let tile = media.entry(reg.participant).or_insert_with(|| Tile {
                        participant: reg.participant,
                        kind: TileKind::Media,
                        local,
                        video: None,
                        audio: None,
                        video_muted: true,
                        audio_muted: true,
                    });
                    if reg.kind == SourceKind::Camera {
                        tile.video = reg.track;
                        tile.video_muted = reg.muted;
                    } else {
                        tile.audio = reg.track;
                        tile.audio_muted = reg.muted;
                    }
                }
            }
        }

        let mut tiles: Vec<Tile> = media.into_values().chain(screens).collect();
        tiles.sort_by_key(|t| (!t.local, t.participant, t.kind == TileKind::Screen));
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_is_participant_and_kind() {
        let mut registry = TrackRegistry::new();
        let p = Uuid::new_v4();
        assert!(registry
            .insert(TrackRegistration::remote(p, SourceKind::Camera, TrackHandle::new()))
            .is_none());
        assert!(registry
            .insert(TrackRegistration::remote(p, SourceKind::Camera, TrackHandle::new()))
            .is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_camera_and_mic_coalesce_screen_separate() {
        let mut registry = TrackRegistry::new();
        let p = Uuid::new_v4();
        let cam = TrackHandle::new();
        let mic = TrackHandle::new();
        registry.insert(TrackRegistration::remote(p, SourceKind::Camera, cam));
        registry.insert(TrackRegistration::remote(p, SourceKind::Microphone, mic));
        registry.insert(TrackRegistration::remote(p, SourceKind::Screen, TrackHandle::new()));

        let tiles = registry.tiles();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0].kind, TileKind::Media);
        assert_eq!(tiles[0].video, Some(cam));
        assert_eq!(tiles[0].audio, Some(mic));
        assert_eq!(tiles[1].kind, TileKind::Screen);
    }

    #[test]
    fn test_audio_only_tile() {
        let mut registry = TrackRegistry::new();
        let p = Uuid::new_v4();
        registry.insert(TrackRegistration::remote(p, SourceKind::Microphone, TrackHandle::new()));
        let tiles = registry.tiles();
        assert_eq!(tiles.len(), 1);
        assert!(tiles[0].video.is_none());
        assert!(tiles[0].video_muted);
        assert!(!tiles[0].audio_muted);
    }

    #[test]
    fn test_local_tile_first() {
        let mut registry = TrackRegistry::new();
        let me = Uuid::new_v4();
        for _ in 0..3 {
            registry.insert(TrackRegistration::remote(Uuid::new_v4(), SourceKind::Camera, TrackHandle::new()));
        }
        registry.insert(TrackRegistration::local(me, SourceKind::Microphone, TrackHandle::new()));
        let tiles = registry.tiles();
        assert!(tiles[0].local);
        assert_eq!(tiles[0].participant, me);
    }

    #[test]
    fn test_purge_and_retain_known() {
        let mut registry = TrackRegistry::new();
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.insert(TrackRegistration::local(me, SourceKind::Camera, TrackHandle::new()));
        registry.insert(TrackRegistration::remote(a, SourceKind::Camera, TrackHandle::new()));
        registry.insert(TrackRegistration::remote(a, SourceKind::Microphone, TrackHandle::new()));
        registry.insert(TrackRegistration::remote(b, SourceKind::Camera, TrackHandle::new()));

        assert_eq!(registry.purge(&a), 2);
        let known: HashSet<_> = [a].into_iter().collect();
        assert_eq!(registry.retain_known(&known), 1);
        // Local registrations survive regardless of the roster.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.count(Direction::Local, SourceKind::Camera), 1);
    }
}
