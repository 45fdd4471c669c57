//! Presence tracking: who is in the session right now.
//!
//! ```text
//! Idle ──begin_join──► Joining ──connected──► Synced
//!                                  ▲             │ link lost
//!                                  │             ▼
//!                            Rejoining ◄── Disconnected
//!
//! any ──leave──► Left (terminal)
//! ```
//!
//! The relay is authoritative for membership: each `PresenceSync` snapshot
//! replaces the local roster, and the tracker reports what changed. Every
//! transition into `Synced` re-announces the local record, since the relay
//! forgets a connection's presence when it drops.
//!
//! Profile enrichment (name, avatar) is best-effort. Lookups run outside the
//! tracker and report back through [`PresenceTracker::apply_profile`];
//! snapshots are applied immediately whether or not lookups are pending.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::protocol::{ChannelEvent, ParticipantId, ParticipantRecord};
use crate::store::{Profile, RosterEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Idle,
    Joining,
    Synced,
    Disconnected,
    Rejoining,
    Left,
}

/// One difference between two consecutive rosters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Joined(ParticipantRecord),
    Left(ParticipantId),
    Updated {
        before: ParticipantRecord,
        after: ParticipantRecord,
    },
}

/// What a finished profile lookup changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOutcome {
    /// The local record changed and must be announced again.
    Republish(ChannelEvent),
    /// A remote record in the roster view changed.
    RosterUpdated,
    Unchanged,
}

pub struct PresenceTracker {
    local: ParticipantRecord,
    phase: PresencePhase,
    roster: BTreeMap<ParticipantId, ParticipantRecord>,
    /// Enrichment for remote participants, overlaid on every snapshot.
    profiles: HashMap<ParticipantId, Profile>,
    in_flight: HashSet<ParticipantId>,
    /// Participants already looked up; a lookup is attempted once.
    attempted: HashSet<ParticipantId>,
}

impl PresenceTracker {
    pub fn new(local_id: ParticipantId, name: Option<String>) -> Self {
        Self {
            local: ParticipantRecord::new(local_id, name),
            phase: PresencePhase::Idle,
            roster: BTreeMap::new(),
            profiles: HashMap::new(),
            in_flight: HashSet::new(),
            attempted: HashSet::new(),
        }
    }

    pub fn local(&self) -> &ParticipantRecord {
        &self.local
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local.participant_id
    }

    pub fn phase(&self) -> PresencePhase {
        self.phase
    }

    pub fn begin_join(&mut self) {
        if self.phase == PresencePhase::Idle {
            self.phase = PresencePhase::Joining;
        }
    }

    /// The channel is subscribed. Returns the announcement to publish.
    pub fn on_connected(&mut self) -> Option<ChannelEvent> {
        if self.phase == PresencePhase::Left {
            return None;
        }
        self.phase = PresencePhase::Synced;
        Some(ChannelEvent::Join(self.local.clone()))
    }

    pub fn on_disconnected(&mut self) {
        if matches!(self.phase, PresencePhase::Synced | PresencePhase::Joining | PresencePhase::Rejoining) {
            self.phase = PresencePhase::Disconnected;
        }
    }

    pub fn on_reconnecting(&mut self) {
        if self.phase == PresencePhase::Disconnected {
            self.phase = PresencePhase::Rejoining;
        }
    }

    /// Pre-populate the profile cache from the stored participant list.
    pub fn seed_profiles(&mut self, entries: Vec<RosterEntry>) {
        for entry in entries {
            if entry.participant_id == self.local.participant_id {
                fill_missing(&mut self.local, entry.name.as_deref(), entry.avatar_url.as_deref());
                continue;
            }
            self.profiles.insert(entry.participant_id, entry.into());
        }
    }

    /// Replace the roster with a relay snapshot.
    pub fn apply_snapshot(&mut self, records: Vec<ParticipantRecord>) -> Vec<RosterChange> {
        if self.phase == PresencePhase::Left {
            return Vec::new();
        }

        let mut next = BTreeMap::new();
        for mut record in records {
            if let Some(profile) = self.profiles.get(&record.participant_id) {
                fill_missing(&mut record, profile.name.as_deref(), profile.avatar_url.as_deref());
            }
            // Typing is learned from signals, never from announcements.
            if let Some(known) = self.roster.get(&record.participant_id) {
                record.last_seen = record.last_seen.max(known.last_seen);
                record.typing = known.typing;
            }
            next.insert(record.participant_id, record);
        }

        let mut changes = Vec::new();
        for (id, record) in &next {
            match self.roster.get(id) {
                None => changes.push(RosterChange::Joined(record.clone())),
                Some(before) if !before.same_announcement(record) => changes.push(RosterChange::Updated {
                    before: before.clone(),
                    after: record.clone(),
                }),
                Some(_) => {}
            }
        }
        for id in self.roster.keys() {
            if !next.contains_key(id) {
                changes.push(RosterChange::Left(*id));
            }
        }

        for change in &changes {
            match change {
                RosterChange::Joined(r) => log::info!("{} joined", r.display_name()),
                RosterChange::Left(id) => log::info!("Participant {id} left"),
                RosterChange::Updated { .. } => {}
            }
        }

        self.roster = next;
        changes
    }

    /// Participants whose profile should be fetched now. Each one is
    /// returned at most once.
    pub fn missing_enrichment(&mut self) -> Vec<ParticipantId> {
        let mut ids = Vec::new();
        if self.local.needs_enrichment() {
            ids.push(self.local.participant_id);
        }
        ids.extend(
            self.roster
                .values()
                .filter(|r| r.participant_id != self.local.participant_id && r.needs_enrichment())
                .map(|r| r.participant_id),
        );
        ids.retain(|id| !self.attempted.contains(id));
        for id in &ids {
            self.attempted.insert(*id);
            self.in_flight.insert(*id);
        }
        ids
    }

    pub fn lookups_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Apply a finished lookup. `None` means no profile exists or the lookup
    /// failed; either way the participant is not looked up again.
    pub fn apply_profile(&mut self, participant: ParticipantId, profile: Option<Profile>) -> ProfileOutcome {
        self.in_flight.remove(&participant);
        let Some(profile) = profile else {
            return ProfileOutcome::Unchanged;
        };
        if self.phase == PresencePhase::Left {
            return ProfileOutcome::Unchanged;
        }

        if participant == self.local.participant_id {
            let before = self.local.clone();
            fill_missing(&mut self.local, profile.name.as_deref(), profile.avatar_url.as_deref());
            if self.local.same_announcement(&before) {
                return ProfileOutcome::Unchanged;
            }
            if let Some(own) = self.roster.get_mut(&participant) {
                fill_missing(own, profile.name.as_deref(), profile.avatar_url.as_deref());
            }
            return match self.phase {
                PresencePhase::Synced => ProfileOutcome::Republish(ChannelEvent::Join(self.local.clone())),
                // Announced on the next connect.
                _ => ProfileOutcome::Unchanged,
            };
        }

        let changed = match self.roster.get_mut(&participant) {
            Some(record) => {
                let before = record.clone();
                fill_missing(record, profile.name.as_deref(), profile.avatar_url.as_deref());
                !record.same_announcement(&before)
            }
            None => false,
        };
        self.profiles.insert(participant, profile);
        if changed {
            ProfileOutcome::RosterUpdated
        } else {
            ProfileOutcome::Unchanged
        }
    }

    /// Update the local call flag. Returns the announcement when synced.
    pub fn set_in_call(&mut self, in_call: bool) -> Option<ChannelEvent> {
        if self.local.in_call == in_call {
            return None;
        }
        self.local.in_call = in_call;
        if let Some(own) = self.roster.get_mut(&self.local.participant_id) {
            own.in_call = in_call;
        }
        (self.phase == PresencePhase::Synced).then(|| ChannelEvent::Join(self.local.clone()))
    }

    /// Mirror a remote participant's call flag until the next snapshot.
    pub fn set_remote_in_call(&mut self, participant: ParticipantId, in_call: bool) -> bool {
        match self.roster.get_mut(&participant) {
            Some(record) if record.in_call != in_call => {
                record.in_call = in_call;
                true
            }
            _ => false,
        }
    }

    pub fn set_remote_typing(&mut self, participant: ParticipantId, typing: bool) -> bool {
        match self.roster.get_mut(&participant) {
            Some(record) if record.typing != typing => {
                record.typing = typing;
                true
            }
            _ => false,
        }
    }

    /// Record that something was heard from `sender`.
    pub fn touch(&mut self, sender: ParticipantId, now_ms: u64) {
        if let Some(record) = self.roster.get_mut(&sender) {
            record.last_seen = record.last_seen.max(now_ms);
        }
    }

    /// Leave the session. Returns the departure to publish, once.
    pub fn leave(&mut self) -> Option<ChannelEvent> {
        if self.phase == PresencePhase::Left {
            return None;
        }
        let announced = self.phase != PresencePhase::Idle;
        self.phase = PresencePhase::Left;
        self.roster.clear();
        self.in_flight.clear();
        announced.then(|| ChannelEvent::Leave {
            sender_id: self.local.participant_id,
        })
    }

    /// Snapshot of the roster view.
    pub fn roster(&self) -> Vec<ParticipantRecord> {
        self.roster.values().cloned().collect()
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&ParticipantRecord> {
        self.roster.get(participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.roster.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    /// Remote participants currently flagged as in the call.
    pub fn in_call_remotes(&self) -> Vec<ParticipantId> {
        self.roster
            .values()
            .filter(|r| r.in_call && r.participant_id != self.local.participant_id)
            .map(|r| r.participant_id)
            .collect()
    }
}

fn fill_missing(record: &mut ParticipantRecord, name: Option<&str>, avatar_url: Option<&str>) {
    if record.name.is_none() {
        record.name = name.map(str::to_owned);
    }
    if record.avatar_url.is_none() {
        record.avatar_url = avatar_url.map(str::to_owned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(id: ParticipantId, name: &str) -> ParticipantRecord {
        ParticipantRecord::new(id, Some(name.to_string()))
    }

    fn synced(name: Option<&str>) -> PresenceTracker {
        let mut tracker = PresenceTracker::new(Uuid::new_v4(), name.map(str::to_string));
        tracker.begin_join();
        tracker.on_connected();
        tracker
    }

    #[test]
    fn test_announces_on_every_connect() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4(), Some("ada".into()));
        tracker.begin_join();
        assert_eq!(tracker.phase(), PresencePhase::Joining);
        assert!(matches!(tracker.on_connected(), Some(ChannelEvent::Join(r)) if r.name.as_deref() == Some("ada")));

        tracker.on_disconnected();
        tracker.on_reconnecting();
        assert_eq!(tracker.phase(), PresencePhase::Rejoining);
        assert!(tracker.on_connected().is_some());
        assert_eq!(tracker.phase(), PresencePhase::Synced);
    }

    #[test]
    fn test_snapshot_diff() {
        let mut tracker = synced(Some("me"));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let changes = tracker.apply_snapshot(vec![record(a, "a"), record(b, "b")]);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| matches!(c, RosterChange::Joined(_))));

        let mut a_in_call = record(a, "a");
        a_in_call.in_call = true;
        let changes = tracker.apply_snapshot(vec![a_in_call]);
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&RosterChange::Left(b)));
        assert!(changes
            .iter()
            .any(|c| matches!(c, RosterChange::Updated { before, after } if !before.in_call && after.in_call)));
        assert_eq!(tracker.in_call_remotes(), vec![a]);
    }

    #[test]
    fn test_identical_snapshot_is_quiet() {
        let mut tracker = synced(Some("me"));
        let a = record(Uuid::new_v4(), "a");
        tracker.apply_snapshot(vec![a.clone()]);
        let mut later = a.clone();
        later.last_seen += 10;
        assert!(tracker.apply_snapshot(vec![later]).is_empty());
    }

    #[test]
    fn test_snapshot_keeps_typing() {
        let mut tracker = synced(Some("me"));
        let a = record(Uuid::new_v4(), "a");
        tracker.apply_snapshot(vec![a.clone()]);
        assert!(tracker.set_remote_typing(a.participant_id, true));

        assert!(tracker.apply_snapshot(vec![a.clone()]).is_empty());
        assert_eq!(tracker.get(&a.participant_id).map(|r| r.typing), Some(true));
        assert!(!tracker.set_remote_typing(a.participant_id, true));
    }

    #[test]
    fn test_enrichment_requested_once() {
        let mut tracker = synced(None);
        let a = Uuid::new_v4();
        tracker.apply_snapshot(vec![ParticipantRecord::new(a, None)]);

        let ids = tracker.missing_enrichment();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&tracker.local_id()));
        assert_eq!(tracker.lookups_in_flight(), 2);
        assert!(tracker.missing_enrichment().is_empty());
    }

    #[test]
    fn test_local_profile_republishes() {
        let mut tracker = synced(None);
        let me = tracker.local_id();
        let outcome = tracker.apply_profile(
            me,
            Some(Profile {
                participant_id: me,
                name: Some("grace".into()),
                avatar_url: None,
            }),
        );
        match outcome {
            ProfileOutcome::Republish(ChannelEvent::Join(r)) => assert_eq!(r.name.as_deref(), Some("grace")),
            other => panic!("expected republish, got {other:?}"),
        }
        assert_eq!(tracker.apply_profile(me, None), ProfileOutcome::Unchanged);
    }

    #[test]
    fn test_remote_profile_overlays_later_snapshots() {
        let mut tracker = synced(Some("me"));
        let a = Uuid::new_v4();
        tracker.apply_snapshot(vec![ParticipantRecord::new(a, None)]);
        let profile = Profile {
            participant_id: a,
            name: Some("linus".into()),
            avatar_url: Some("https://img/linus.png".into()),
        };
        assert_eq!(tracker.apply_profile(a, Some(profile)), ProfileOutcome::RosterUpdated);

        // The relay still reports the bare record.
        assert!(tracker.apply_snapshot(vec![ParticipantRecord::new(a, None)]).is_empty());
        assert_eq!(tracker.get(&a).and_then(|r| r.name.as_deref()), Some("linus"));
    }

    #[test]
    fn test_seeded_profiles() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(me, None);
        tracker.seed_profiles(vec![
            RosterEntry { participant_id: me, name: Some("host".into()), avatar_url: None },
            RosterEntry { participant_id: a, name: Some("guest".into()), avatar_url: None },
        ]);
        assert_eq!(tracker.local().name.as_deref(), Some("host"));
        tracker.begin_join();
        tracker.on_connected();
        tracker.apply_snapshot(vec![ParticipantRecord::new(a, None)]);
        assert_eq!(tracker.get(&a).and_then(|r| r.name.as_deref()), Some("guest"));
    }

    #[test]
    fn test_call_flag_announced_only_when_synced() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4(), Some("me".into()));
        assert!(tracker.set_in_call(true).is_none());
        tracker.begin_join();
        assert!(matches!(tracker.on_connected(), Some(ChannelEvent::Join(r)) if r.in_call));
        assert!(tracker.set_in_call(true).is_none());
        assert!(tracker.set_in_call(false).is_some());
    }

    #[test]
    fn test_touch_refreshes_last_seen() {
        let mut tracker = synced(Some("me"));
        let a = record(Uuid::new_v4(), "a");
        let seen = a.last_seen;
        tracker.apply_snapshot(vec![a.clone()]);
        tracker.touch(a.participant_id, seen + 5_000);
        assert_eq!(tracker.get(&a.participant_id).map(|r| r.last_seen), Some(seen + 5_000));
        tracker.touch(a.participant_id, seen);
        assert_eq!(tracker.get(&a.participant_id).map(|r| r.last_seen), Some(seen + 5_000));
    }

    #[test]
    fn test_leave_is_terminal() {
        let mut tracker = synced(Some("me"));
        tracker.apply_snapshot(vec![record(Uuid::new_v4(), "a")]);
        assert!(matches!(tracker.leave(), Some(ChannelEvent::Leave { .. })));
        assert!(tracker.leave().is_none());
        assert!(tracker.is_empty());
        assert!(tracker.on_connected().is_none());
        assert!(tracker.apply_snapshot(vec![record(Uuid::new_v4(), "b")]).is_empty());
    }
}
