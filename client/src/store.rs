use roomscope_shared::{Room, RoomId};
use std::collections::{HashMap, HashSet, hash_map::Entry};
use std::time::Duration;
use tokio::time::Instant;

/// Set whose members expire on their own.
///
/// Each member owns exactly one deadline. Re-inserting a member keeps the
/// original deadline, and removing it drops the deadline, so an expiry can
/// never outlive an explicit removal.
#[derive(Debug, Default, Clone)]
pub struct TtlSet {
    deadlines: HashMap<RoomId, Instant>,
}

impl TtlSet {
    /// Returns false if the id was already present (its deadline is unchanged)
    pub fn insert(&mut self, id: RoomId, ttl: Duration, now: Instant) -> bool {
        match self.deadlines.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now + ttl);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &RoomId) -> bool {
        self.deadlines.remove(id).is_some()
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.deadlines.contains_key(id)
    }

    pub fn deadline(&self, id: &RoomId) -> Option<Instant> {
        self.deadlines.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RoomId> {
        self.deadlines.keys()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every member whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<RoomId> {
        let expired: Vec<RoomId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.deadlines.remove(id);
        }
        expired
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    pub hidden: Vec<RoomId>,
    pub pending: Vec<RoomId>,
}

impl Expired {
    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty() && self.pending.is_empty()
    }
}

/// Client-side room state: the room records plus the membership and
/// visibility sets derived from them.
#[derive(Debug, Default)]
pub struct LocalStore {
    rooms: HashMap<RoomId, Room>,
    joined: HashSet<RoomId>,
    created: HashSet<RoomId>,
    discovered: HashSet<RoomId>,
    hidden: TtlSet,
    pending: TtlSet,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a room. Fields the incoming record leaves undefined
    /// keep their stored value.
    pub fn upsert_room(&mut self, room: Room) {
        let id = room.id.clone();
        if room.is_creator == Some(true) {
            self.created.insert(id.clone());
        }
        if room.has_joined == Some(true) {
            self.joined.insert(id.clone());
        }
        self.discovered.insert(id.clone());
        match self.rooms.entry(id) {
            Entry::Occupied(mut entry) => entry.get_mut().merge(room),
            Entry::Vacant(entry) => {
                entry.insert(room);
            }
        }
    }

    pub fn upsert_rooms(&mut self, rooms: impl IntoIterator<Item = Room>) {
        for room in rooms {
            self.upsert_room(room);
        }
    }

    /// Drop the record and purge the id from every derived set
    pub fn remove_room(&mut self, id: &RoomId) -> Option<Room> {
        self.joined.remove(id);
        self.created.remove(id);
        self.discovered.remove(id);
        self.hidden.remove(id);
        self.pending.remove(id);
        self.rooms.remove(id)
    }

    /// Keep only records `keep` accepts, plus rooms that are pending, joined
    /// or created here. Returns how many records were dropped.
    pub fn retain_rooms(&mut self, keep: impl Fn(&RoomId) -> bool) -> usize {
        let before = self.rooms.len();
        let Self {
            rooms,
            joined,
            created,
            discovered,
            pending,
            ..
        } = self;
        rooms.retain(|id, room| {
            keep(id)
                || pending.contains(id)
                || joined.contains(id)
                || created.contains(id)
                || room.is_creator == Some(true)
        });
        discovered.retain(|id| rooms.contains_key(id));
        before - rooms.len()
    }

    pub fn hide(&mut self, id: RoomId, ttl: Duration, now: Instant) -> bool {
        self.hidden.insert(id, ttl, now)
    }

    pub fn unhide(&mut self, id: &RoomId) -> bool {
        self.hidden.remove(id)
    }

    pub fn mark_pending(&mut self, id: RoomId, ttl: Duration, now: Instant) -> bool {
        self.pending.insert(id, ttl, now)
    }

    pub fn unmark_pending(&mut self, id: &RoomId) -> bool {
        self.pending.remove(id)
    }

    pub fn mark_joined(&mut self, id: RoomId) {
        self.joined.insert(id);
    }

    pub fn mark_left(&mut self, id: &RoomId) {
        self.joined.remove(id);
    }

    pub fn mark_created(&mut self, id: RoomId) {
        self.created.insert(id);
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn is_joined(&self, id: &RoomId) -> bool {
        self.joined.contains(id)
    }

    /// Created locally, or flagged as ours by the server
    pub fn is_created(&self, id: &RoomId) -> bool {
        self.created.contains(id)
            || self
                .rooms
                .get(id)
                .is_some_and(|room| room.is_creator == Some(true))
    }

    pub fn is_discovered(&self, id: &RoomId) -> bool {
        self.discovered.contains(id)
    }

    pub fn is_hidden(&self, id: &RoomId) -> bool {
        self.hidden.contains(id)
    }

    pub fn is_pending(&self, id: &RoomId) -> bool {
        self.pending.contains(id)
    }

    pub fn pending(&self) -> &TtlSet {
        &self.pending
    }

    pub fn hidden(&self) -> &TtlSet {
        &self.hidden
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        match (self.hidden.next_deadline(), self.pending.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn expire_due(&mut self, now: Instant) -> Expired {
        Expired {
            hidden: self.hidden.expire(now),
            pending: self.pending.expire(now),
        }
    }
}
