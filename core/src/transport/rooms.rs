/// Per-owner room membership
///
/// A room stays joined on the server while at least one owner holds it. One
/// view's teardown only releases its own claims.
use crate::transport::protocol::Room;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Identity of one channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct RoomRegistry {
    owners: HashMap<Room, BTreeSet<OwnerId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner`'s claim on `room`. Returns `true` when the room was not
    /// held by anyone before, i.e. a join frame is due.
    pub fn acquire(&mut self, owner: OwnerId, room: Room) -> bool {
        let holders = self.owners.entry(room).or_default();
        let was_empty = holders.is_empty();
        holders.insert(owner);
        was_empty
    }

    /// Drop `owner`'s claim. Returns `true` when the room has no holder left,
    /// i.e. a leave frame is due.
    pub fn release(&mut self, owner: OwnerId, room: &Room) -> bool {
        let Some(holders) = self.owners.get_mut(room) else {
            return false;
        };
        if !holders.remove(&owner) {
            return false;
        }
        if holders.is_empty() {
            self.owners.remove(room);
            return true;
        }
        false
    }

    /// Drop every claim of `owner`. Returns the rooms left without a holder.
    pub fn release_owner(&mut self, owner: OwnerId) -> Vec<Room> {
        let held: Vec<Room> = self
            .owners
            .iter()
            .filter(|(_, holders)| holders.contains(&owner))
            .map(|(room, _)| room.clone())
            .collect();

        let mut emptied: Vec<Room> = held
            .into_iter()
            .filter(|room| self.release(owner, room))
            .collect();
        emptied.sort();
        emptied
    }

    pub fn holds(&self, owner: OwnerId, room: &Room) -> bool {
        self.owners
            .get(room)
            .map(|holders| holders.contains(&owner))
            .unwrap_or(false)
    }

    pub fn is_active(&self, room: &Room) -> bool {
        self.owners.contains_key(room)
    }

    /// Every room with at least one holder, sorted
    pub fn active_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.owners.keys().cloned().collect();
        rooms.sort();
        rooms
    }
}
