use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;

use crate::{events::ServerEvent, presence::ConnectionId};

use super::RoomKey;

/// Outbound queue of one connection, drained by its writer task.
pub type Outbox = mpsc::UnboundedSender<Arc<ServerEvent>>;

#[derive(Debug, Default)]
struct Membership {
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<RoomKey>>,
    outboxes: HashMap<ConnectionId, Outbox>,
}

/// Process-wide room membership index.
///
/// Both directions of the connection/room relation sit behind one lock, so a broadcast
/// never observes a half-applied join or leave and deliveries into one room keep call order.
/// A room exists exactly as long as it has members.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Membership>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Membership> {
        // every mutation leaves both maps consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, conn: ConnectionId, outbox: Outbox) {
        self.lock().outboxes.insert(conn, outbox);
    }

    /// Returns `false` when `conn` was already a member.
    pub fn join(&self, conn: ConnectionId, room: &str) -> bool {
        let mut membership = self.lock();
        let added = membership
            .rooms
            .entry(RoomKey::from(room))
            .or_default()
            .insert(conn);
        membership
            .joined
            .entry(conn)
            .or_default()
            .insert(RoomKey::from(room));
        added
    }

    /// Returns `false` when `conn` was not a member.
    pub fn leave(&self, conn: ConnectionId, room: &str) -> bool {
        let mut membership = self.lock();
        let removed = match membership.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(&conn);
                if members.is_empty() {
                    membership.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = membership.joined.get_mut(&conn) {
            rooms.remove(room);
            if rooms.is_empty() {
                membership.joined.remove(&conn);
            }
        }
        removed
    }

    /// Removes `conn` from every room and forgets its outbox. Returns the rooms it left.
    pub fn leave_all(&self, conn: ConnectionId) -> Vec<RoomKey> {
        let mut membership = self.lock();
        membership.outboxes.remove(&conn);
        let left: Vec<RoomKey> = membership
            .joined
            .remove(&conn)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        for room in &left {
            if let Some(members) = membership.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    membership.rooms.remove(room);
                }
            }
        }
        left
    }

    /// Hands `event` to every member of `room` except `exclude`.
    ///
    /// Fire-and-forget: members whose outbox is closed or missing silently miss the event.
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(
        &self,
        room: &str,
        event: impl Into<Arc<ServerEvent>>,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let event = event.into();
        let membership = self.lock();
        let Some(members) = membership.rooms.get(room) else {
            return 0;
        };

        members
            .iter()
            .filter(|conn| Some(**conn) != exclude)
            .filter_map(|conn| membership.outboxes.get(conn))
            .filter(|outbox| outbox.send(event.clone()).is_ok())
            .count()
    }

    /// Delivers `event` to a single connection.
    pub fn emit(&self, conn: ConnectionId, event: impl Into<Arc<ServerEvent>>) -> bool {
        self.lock()
            .outboxes
            .get(&conn)
            .is_some_and(|outbox| outbox.send(event.into()).is_ok())
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        let mut members: Vec<_> = self
            .lock()
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomKey> {
        let mut rooms: Vec<_> = self
            .lock()
            .joined
            .get(&conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().outboxes.len()
    }
}
