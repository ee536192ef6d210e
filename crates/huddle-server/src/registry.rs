//! Open connections and their room memberships.
//!
//! Memberships live in one insertion-ordered `Vec` behind a single mutex,
//! next to the list of open connections. Every operation is a linear scan,
//! which is fine for small rooms and a single node. A deployment that
//! outgrows this should switch to a room -> connections index plus a
//! connection -> room index while keeping the observable behaviour below
//! (insertion order, earliest membership wins in [`RoomRegistry::find_room`]).
//!
//! The lock is only ever held inside these methods, never across a send or
//! an `.await`.

use std::collections::HashSet;
use std::sync::Arc;

use huddle_core::{ConnectionId, RoomId};
use parking_lot::Mutex;

use crate::websocket::connection::ClientConnection;

struct Membership {
    connection: Arc<ClientConnection>,
    room_id: RoomId,
}

#[derive(Default)]
struct RegistryState {
    connections: Vec<ConnectionId>,
    memberships: Vec<Membership>,
}

impl RegistryState {
    fn push(&mut self, connection: &Arc<ClientConnection>, room_id: RoomId) {
        self.memberships.push(Membership {
            connection: Arc::clone(connection),
            room_id,
        });
    }

    fn first_room(&self, connection: &ConnectionId) -> Option<RoomId> {
        self.memberships
            .iter()
            .find(|m| m.connection.id() == connection)
            .map(|m| m.room_id.clone())
    }
}

/// Which connections are open, and which room each is in.
#[derive(Default)]
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open connection that has not joined anything yet.
    pub fn register(&self, connection: &ClientConnection) {
        let mut state = self.state.lock();
        if !state.connections.contains(connection.id()) {
            state.connections.push(connection.id().clone());
        }
    }

    /// Append a membership. A connection that already has one keeps it.
    pub fn add(&self, connection: &Arc<ClientConnection>, room_id: RoomId) {
        self.state.lock().push(connection, room_id);
    }

    /// Drop every membership of `connection`, then add one for `room_id`.
    /// Returns the room the connection was in before, if any.
    pub fn replace(&self, connection: &Arc<ClientConnection>, room_id: RoomId) -> Option<RoomId> {
        let mut state = self.state.lock();
        let previous = state.first_room(connection.id());
        state.memberships.retain(|m| m.connection.id() != connection.id());
        state.push(connection, room_id);
        previous
    }

    /// Add a membership only if the connection has none.
    /// On refusal returns the room it already belongs to.
    pub fn add_if_absent(&self, connection: &Arc<ClientConnection>, room_id: RoomId) -> Result<(), RoomId> {
        let mut state = self.state.lock();
        if let Some(existing) = state.first_room(connection.id()) {
            return Err(existing);
        }
        state.push(connection, room_id);
        Ok(())
    }

    /// Room of the earliest membership of `connection`.
    pub fn find_room(&self, connection: &ConnectionId) -> Option<RoomId> {
        self.state.lock().first_room(connection)
    }

    /// Everyone in `room_id` except `excluding`, in join order. A connection
    /// that joined the same room twice is listed once.
    pub fn members_of(&self, room_id: &RoomId, excluding: &ConnectionId) -> Vec<Arc<ClientConnection>> {
        let state = self.state.lock();
        let mut members: Vec<Arc<ClientConnection>> = Vec::new();
        for m in &state.memberships {
            if &m.room_id != room_id || m.connection.id() == excluding {
                continue;
            }
            if members.iter().any(|c| c.id() == m.connection.id()) {
                continue;
            }
            members.push(Arc::clone(&m.connection));
        }
        members
    }

    /// Forget `connection` and delete every membership it holds. Returns how
    /// many memberships were removed; removing an unknown connection is a
    /// no-op.
    pub fn remove(&self, connection: &ConnectionId) -> usize {
        let mut state = self.state.lock();
        state.connections.retain(|c| c != connection);
        let before = state.memberships.len();
        state.memberships.retain(|m| m.connection.id() != connection);
        before - state.memberships.len()
    }

    /// Number of registered open connections, joined or not.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of memberships.
    pub fn len(&self) -> usize {
        self.state.lock().memberships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().memberships.is_empty()
    }

    /// Number of distinct rooms with at least one member.
    pub fn room_count(&self) -> usize {
        let state = self.state.lock();
        state.memberships.iter().map(|m| &m.room_id).collect::<HashSet<_>>().len()
    }
}
