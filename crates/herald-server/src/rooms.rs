use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use herald_core::ids::{ConversationId, SessionId};

#[derive(Default)]
struct RoomState {
    by_room: HashMap<ConversationId, HashSet<SessionId>>,
    by_session: HashMap<SessionId, HashSet<ConversationId>>,
}

/// Many-to-many mapping between live sessions and the conversation rooms
/// they have joined.
///
/// Membership here is a local best-effort mirror of store membership
/// (trust-on-join): it decides who receives fan-out, never who is allowed
/// to send. The authoritative participant check happens against the store
/// on every send. All mutations run under one write lock with no await
/// points, so no reader ever observes a half-updated pair of maps.
pub struct RoomIndex {
    state: RwLock<RoomState>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RoomState::default()),
        }
    }

    /// Add a session to a room. Idempotent; joining twice is a no-op.
    pub fn join(&self, session_id: &SessionId, room: ConversationId) {
        let mut state = self.state.write();
        let inserted = state
            .by_room
            .entry(room)
            .or_default()
            .insert(session_id.clone());
        state
            .by_session
            .entry(session_id.clone())
            .or_default()
            .insert(room);

        if inserted {
            debug!(session_id = %session_id, room = %room, "session joined room");
        }
    }

    /// Mirror a membership list into the index at connect time.
    pub fn bulk_join(&self, session_id: &SessionId, rooms: &[ConversationId]) {
        let mut state = self.state.write();
        let joined = state
            .by_session
            .entry(session_id.clone())
            .or_default();
        for room in rooms {
            joined.insert(*room);
        }
        for room in rooms {
            state
                .by_room
                .entry(*room)
                .or_default()
                .insert(session_id.clone());
        }

        debug!(session_id = %session_id, rooms = rooms.len(), "bulk-joined rooms");
    }

    /// Every session currently joined to the room, in no particular order.
    pub fn broadcast_targets(&self, room: ConversationId) -> Vec<SessionId> {
        let state = self.state.read();
        state
            .by_room
            .get(&room)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, session_id: &SessionId, room: ConversationId) -> bool {
        let state = self.state.read();
        state
            .by_room
            .get(&room)
            .is_some_and(|sessions| sessions.contains(session_id))
    }

    /// Rooms a session has joined. Observability and tests only.
    pub fn rooms_for_session(&self, session_id: &SessionId) -> Vec<ConversationId> {
        let state = self.state.read();
        state
            .by_session
            .get(session_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a session from every room it had joined. Returns the number of
    /// rooms it was removed from. Called on disconnect.
    pub fn remove_session(&self, session_id: &SessionId) -> usize {
        let mut state = self.state.write();
        let rooms = match state.by_session.remove(session_id) {
            Some(rooms) => rooms,
            None => return 0,
        };

        let mut removed = 0;
        for room in &rooms {
            if let Some(sessions) = state.by_room.get_mut(room) {
                if sessions.remove(session_id) {
                    removed += 1;
                }
                if sessions.is_empty() {
                    state.by_room.remove(room);
                }
            }
        }
        removed
    }

    /// Number of rooms with at least one joined session.
    pub fn room_count(&self) -> usize {
        self.state.read().by_room.len()
    }
}

impl Default for RoomIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_registers_broadcast_target() {
        let index = RoomIndex::new();
        let session = SessionId::new();
        index.join(&session, ConversationId::new(7));

        assert_eq!(index.broadcast_targets(ConversationId::new(7)), vec![session.clone()]);
        assert!(index.is_joined(&session, ConversationId::new(7)));
    }

    #[test]
    fn join_is_idempotent() {
        let index = RoomIndex::new();
        let session = SessionId::new();
        index.join(&session, ConversationId::new(7));
        index.join(&session, ConversationId::new(7));

        let targets = index.broadcast_targets(ConversationId::new(7));
        assert_eq!(targets.len(), 1);
        assert_eq!(index.rooms_for_session(&session).len(), 1);
    }

    #[test]
    fn bulk_join_mirrors_membership_list() {
        let index = RoomIndex::new();
        let session = SessionId::new();
        let rooms: Vec<ConversationId> = [1, 2, 3].into_iter().map(ConversationId::new).collect();
        index.bulk_join(&session, &rooms);

        for room in &rooms {
            assert!(index.is_joined(&session, *room));
        }
        assert_eq!(index.rooms_for_session(&session).len(), 3);
    }

    #[test]
    fn targets_for_unknown_room_are_empty() {
        let index = RoomIndex::new();
        assert!(index.broadcast_targets(ConversationId::new(404)).is_empty());
    }

    #[test]
    fn multiple_sessions_share_a_room() {
        let index = RoomIndex::new();
        let a = SessionId::new();
        let b = SessionId::new();
        index.join(&a, ConversationId::new(7));
        index.join(&b, ConversationId::new(7));

        let targets = index.broadcast_targets(ConversationId::new(7));
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&a));
        assert!(targets.contains(&b));
    }

    #[test]
    fn remove_session_clears_every_room() {
        let index = RoomIndex::new();
        let a = SessionId::new();
        let b = SessionId::new();
        index.bulk_join(&a, &[ConversationId::new(1), ConversationId::new(2)]);
        index.join(&b, ConversationId::new(1));

        let removed = index.remove_session(&a);
        assert_eq!(removed, 2);
        assert!(index.rooms_for_session(&a).is_empty());
        assert!(!index.is_joined(&a, ConversationId::new(1)));

        // b is untouched
        assert_eq!(index.broadcast_targets(ConversationId::new(1)), vec![b]);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let index = RoomIndex::new();
        let session = SessionId::new();
        index.join(&session, ConversationId::new(7));
        assert_eq!(index.room_count(), 1);

        index.remove_session(&session);
        assert_eq!(index.room_count(), 0);
    }

    #[test]
    fn remove_unknown_session_is_inert() {
        let index = RoomIndex::new();
        assert_eq!(index.remove_session(&SessionId::new()), 0);
    }
}
