use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use super::room::Room;
use super::types::RoomCode;
use crate::config::RoomTiming;

/// Live rooms by code. Owned by the server and handed to each connection
/// task. The lock covers map access only and is independent of any room's
/// own lock.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomCode, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomCode, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create and store a room under a code no live room uses
    pub fn create(&self, timing: RoomTiming) -> Arc<Room> {
        let mut rooms = self.rooms();
        let mut code = RoomCode::generate();
        while rooms.contains_key(&code) {
            code = RoomCode::generate();
        }
        let room = Arc::new(Room::new(code, timing));
        rooms.insert(code, room.clone());
        info!("Room created: {}", code);
        room
    }

    pub fn get(&self, code: &RoomCode) -> Option<Arc<Room>> {
        self.rooms().get(code).cloned()
    }

    /// Drop the room from the registry; its code stops resolving
    pub fn remove(&self, code: &RoomCode) {
        let removed = self.rooms().remove(code);
        if let Some(room) = removed {
            room.mark_closed();
            info!("Room {} removed", code);
        }
    }

    pub fn len(&self) -> usize {
        self.rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::RoomState;

    #[test]
    fn created_rooms_have_distinct_codes() {
        let registry = RoomRegistry::new();
        let a = registry.create(RoomTiming::default());
        let b = registry.create(RoomTiming::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn removed_room_no_longer_resolves() {
        let registry = RoomRegistry::new();
        let room = registry.create(RoomTiming::default());
        assert!(registry.get(&room.id()).is_some());

        registry.remove(&room.id());
        assert!(registry.get(&room.id()).is_none());
        assert!(registry.is_empty());
        assert_eq!(room.state(), RoomState::Closed);
    }

    #[test]
    fn unknown_code_is_absent() {
        let registry = RoomRegistry::new();
        assert!(registry.get(&"ZZZZZZ".parse().unwrap()).is_none());
    }
}
