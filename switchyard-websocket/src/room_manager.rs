//! Registry of rooms keyed by id.

use crate::client::Client;
use crate::config::HubConfig;
use crate::error::{WebSocketError, WebSocketResult};
use crate::handler::HubHandlers;
use crate::room::{Room, RoomConfig, RoomId, RoomRegistry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over rooms, used by [`RoomManager::find_rooms`].
///
/// All configured criteria must match.
#[derive(Clone, Default)]
pub struct RoomFilter {
    room_type: Option<String>,
    tags: Vec<String>,
    min_members: Option<usize>,
    max_members: Option<usize>,
    has_space: bool,
    metadata: Vec<(String, serde_json::Value)>,
    predicate: Option<Arc<dyn Fn(&Room) -> bool + Send + Sync>>,
}

impl RoomFilter {
    /// A filter matching every room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match rooms of this type.
    pub fn room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = Some(room_type.into());
        self
    }

    /// Match rooms carrying this tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Match rooms with at least `n` members.
    pub fn min_members(mut self, n: usize) -> Self {
        self.min_members = Some(n);
        self
    }

    /// Match rooms with at most `n` members.
    pub fn max_members(mut self, n: usize) -> Self {
        self.max_members = Some(n);
        self
    }

    /// Match rooms that can accept another member.
    pub fn has_space(mut self) -> Self {
        self.has_space = true;
        self
    }

    /// Match rooms whose metadata entry equals `value`.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    /// Match rooms accepted by a custom predicate.
    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Room) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Evaluate the filter against a room.
    pub fn matches(&self, room: &Room) -> bool {
        if room.is_destroyed() {
            return false;
        }
        if let Some(room_type) = &self.room_type {
            if room.room_type() != Some(room_type.as_str()) {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| room.tags().contains(tag)) {
            return false;
        }

        let len = room.len();
        if self.min_members.is_some_and(|min| len < min) {
            return false;
        }
        if self.max_members.is_some_and(|max| len > max) {
            return false;
        }
        if self.has_space && room.is_full() {
            return false;
        }
        if !self
            .metadata
            .iter()
            .all(|(key, value)| room.metadata(key).as_ref() == Some(value))
        {
            return false;
        }
        self.predicate.as_ref().is_none_or(|f| f(room))
    }
}

/// Manages rooms and their lifecycle.
pub struct RoomManager {
    rooms: Arc<RoomRegistry>,
    room_types: RwLock<HashMap<String, RoomConfig>>,
    max_rooms: usize,
    default_config: RoomConfig,
    allow_dynamic_rooms: bool,
    send_timeout: Duration,
    handlers: Arc<HubHandlers>,
}

impl RoomManager {
    /// Create a standalone room manager.
    pub fn new(config: &HubConfig) -> Self {
        Self::with_handlers(config, Arc::new(HubHandlers::default()))
    }

    pub(crate) fn with_handlers(config: &HubConfig, handlers: Arc<HubHandlers>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            room_types: RwLock::new(HashMap::new()),
            max_rooms: config.max_rooms,
            default_config: config.default_room.clone(),
            allow_dynamic_rooms: config.allow_dynamic_rooms,
            send_timeout: config.broadcast_timeout,
            handlers,
        }
    }

    pub(crate) fn handlers(&self) -> Arc<HubHandlers> {
        Arc::clone(&self.handlers)
    }

    /// Register a named room template.
    pub fn register_room_type(&self, name: impl Into<String>, config: RoomConfig) {
        self.room_types.write().insert(name.into(), config);
    }

    /// Look up a room template.
    pub fn room_type(&self, name: &str) -> Option<RoomConfig> {
        self.room_types.read().get(name).cloned()
    }

    fn build_room(&self, id: &str, name: &str, config: RoomConfig) -> Arc<Room> {
        Arc::new(Room::new(
            id.to_string(),
            name.to_string(),
            config,
            Arc::downgrade(&self.rooms),
            Arc::clone(&self.handlers),
            self.send_timeout,
        ))
    }

    fn check_limit(&self, rooms: &HashMap<RoomId, Arc<Room>>) -> WebSocketResult<()> {
        if self.max_rooms == 0 {
            return Ok(());
        }
        // Rooms destroyed but not yet evicted no longer hold a slot.
        let live = rooms.values().filter(|room| !room.is_destroyed()).count();
        if live >= self.max_rooms {
            return Err(WebSocketError::RoomLimitReached {
                limit: self.max_rooms,
            });
        }
        Ok(())
    }

    /// Create a room. Fails if the id is taken or the room limit is reached.
    pub fn create_room(
        &self,
        id: &str,
        name: &str,
        config: Option<RoomConfig>,
    ) -> WebSocketResult<Arc<Room>> {
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(id) {
            if !room.is_destroyed() {
                return Err(WebSocketError::RoomExists(id.to_string()));
            }
            rooms.remove(id);
        }
        self.check_limit(&rooms)?;

        let room = self.build_room(id, name, config.unwrap_or_else(|| self.default_config.clone()));
        rooms.insert(id.to_string(), Arc::clone(&room));
        drop(rooms);

        tracing::debug!(room_id = %id, "Room created");
        Ok(room)
    }

    /// Create a room from a registered template.
    pub fn create_room_of_type(
        &self,
        id: &str,
        name: &str,
        room_type: &str,
    ) -> WebSocketResult<Arc<Room>> {
        let mut config = self
            .room_type(room_type)
            .ok_or_else(|| WebSocketError::UnknownRoomType(room_type.to_string()))?;
        config.room_type.get_or_insert_with(|| room_type.to_string());
        self.create_room(id, name, Some(config))
    }

    /// Get a live room.
    pub fn get_room(&self, id: &str) -> WebSocketResult<Arc<Room>> {
        match self.rooms.read().get(id) {
            Some(room) if !room.is_destroyed() => Ok(Arc::clone(room)),
            _ => Err(WebSocketError::RoomNotFound(id.to_string())),
        }
    }

    /// Get a room, creating it when missing.
    ///
    /// Creation is refused when dynamic rooms are disabled or the room
    /// limit is reached.
    pub fn get_or_create_room(
        &self,
        id: &str,
        name: &str,
        config: Option<RoomConfig>,
    ) -> WebSocketResult<Arc<Room>> {
        if let Ok(room) = self.get_room(id) {
            return Ok(room);
        }

        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(id) {
            if !room.is_destroyed() {
                return Ok(Arc::clone(room));
            }
            // Destroyed but not yet evicted.
            rooms.remove(id);
        }
        if !self.allow_dynamic_rooms {
            return Err(WebSocketError::DynamicRoomsDisabled(id.to_string()));
        }
        self.check_limit(&rooms)?;

        let room = self.build_room(id, name, config.unwrap_or_else(|| self.default_config.clone()));
        rooms.insert(id.to_string(), Arc::clone(&room));
        drop(rooms);

        tracing::debug!(room_id = %id, "Room created on demand");
        Ok(room)
    }

    /// Destroy and evict a room. Returns false if it did not exist.
    pub fn remove_room(&self, id: &str) -> bool {
        let removed = self.rooms.write().remove(id);
        match removed {
            Some(room) => {
                room.destroy();
                true
            }
            None => false,
        }
    }

    /// Rooms matching `filter`, as of the time of the call.
    pub fn find_rooms(&self, filter: &RoomFilter) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .values()
            .filter(|room| filter.matches(room))
            .cloned()
            .collect()
    }

    /// Add a client to an existing room.
    pub fn join_room(&self, room_id: &str, client: &Arc<Client>) -> WebSocketResult<Arc<Room>> {
        let room = self.get_room(room_id)?;
        room.add_client(client)?;
        Ok(room)
    }

    /// Add a client to a room, creating the room when missing.
    ///
    /// A room that empties and destroys itself between lookup and join is
    /// replaced by a fresh one, so the join only fails for capacity, limit
    /// or configuration reasons.
    pub fn join_or_create(&self, room_id: &str, client: &Arc<Client>) -> WebSocketResult<Arc<Room>> {
        loop {
            let room = self.get_or_create_room(room_id, room_id, None)?;
            match room.add_client(client) {
                Ok(()) => return Ok(room),
                Err(WebSocketError::RoomDestroyed(_)) => {
                    tracing::trace!(room_id = %room_id, "Room destroyed during join, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a client from a room. Returns false if it was not a member.
    pub fn leave_room(&self, room_id: &str, client_id: &str) -> bool {
        // Release the registry lock first; removal may destroy the room.
        let room = self.rooms.read().get(room_id).cloned();
        room.is_some_and(|room| room.remove_client(client_id))
    }

    /// Remove a client from every room it belongs to.
    ///
    /// Safe for clients that never joined a room.
    pub fn leave_all_rooms(&self, client: &Client) -> usize {
        client
            .rooms()
            .iter()
            .filter(|room_id| self.leave_room(room_id, client.id()))
            .count()
    }

    /// All live room ids.
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().keys().cloned().collect()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Destroy every room.
    pub fn clear(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.write().drain().map(|(_, room)| room).collect();
        for room in rooms {
            room.destroy();
        }
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("rooms", &self.room_count())
            .field("max_rooms", &self.max_rooms)
            .finish()
    }
}
