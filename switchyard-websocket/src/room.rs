//! Rooms: capacity-bounded client groups with scoped broadcast and presence.
//!
//! The room's member map is the canonical membership. Each client keeps a
//! secondary index of the rooms it belongs to; both are updated while the
//! room's member lock is held, always room first and client second.

use crate::client::{Client, ClientId, fan_out};
use crate::error::{WebSocketError, WebSocketResult};
use crate::handler::HubHandlers;
use crate::message::Message;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a room.
pub type RoomId = String;

pub(crate) type RoomRegistry = RwLock<HashMap<RoomId, Arc<Room>>>;

/// Callback fired when a client joins or leaves a room.
pub type MemberHook = Arc<dyn Fn(&Room, &Arc<Client>) + Send + Sync>;

/// Callback fired once when a room is destroyed.
pub type DestroyHook = Arc<dyn Fn(&Room) + Send + Sync>;

/// Room configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Optional type tag used by filters and templates
    pub room_type: Option<String>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Member limit, `0` for unlimited
    pub max_clients: usize,
    /// Destroy the room when its last member leaves
    pub destroy_when_empty: bool,
    /// Keep per-member presence records
    pub track_presence: bool,
    /// Initial room metadata
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_type: None,
            tags: Vec::new(),
            max_clients: 0,
            destroy_when_empty: false,
            track_presence: true,
            metadata: HashMap::new(),
        }
    }
}

impl RoomConfig {
    /// Create a configuration with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the type tag.
    pub fn with_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = Some(room_type.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the member limit.
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Destroy the room when the last member leaves.
    pub fn with_destroy_when_empty(mut self, enabled: bool) -> Self {
        self.destroy_when_empty = enabled;
        self
    }

    /// Enable or disable presence records.
    pub fn with_presence(mut self, enabled: bool) -> Self {
        self.track_presence = enabled;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A member's presence record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceInfo {
    /// Member identity
    pub client_id: ClientId,
    /// When the member joined (connection time when presence is not tracked)
    pub joined_at: DateTime<Utc>,
    /// Member's remote address
    pub remote_addr: Option<SocketAddr>,
    /// Presence metadata set through [`Room::update_presence`]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PresenceInfo {
    fn for_client(client: &Client, joined_at: DateTime<Utc>) -> Self {
        Self {
            client_id: client.id().to_string(),
            joined_at,
            remote_addr: client.remote_addr(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct RoomHooks {
    join: Vec<MemberHook>,
    leave: Vec<MemberHook>,
    destroy: Vec<DestroyHook>,
}

/// A named group of clients.
pub struct Room {
    id: RoomId,
    name: String,
    config: RoomConfig,
    members: RwLock<HashMap<ClientId, Arc<Client>>>,
    presence: RwLock<HashMap<ClientId, PresenceInfo>>,
    metadata: RwLock<HashMap<String, serde_json::Value>>,
    hooks: RwLock<RoomHooks>,
    destroyed: AtomicBool,
    created_at: DateTime<Utc>,
    registry: Weak<RoomRegistry>,
    handlers: Arc<HubHandlers>,
    send_timeout: Duration,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        name: String,
        config: RoomConfig,
        registry: Weak<RoomRegistry>,
        handlers: Arc<HubHandlers>,
        send_timeout: Duration,
    ) -> Self {
        let metadata = config.metadata.clone();
        Self {
            id,
            name,
            config,
            members: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            metadata: RwLock::new(metadata),
            hooks: RwLock::new(RoomHooks::default()),
            destroyed: AtomicBool::new(false),
            created_at: Utc::now(),
            registry,
            handlers,
            send_timeout,
        }
    }

    /// Room identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Room configuration.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Type tag, if any.
    pub fn room_type(&self) -> Option<&str> {
        self.config.room_type.as_deref()
    }

    /// Free-form tags.
    pub fn tags(&self) -> &[String] {
        &self.config.tags
    }

    /// Member limit, `0` for unlimited.
    pub fn capacity(&self) -> usize {
        self.config.max_clients
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once [`Room::destroy`] has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// True when the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// True when the room is at its member limit.
    pub fn is_full(&self) -> bool {
        self.config.max_clients > 0 && self.len() >= self.config.max_clients
    }

    /// Check if a client is a member.
    pub fn contains(&self, client_id: &str) -> bool {
        self.members.read().contains_key(client_id)
    }

    /// Snapshot of member ids.
    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members.read().keys().cloned().collect()
    }

    /// Snapshot of members.
    pub fn members(&self) -> Vec<Arc<Client>> {
        self.members.read().values().cloned().collect()
    }

    /// Add a client to the room.
    ///
    /// Joining a room twice is a no-op. Fails when the room is destroyed,
    /// full, or the client is already closed.
    pub fn add_client(&self, client: &Arc<Client>) -> WebSocketResult<()> {
        if !client.is_connected() {
            return Err(WebSocketError::ConnectionClosed);
        }

        {
            let mut members = self.members.write();
            if self.is_destroyed() {
                return Err(WebSocketError::RoomDestroyed(self.id.clone()));
            }
            if members.contains_key(client.id()) {
                return Ok(());
            }
            if self.config.max_clients > 0 && members.len() >= self.config.max_clients {
                return Err(WebSocketError::RoomFull {
                    room_id: self.id.clone(),
                    capacity: self.config.max_clients,
                });
            }
            members.insert(client.id().to_string(), Arc::clone(client));
            client.index_room(&self.id);
            // Presence changes only under the members lock.
            if self.config.track_presence {
                self.presence.write().insert(
                    client.id().to_string(),
                    PresenceInfo::for_client(client, Utc::now()),
                );
            }
        }

        tracing::debug!(room_id = %self.id, client_id = %client.id(), "Client joined room");

        // A close that raced with the join has already swept the client's
        // room index, so undo the membership here.
        if !client.is_connected() {
            self.remove_client(client.id());
            return Err(WebSocketError::ConnectionClosed);
        }

        let hooks = self.hooks.read().join.clone();
        for hook in hooks {
            self.run_hook("join", || hook(self, client));
        }
        Ok(())
    }

    /// Remove a client from the room. Returns false if it was not a member.
    ///
    /// Destroys the room when it becomes empty and `destroy_when_empty` is set.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let (client, destroy) = {
            let mut members = self.members.write();
            let Some(client) = members.remove(client_id) else {
                return false;
            };
            client.unindex_room(&self.id);
            self.presence.write().remove(client_id);
            let destroy = members.is_empty()
                && self.config.destroy_when_empty
                && !self.destroyed.swap(true, Ordering::AcqRel);
            (client, destroy)
        };

        tracing::debug!(room_id = %self.id, client_id = %client_id, "Client left room");

        let hooks = self.hooks.read().leave.clone();
        for hook in hooks {
            self.run_hook("leave", || hook(self, &client));
        }

        if destroy {
            self.teardown();
        }
        true
    }

    /// Destroy the room. Idempotent; returns true only for the call that
    /// performed the teardown.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.teardown();
        true
    }

    fn teardown(&self) {
        let drained: Vec<Arc<Client>> = {
            let mut members = self.members.write();
            let drained: Vec<_> = members.drain().map(|(_, client)| client).collect();
            for client in &drained {
                client.unindex_room(&self.id);
            }
            self.presence.write().clear();
            drained
        };

        if let Some(registry) = self.registry.upgrade() {
            let mut rooms = registry.write();
            if rooms
                .get(&self.id)
                .is_some_and(|room| std::ptr::eq(Arc::as_ptr(room), self))
            {
                rooms.remove(&self.id);
            }
        }

        tracing::debug!(room_id = %self.id, evicted_members = drained.len(), "Room destroyed");

        let hooks = self.hooks.read().destroy.clone();
        for hook in hooks {
            self.run_hook("destroy", || hook(self));
        }
    }

    fn run_hook<F: FnOnce()>(&self, kind: &str, hook: F) {
        if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
            tracing::error!(room_id = %self.id, hook = kind, "Room hook panicked");
            self.handlers.report(
                None,
                &WebSocketError::HandlerPanic(format!("room {} {} hook", self.id, kind)),
            );
        }
    }

    /// Register a callback fired after a client joins.
    pub fn on_join<F>(&self, hook: F)
    where
        F: Fn(&Room, &Arc<Client>) + Send + Sync + 'static,
    {
        self.hooks.write().join.push(Arc::new(hook));
    }

    /// Register a callback fired after a client leaves.
    pub fn on_leave<F>(&self, hook: F)
    where
        F: Fn(&Room, &Arc<Client>) + Send + Sync + 'static,
    {
        self.hooks.write().leave.push(Arc::new(hook));
    }

    /// Register a callback fired once when the room is destroyed.
    pub fn on_destroy<F>(&self, hook: F)
    where
        F: Fn(&Room) + Send + Sync + 'static,
    {
        self.hooks.write().destroy.push(Arc::new(hook));
    }

    /// Send a message to every member.
    ///
    /// Returns the number of members targeted. Each delivery runs in its own
    /// task, so a member with a full queue does not delay the others.
    pub fn broadcast(&self, message: impl Into<Message>) -> WebSocketResult<usize> {
        self.fan_out(message.into(), &[], None)
    }

    /// Send a message to every member except the listed client ids.
    pub fn broadcast_except(
        &self,
        message: impl Into<Message>,
        exclude: &[&str],
    ) -> WebSocketResult<usize> {
        self.fan_out(message.into(), exclude, None)
    }

    /// Send a message to every member; pending deliveries stop when `cancel` fires.
    pub fn broadcast_with_cancel(
        &self,
        cancel: &CancellationToken,
        message: impl Into<Message>,
    ) -> WebSocketResult<usize> {
        self.fan_out(message.into(), &[], Some(cancel.clone()))
    }

    /// Send a `{"type": event, "data": data}` envelope to every member.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> WebSocketResult<usize> {
        let message = Message::envelope(event, data)?;
        self.fan_out(message, &[], None)
    }

    /// Send an envelope to every member except the listed client ids.
    pub fn emit_except<T: Serialize + ?Sized>(
        &self,
        event: &str,
        data: &T,
        exclude: &[&str],
    ) -> WebSocketResult<usize> {
        let message = Message::envelope(event, data)?;
        self.fan_out(message, exclude, None)
    }

    fn fan_out(
        &self,
        message: Message,
        exclude: &[&str],
        cancel: Option<CancellationToken>,
    ) -> WebSocketResult<usize> {
        if self.is_destroyed() {
            return Err(WebSocketError::RoomDestroyed(self.id.clone()));
        }

        let targets: Vec<Arc<Client>> = self
            .members
            .read()
            .values()
            .filter(|client| !exclude.iter().any(|id| *id == client.id()))
            .cloned()
            .collect();
        let count = targets.len();

        fan_out(
            targets,
            message,
            self.send_timeout,
            cancel,
            Arc::clone(&self.handlers),
        );
        Ok(count)
    }

    /// Snapshot of the current members' presence.
    pub fn get_presence(&self) -> Vec<PresenceInfo> {
        if self.config.track_presence {
            return self.presence.read().values().cloned().collect();
        }
        self.members
            .read()
            .values()
            .map(|client| PresenceInfo::for_client(client, client.connected_at()))
            .collect()
    }

    /// Set a presence metadata entry for a member.
    ///
    /// Returns false when presence tracking is disabled.
    pub fn update_presence(
        &self,
        client_id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> WebSocketResult<bool> {
        if !self.contains(client_id) {
            return Err(WebSocketError::ClientNotFound(client_id.to_string()));
        }
        if !self.config.track_presence {
            return Ok(false);
        }
        match self.presence.write().get_mut(client_id) {
            Some(info) => {
                info.metadata.insert(key.into(), value);
                Ok(true)
            }
            None => Err(WebSocketError::ClientNotFound(client_id.to_string())),
        }
    }

    /// Get a room metadata entry.
    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.read().get(key).cloned()
    }

    /// Set a room metadata entry.
    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.write().insert(key.into(), value);
    }

    /// Snapshot of all room metadata.
    pub fn metadata_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.metadata.read().clone()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
