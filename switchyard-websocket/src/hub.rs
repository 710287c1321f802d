//! The hub: client registry, hub-wide broadcast and handler registration.
//!
//! Registry mutations and hub-wide broadcasts are serialized through one
//! event loop task. Reads (counts, lookups, snapshots) go straight to the
//! registry under its read lock.

use crate::client::{Client, ClientId, HubLink, fan_out};
use crate::config::HubConfig;
use crate::connection::Connection;
use crate::error::{WebSocketError, WebSocketResult};
use crate::handler::{self, HubHandler, HubHandlers};
use crate::message::{Message, close_code};
use crate::room::{Room, RoomConfig};
use crate::room_manager::RoomManager;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const REGISTER_QUEUE: usize = 64;
const BROADCAST_QUEUE: usize = 256;

struct Registration {
    client: Arc<Client>,
    reply: oneshot::Sender<WebSocketResult<()>>,
}

struct BroadcastRequest {
    message: Message,
    exclude: Vec<ClientId>,
    cancel: Option<CancellationToken>,
}

/// State shared between the hub handle and its event loop.
struct HubState {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    rooms: Arc<RoomManager>,
    handlers: Arc<HubHandlers>,
    config: Arc<HubConfig>,
    closed: AtomicBool,
}

impl HubState {
    async fn run(
        self: Arc<Self>,
        mut register: mpsc::Receiver<Registration>,
        mut unregister: mpsc::UnboundedReceiver<ClientId>,
        mut broadcast: mpsc::Receiver<BroadcastRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(id) = unregister.recv() => self.unregister(&id),
                Some(registration) = register.recv() => self.register(registration),
                Some(request) = broadcast.recv() => self.broadcast(request),
                else => break,
            }
        }
        tracing::debug!("Hub loop stopped");
    }

    fn register(&self, registration: Registration) {
        let Registration { client, reply } = registration;

        let result = {
            let mut clients = self.clients.write();
            if self.closed.load(Ordering::Acquire) {
                Err(WebSocketError::HubClosed)
            } else if !client.is_connected() {
                Err(WebSocketError::ConnectionClosed)
            } else if clients.contains_key(client.id()) {
                Err(WebSocketError::ClientExists(client.id().to_string()))
            } else {
                clients.insert(client.id().to_string(), Arc::clone(&client));
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                tracing::debug!(client_id = %client.id(), remote_addr = ?client.remote_addr(), "Client registered");
                self.handlers.spawn_connect(&client);
            }
            Err(e) => {
                tracing::warn!(client_id = %client.id(), error = %e, "Rejected client registration");
            }
        }
        // The caller may have given up waiting.
        let _ = reply.send(result);
    }

    fn unregister(&self, id: &str) {
        // Only a closed entry is removed, so a stale id cannot evict a
        // newer client that reused it.
        let removed = {
            let mut clients = self.clients.write();
            match clients.get(id) {
                Some(client) if !client.is_connected() => clients.remove(id),
                _ => None,
            }
        };

        if let Some(client) = removed {
            let left = self.rooms.leave_all_rooms(&client);
            tracing::debug!(client_id = %id, rooms_left = left, "Client unregistered");
            self.handlers.spawn_disconnect(&client);
        }
    }

    fn broadcast(&self, request: BroadcastRequest) {
        let targets: Vec<Arc<Client>> = self
            .clients
            .read()
            .values()
            .filter(|client| !request.exclude.iter().any(|id| id == client.id()))
            .cloned()
            .collect();

        tracing::trace!(targets = targets.len(), "Hub broadcast");
        fan_out(
            targets,
            request.message,
            self.config.broadcast_timeout,
            request.cancel,
            Arc::clone(&self.handlers),
        );
    }
}

struct HubInner {
    state: Arc<HubState>,
    register: mpsc::Sender<Registration>,
    unregister: mpsc::UnboundedSender<ClientId>,
    broadcast: mpsc::Sender<BroadcastRequest>,
    cancel: CancellationToken,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Coordinator for one WebSocket endpoint: owns the connected clients,
/// the rooms and the hub-wide handlers.
///
/// `Hub` is a cheap handle; clones share the same hub. The event loop stops
/// on [`Hub::close`] or when the last handle is dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard_websocket::{Hub, HubConfig};
///
/// # async fn example() {
/// let hub = Hub::new(HubConfig::default());
///
/// hub.on("chat", |client, data| async move {
///     tracing::info!(client_id = %client.id(), ?data, "chat message");
///     client.emit("ack", &data).await
/// });
/// # }
/// ```
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub and start its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: HubConfig) -> Self {
        if config.enable_compression {
            tracing::warn!("permessage-deflate is not supported; enable_compression is ignored");
        }

        let config = Arc::new(config);
        let handlers = Arc::new(HubHandlers::default());
        let rooms = Arc::new(RoomManager::with_handlers(&config, Arc::clone(&handlers)));
        let state = Arc::new(HubState {
            clients: RwLock::new(HashMap::new()),
            rooms,
            handlers,
            config,
            closed: AtomicBool::new(false),
        });

        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);
        let cancel = CancellationToken::new();

        tokio::spawn(Arc::clone(&state).run(
            register_rx,
            unregister_rx,
            broadcast_rx,
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(HubInner {
                state,
                register: register_tx,
                unregister: unregister_tx,
                broadcast: broadcast_tx,
                cancel,
            }),
        }
    }

    fn state(&self) -> &HubState {
        &self.inner.state
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.state().config
    }

    /// The hub's room manager.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.state().rooms
    }

    /// Look up a live room.
    pub fn room(&self, id: &str) -> WebSocketResult<Arc<Room>> {
        self.state().rooms.get_room(id)
    }

    /// Create a room in this hub's room manager.
    pub fn create_room(
        &self,
        id: &str,
        name: &str,
        config: Option<RoomConfig>,
    ) -> WebSocketResult<Arc<Room>> {
        self.state().rooms.create_room(id, name, config)
    }

    // =========================================================================
    // Handler registration
    // =========================================================================

    /// Register a handler fired after each client is registered.
    pub fn on_connect<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.state().handlers.add_connect(handler::client_handler(handler));
        self
    }

    /// Register a handler fired after each client is unregistered.
    pub fn on_disconnect<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.state()
            .handlers
            .add_disconnect(handler::client_handler(handler));
        self
    }

    /// Register a handler for inbound envelopes of type `event` from any client.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Arc<Client>, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.state()
            .handlers
            .add_event(event.into(), handler::event_handler(handler));
        self
    }

    /// Register an error handler.
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(Option<&Arc<Client>>, &WebSocketError) + Send + Sync + 'static,
    {
        self.state().handlers.add_error(Arc::new(handler));
        self
    }

    /// Register a [`HubHandler`] implementation.
    pub fn with_handler<H: HubHandler>(&self, handler: H) -> &Self {
        let handler = Arc::new(handler);

        let on_connect = Arc::clone(&handler);
        self.on_connect(move |client| {
            let handler = Arc::clone(&on_connect);
            async move { handler.on_connect(client).await }
        });

        let on_disconnect = Arc::clone(&handler);
        self.on_disconnect(move |client| {
            let handler = Arc::clone(&on_disconnect);
            async move { handler.on_disconnect(client).await }
        });

        self.on_error(move |client, error| handler.on_error(client, error))
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a connection and start its pumps.
    pub async fn serve(&self, connection: Connection) -> WebSocketResult<Arc<Client>> {
        self.serve_with(connection, |_| {}).await
    }

    /// Like [`Hub::serve`], running `setup` on the client before it is
    /// registered. Handlers attached in `setup` see every inbound frame.
    pub async fn serve_with<F>(&self, connection: Connection, setup: F) -> WebSocketResult<Arc<Client>>
    where
        F: FnOnce(&Arc<Client>),
    {
        let (info, reader, mut writer) = connection.into_parts();
        let link = HubLink {
            rooms: Arc::clone(&self.state().rooms),
            handlers: Arc::clone(&self.state().handlers),
            unregister: self.inner.unregister.clone(),
            config: Arc::clone(&self.state().config),
        };
        let (client, queues) = Client::new(info, link);

        let result = if self.is_closed() {
            Err(WebSocketError::HubClosed)
        } else {
            setup(&client);
            self.register(&client).await
        };

        if let Err(e) = result {
            client.discard();
            let code = match e {
                WebSocketError::ClientExists(_) => close_code::POLICY_VIOLATION,
                _ => close_code::GOING_AWAY,
            };
            let frame = Message::close_with(code, &e.to_string());
            let write_timeout = self.state().config.write_timeout;
            let _ = tokio::time::timeout(write_timeout, async {
                let _ = writer.write_message(frame).await;
                writer.close().await
            })
            .await;
            return Err(e);
        }

        client.spawn_pumps(reader, writer, queues);
        Ok(client)
    }

    async fn register(&self, client: &Arc<Client>) -> WebSocketResult<()> {
        let (reply, response) = oneshot::channel();
        let registration = Registration {
            client: Arc::clone(client),
            reply,
        };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(WebSocketError::HubClosed),
            sent = self.inner.register.send(registration) => {
                sent.map_err(|_| WebSocketError::HubClosed)?;
            }
        }
        response.await.unwrap_or(Err(WebSocketError::HubClosed))
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.state().clients.read().len()
    }

    /// Snapshot of registered clients.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.state().clients.read().values().cloned().collect()
    }

    /// Look up a registered client.
    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.state().clients.read().get(id).cloned()
    }

    /// Queue a message for one client.
    pub async fn send_to(&self, id: &str, message: impl Into<Message>) -> WebSocketResult<()> {
        let client = self
            .client(id)
            .ok_or_else(|| WebSocketError::ClientNotFound(id.to_string()))?;
        client.send(message).await
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    async fn submit(&self, request: BroadcastRequest, cancel: Option<&CancellationToken>) -> WebSocketResult<()> {
        if self.is_closed() {
            return Err(WebSocketError::HubClosed);
        }
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(WebSocketError::HubClosed),
            _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
            sent = self.inner.broadcast.send(request) => sent.map_err(|_| WebSocketError::HubClosed),
        }
    }

    /// Send a message to every registered client.
    ///
    /// Returns once the hub loop has accepted the request; delivery happens
    /// concurrently and a stuck client does not hold up the rest.
    pub async fn broadcast(&self, message: impl Into<Message>) -> WebSocketResult<()> {
        let request = BroadcastRequest {
            message: message.into(),
            exclude: Vec::new(),
            cancel: None,
        };
        self.submit(request, None).await
    }

    /// Like [`Hub::broadcast`], giving up with [`WebSocketError::Cancelled`]
    /// when `cancel` fires. Pending per-client deliveries stop as well.
    pub async fn broadcast_with_cancel(
        &self,
        cancel: &CancellationToken,
        message: impl Into<Message>,
    ) -> WebSocketResult<()> {
        let request = BroadcastRequest {
            message: message.into(),
            exclude: Vec::new(),
            cancel: Some(cancel.clone()),
        };
        self.submit(request, Some(cancel)).await
    }

    /// Serialize a value and broadcast it as text.
    pub async fn broadcast_json<T: Serialize + ?Sized>(&self, value: &T) -> WebSocketResult<()> {
        let message = Message::json(value)?;
        self.broadcast(message).await
    }

    /// Broadcast to every registered client except the listed ids.
    pub async fn broadcast_except(
        &self,
        message: impl Into<Message>,
        exclude: &[&str],
    ) -> WebSocketResult<()> {
        let request = BroadcastRequest {
            message: message.into(),
            exclude: exclude.iter().map(|id| id.to_string()).collect(),
            cancel: None,
        };
        self.submit(request, None).await
    }

    /// Broadcast a `{"type": event, "data": data}` envelope to every client.
    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> WebSocketResult<()> {
        let message = Message::envelope(event, data)?;
        self.broadcast(message).await
    }

    /// Broadcast to the members of one room. Returns the number of members
    /// targeted.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        message: impl Into<Message>,
    ) -> WebSocketResult<usize> {
        if self.is_closed() {
            return Err(WebSocketError::HubClosed);
        }
        self.room(room_id)?.broadcast(message)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// True once [`Hub::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed.load(Ordering::Acquire)
    }

    /// Wait until the hub is closed or its last handle is dropped.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Shut the hub down.
    ///
    /// Stops the event loop, closes every registered client with
    /// "going away" and destroys all rooms. Does not wait for the client
    /// pumps to exit. Later calls are no-ops.
    pub fn close(&self) {
        let state = self.state();
        if state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let clients: Vec<Arc<Client>> = state.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close(close_code::GOING_AWAY, "server shutting down");
        }
        state.rooms.clear();
        for client in &clients {
            state.handlers.spawn_disconnect(client);
        }

        tracing::info!(clients = clients.len(), "Hub closed");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("rooms", &self.state().rooms.room_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
