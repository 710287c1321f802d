//! Per-connection client: outbound queue, read and write pumps, state and
//! room membership.

use crate::config::HubConfig;
use crate::connection::{ConnectionInfo, FrameReader, FrameWriter};
use crate::error::{WebSocketError, WebSocketResult};
use crate::handler::{
    self, ErrorHandler, EventHandler, HubHandlers, MessageHandler, report_to, run_isolated,
};
use crate::message::{Message, MessageType, close_code};
use crate::room::{Room, RoomId};
use crate::room_manager::RoomManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Unique identifier for a client (the connection id).
pub type ClientId = String;

/// State key under which the server stores the authenticated principal.
pub const PRINCIPAL_KEY: &str = "auth.principal";

/// What a client needs from its hub.
#[derive(Clone)]
pub(crate) struct HubLink {
    pub rooms: Arc<RoomManager>,
    pub handlers: Arc<HubHandlers>,
    pub unregister: mpsc::UnboundedSender<ClientId>,
    pub config: Arc<HubConfig>,
}

/// Receiving ends of a client's queues, consumed by the write pump.
pub(crate) struct ClientQueues {
    outbound: mpsc::Receiver<Message>,
    control: mpsc::UnboundedReceiver<Message>,
}

/// A broadcast message waiting for room in a client's outbound queue.
pub(crate) struct Delivery {
    message: Message,
    deadline: Instant,
    cancel: Option<CancellationToken>,
    handlers: Arc<HubHandlers>,
}

/// Fan-out messages that found the queue full, kept in arrival order.
#[derive(Default)]
struct Backlog {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// A connected WebSocket client.
pub struct Client {
    id: ClientId,
    info: ConnectionInfo,
    outbound: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<Message>,
    done: CancellationToken,
    closed: AtomicBool,
    state: DashMap<String, Arc<dyn Any + Send + Sync>>,
    rooms: Mutex<HashSet<RoomId>>,
    backlog: Mutex<Backlog>,
    message_handlers: RwLock<Vec<MessageHandler>>,
    json_handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    last_read: Mutex<Instant>,
    connected_at: DateTime<Utc>,
    link: HubLink,
}

impl Client {
    pub(crate) fn new(info: ConnectionInfo, link: HubLink) -> (Arc<Self>, ClientQueues) {
        let (outbound_tx, outbound_rx) = mpsc::channel(link.config.send_queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            id: info.id.clone(),
            info,
            outbound: outbound_tx,
            control: control_tx,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            state: DashMap::new(),
            rooms: Mutex::new(HashSet::new()),
            backlog: Mutex::new(Backlog::default()),
            message_handlers: RwLock::new(Vec::new()),
            json_handlers: RwLock::new(HashMap::new()),
            error_handlers: RwLock::new(Vec::new()),
            last_read: Mutex::new(Instant::now()),
            connected_at: Utc::now(),
            link,
        });

        let queues = ClientQueues {
            outbound: outbound_rx,
            control: control_rx,
        };
        (client, queues)
    }

    /// Start the read and write pumps.
    pub(crate) fn spawn_pumps(
        self: &Arc<Self>,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        queues: ClientQueues,
    ) {
        tokio::spawn(Arc::clone(self).read_pump(reader));
        tokio::spawn(Arc::clone(self).write_pump(writer, queues));
    }

    /// Client identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection metadata captured at upgrade time.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Remote address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    /// Negotiated subprotocol.
    pub fn subprotocol(&self) -> Option<&str> {
        self.info.subprotocol.as_deref()
    }

    /// Upgrade-time query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.info.query_param(key)
    }

    /// Upgrade-time query parameter, or `default` when absent.
    pub fn query_or(&self, key: &str, default: &str) -> String {
        self.query(key).unwrap_or(default).to_string()
    }

    /// When the client connected.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// False forever once the client has closed.
    pub fn is_connected(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Wait until the client has closed.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Token cancelled when the client closes.
    pub fn context(&self) -> CancellationToken {
        self.done.clone()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue a message, waiting while the outbound queue is full.
    pub async fn send(&self, message: impl Into<Message>) -> WebSocketResult<()> {
        let message = message.into();
        if !self.is_connected() {
            return Err(WebSocketError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(WebSocketError::ConnectionClosed),
            sent = self.outbound.send(message) => sent.map_err(|_| WebSocketError::ConnectionClosed),
        }
    }

    /// Queue a message, giving up with [`WebSocketError::Cancelled`] when
    /// `cancel` fires first.
    pub async fn send_with_cancel(
        &self,
        cancel: &CancellationToken,
        message: impl Into<Message>,
    ) -> WebSocketResult<()> {
        let message = message.into();
        if !self.is_connected() {
            return Err(WebSocketError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(WebSocketError::ConnectionClosed),
            _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
            sent = self.outbound.send(message) => sent.map_err(|_| WebSocketError::ConnectionClosed),
        }
    }

    /// Hand a fan-out message to this client without blocking the caller.
    ///
    /// Deliveries reach the outbound queue in the order they were handed
    /// over. Once the queue is full, later deliveries line up behind a
    /// single drain task instead of overtaking the blocked ones.
    pub(crate) fn deliver(self: &Arc<Self>, delivery: Delivery) {
        let mut backlog = self.backlog.lock();
        if backlog.draining {
            backlog.pending.push_back(delivery);
            return;
        }

        let Delivery {
            message,
            deadline,
            cancel,
            handlers,
        } = delivery;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            drop(backlog);
            self.settle(Err(WebSocketError::Cancelled), &handlers);
            return;
        }
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                drop(backlog);
                self.settle(Err(WebSocketError::ConnectionClosed), &handlers);
            }
            Err(TrySendError::Full(message)) => {
                backlog.pending.push_back(Delivery {
                    message,
                    deadline,
                    cancel,
                    handlers,
                });
                backlog.draining = true;
                tokio::spawn(Arc::clone(self).drain_backlog());
            }
        }
    }

    async fn drain_backlog(self: Arc<Self>) {
        loop {
            let next = {
                let mut backlog = self.backlog.lock();
                let next = backlog.pending.pop_front();
                if next.is_none() {
                    backlog.draining = false;
                }
                next
            };
            let Some(Delivery {
                message,
                deadline,
                cancel,
                handlers,
            }) = next
            else {
                break;
            };

            let send = async {
                match &cancel {
                    Some(token) => self.send_with_cancel(token, message).await,
                    None => self.send(message).await,
                }
            };
            let result = tokio::time::timeout_at(deadline, send)
                .await
                .unwrap_or(Err(WebSocketError::Timeout));
            self.settle(result, &handlers);
        }
    }

    fn settle(self: &Arc<Self>, result: WebSocketResult<()>, handlers: &HubHandlers) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_closed() => {
                tracing::debug!(client_id = %self.id, "Skipped closed client during fan-out");
            }
            Err(e) => {
                tracing::warn!(client_id = %self.id, error = %e, "Dropped fan-out message");
                handlers.report(Some(self), &e);
            }
        }
    }

    /// Queue a text message.
    pub async fn send_text<S: Into<String>>(&self, text: S) -> WebSocketResult<()> {
        self.send(Message::text(text)).await
    }

    /// Queue a binary message.
    pub async fn send_binary<B: Into<bytes::Bytes>>(&self, data: B) -> WebSocketResult<()> {
        self.send(Message::binary(data)).await
    }

    /// Serialize a value and queue it as a text message.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> WebSocketResult<()> {
        let message = Message::json(value)?;
        self.send(message).await
    }

    /// Queue a `{"type": event, "data": data}` envelope.
    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> WebSocketResult<()> {
        let message = Message::envelope(event, data)?;
        self.send(message).await
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Register a handler for every inbound text or binary frame.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Client>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.message_handlers
            .write()
            .push(handler::message_handler(handler));
    }

    /// Register a handler for inbound envelopes of type `event`.
    pub fn on_json<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Client>, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.json_handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(handler::event_handler(handler));
    }

    /// Register a callback for handler and I/O errors on this client.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Option<&Arc<Client>>, &WebSocketError) + Send + Sync + 'static,
    {
        self.error_handlers.write().push(Arc::new(handler));
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Store a typed value under `key`.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.state.insert(key.into(), Arc::new(value));
    }

    /// Fetch a value stored under `key`, if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = Arc::clone(self.state.get(key)?.value());
        value.downcast::<T>().ok()
    }

    /// Remove a value. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.state.remove(key).is_some()
    }

    /// Check whether `key` is set.
    pub fn has(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// The principal stored by the server's authenticator, if any.
    pub fn principal(&self) -> Option<Arc<serde_json::Value>> {
        self.get::<serde_json::Value>(PRINCIPAL_KEY)
    }

    // =========================================================================
    // Rooms
    // =========================================================================

    /// Join a room, creating it with the default configuration when
    /// dynamic rooms are allowed.
    pub fn join(self: &Arc<Self>, room_id: &str) -> WebSocketResult<Arc<Room>> {
        self.link.rooms.join_or_create(room_id, self)
    }

    /// Leave a room. Returns false if the client was not a member.
    pub fn leave(&self, room_id: &str) -> bool {
        self.link.rooms.leave_room(room_id, self.id())
    }

    /// Snapshot of the rooms this client belongs to.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Check room membership from the client side.
    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    pub(crate) fn index_room(&self, room_id: &str) {
        self.rooms.lock().insert(room_id.to_string());
    }

    pub(crate) fn unindex_room(&self, room_id: &str) {
        self.rooms.lock().remove(room_id);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the client with a status code and reason.
    ///
    /// Only the first call has any effect: it queues a close frame for the
    /// write pump, signals both pumps to stop and asks the hub to
    /// unregister the client.
    pub fn close(&self, code: u16, reason: &str) {
        self.shutdown(Some(Message::close_with(code, reason)));
    }

    fn shutdown(&self, frame: Option<Message>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(frame) = frame {
            // The write pump may already be gone; the frame is best-effort.
            let _ = self.control.send(frame);
        }
        self.done.cancel();

        if self.link.unregister.send(self.id.clone()).is_err() {
            // Hub loop has stopped, nobody else will sweep the rooms.
            self.link.rooms.leave_all_rooms(self);
        }

        tracing::debug!(client_id = %self.id, "Client closed");
        true
    }

    /// Close a client that was never registered, without notifying the hub.
    pub(crate) fn discard(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.done.cancel();
            self.link.rooms.leave_all_rooms(self);
        }
    }

    pub(crate) fn report_error(self: &Arc<Self>, error: &WebSocketError) {
        let handlers = self.error_handlers.read().clone();
        report_to(&handlers, Some(self), error);
        self.link.handlers.report(Some(self), error);
    }

    // =========================================================================
    // Pumps
    // =========================================================================

    async fn read_pump(self: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        let pong_wait = self.link.config.pong_wait;
        let max_size = self.link.config.max_message_size;
        let auto_pong = reader.answers_pings();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                next = tokio::time::timeout(pong_wait, reader.read_message()) => next,
            };

            let message = match next {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    tracing::debug!(client_id = %self.id, "Peer ended the stream");
                    self.close(close_code::NORMAL_CLOSURE, "");
                    break;
                }
                Ok(Err(e @ WebSocketError::MessageTooLarge { .. })) => {
                    self.report_error(&e);
                    self.close(close_code::MESSAGE_TOO_BIG, "message too large");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(client_id = %self.id, error = %e, "Read failed");
                    self.close(close_code::NORMAL_CLOSURE, "");
                    break;
                }
                Err(_) => {
                    tracing::debug!(client_id = %self.id, "Read deadline exceeded");
                    self.close(close_code::NORMAL_CLOSURE, "read timeout");
                    break;
                }
            };
            *self.last_read.lock() = Instant::now();

            match message.message_type {
                MessageType::Ping if auto_pong => {}
                MessageType::Ping => {
                    let _ = self.control.send(Message::pong(message.payload));
                }
                MessageType::Pong => {}
                MessageType::Close => {
                    tracing::debug!(
                        client_id = %self.id,
                        code = ?message.close_code(),
                        "Peer sent close frame"
                    );
                    self.shutdown(None);
                    break;
                }
                MessageType::Text | MessageType::Binary => {
                    if message.len() > max_size {
                        let error = WebSocketError::MessageTooLarge {
                            size: message.len(),
                            max: max_size,
                        };
                        self.report_error(&error);
                        self.close(close_code::MESSAGE_TOO_BIG, "message too large");
                        break;
                    }
                    self.dispatch(message).await;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        let handlers = self.message_handlers.read().clone();
        for handler in handlers {
            let client = Arc::clone(self);
            let frame = message.clone();
            if let Err(e) = run_isolated(move || handler(client, frame)).await {
                tracing::error!(client_id = %self.id, error = %e, "Message handler failed");
                self.report_error(&e);
            }
        }

        let Some(envelope) = message.as_envelope() else {
            return;
        };

        let json_handlers = self
            .json_handlers
            .read()
            .get(&envelope.event)
            .cloned()
            .unwrap_or_default();
        for handler in json_handlers {
            let client = Arc::clone(self);
            let data = envelope.data.clone();
            if let Err(e) = run_isolated(move || handler(client, data)).await {
                tracing::error!(client_id = %self.id, event = %envelope.event, error = %e, "JSON handler failed");
                self.report_error(&e);
            }
        }

        self.link
            .handlers
            .dispatch_event(self, &envelope.event, &envelope.data)
            .await;
    }

    async fn write_pump(self: Arc<Self>, mut writer: Box<dyn FrameWriter>, mut queues: ClientQueues) {
        let ping_period = self.link.config.ping_period;
        let write_timeout = self.link.config.write_timeout;

        let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_write = Instant::now();

        let outcome: WebSocketResult<()> = loop {
            tokio::select! {
                biased;
                Some(frame) = queues.control.recv() => {
                    let closing = frame.is_close();
                    if let Err(e) = write_frame(&mut writer, frame, write_timeout).await {
                        break Err(e);
                    }
                    last_write = Instant::now();
                    if closing {
                        break Ok(());
                    }
                }
                _ = self.done.cancelled() => {
                    while let Ok(frame) = queues.control.try_recv() {
                        let closing = frame.is_close();
                        let _ = write_frame(&mut writer, frame, write_timeout).await;
                        if closing {
                            break;
                        }
                    }
                    break Ok(());
                }
                next = queues.outbound.recv() => match next {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut writer, message, write_timeout).await {
                            break Err(e);
                        }
                        last_write = Instant::now();
                    }
                    None => {
                        let frame = Message::close_with(close_code::NORMAL_CLOSURE, "");
                        let _ = write_frame(&mut writer, frame, write_timeout).await;
                        break Ok(());
                    }
                },
                _ = ticker.tick() => {
                    let read_idle = self.last_read.lock().elapsed();
                    if last_write.elapsed() >= ping_period || read_idle >= ping_period {
                        if let Err(e) = write_frame(&mut writer, Message::ping(Vec::new()), write_timeout).await {
                            break Err(e);
                        }
                        last_write = Instant::now();
                    }
                }
            }
        };

        if tokio::time::timeout(write_timeout, writer.close()).await.is_err() {
            tracing::debug!(client_id = %self.id, "Timed out closing transport");
        }

        if let Err(e) = outcome {
            // The connection is unusable for writes; tear the client down now
            // instead of waiting for the read side to notice.
            tracing::debug!(client_id = %self.id, error = %e, "Write failed");
            if self.is_connected() {
                self.report_error(&e);
            }
            self.shutdown(None);
        }
    }
}

async fn write_frame(
    writer: &mut Box<dyn FrameWriter>,
    frame: Message,
    timeout: Duration,
) -> WebSocketResult<()> {
    tokio::time::timeout(timeout, writer.write_message(frame))
        .await
        .map_err(|_| WebSocketError::Timeout)?
}

/// Deliver `message` to every target without waiting on any of them.
///
/// A delivery still blocked on a full queue at `timeout` is abandoned and
/// reported; closed clients are skipped quietly.
pub(crate) fn fan_out(
    targets: Vec<Arc<Client>>,
    message: Message,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    handlers: Arc<HubHandlers>,
) {
    let deadline = Instant::now() + timeout;
    for client in targets {
        client.deliver(Delivery {
            message: message.clone(),
            deadline,
            cancel: cancel.clone(),
            handlers: Arc::clone(&handlers),
        });
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("remote_addr", &self.info.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}
