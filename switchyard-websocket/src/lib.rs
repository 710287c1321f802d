//! # Switchyard WebSocket
//!
//! Hub and room management for WebSocket servers built on tokio-tungstenite.
//!
//! ## Features
//!
//! - Per-client read and write pumps with a bounded outbound queue
//! - Keepalive pings and read deadlines
//! - Rooms with capacity limits, presence and destroy-when-empty
//! - Room manager with templates, filters and a room limit
//! - Hub-wide broadcast serialized through a single event loop
//! - JSON envelopes (`{"type": ..., "data": ...}`) with named-event handlers
//! - Upgrade server with subprotocol negotiation and authentication
//!
//! ## Example
//!
//! ```rust,no_run
//! use switchyard_websocket::{Hub, HubConfig, RoomConfig, WebSocketError, WebSocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WebSocketError> {
//!     let hub = Hub::new(HubConfig::builder().max_rooms(100).build()?);
//!     hub.create_room("lobby", "Lobby", Some(RoomConfig::new().with_max_clients(50)))?;
//!
//!     hub.on_connect(|client| async move {
//!         client.join("lobby")?;
//!         client.emit("welcome", &client.id()).await?;
//!         Ok::<_, WebSocketError>(())
//!     });
//!
//!     let rooms = hub.rooms().clone();
//!     hub.on("chat", move |client, data| {
//!         let rooms = rooms.clone();
//!         async move {
//!             for room_id in client.rooms() {
//!                 rooms.get_room(&room_id)?.emit_except("chat", &data, &[client.id()])?;
//!             }
//!             Ok::<_, WebSocketError>(())
//!         }
//!     });
//!
//!     let server = WebSocketServer::builder(hub).bind("127.0.0.1:9001")?.build().await?;
//!     server.run().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod connection;
mod error;
mod handler;
mod hub;
mod message;
mod room;
mod room_manager;
mod server;

pub use client::{Client, ClientId, PRINCIPAL_KEY};
pub use config::{
    DEFAULT_PING_PERIOD, DEFAULT_PONG_WAIT, DEFAULT_SEND_QUEUE_CAPACITY, HubConfig,
    HubConfigBuilder,
};
pub use connection::{Connection, ConnectionId, ConnectionInfo, FrameReader, FrameWriter};
pub use error::{WebSocketError, WebSocketResult};
pub use handler::{
    ClientHandler, ErrorHandler, EventHandler, HandlerFuture, HubHandler, LoggingHandler,
    MessageHandler,
};
pub use hub::Hub;
pub use message::{Envelope, Message, MessageType, close_code};
pub use room::{DestroyHook, MemberHook, PresenceInfo, Room, RoomConfig, RoomId};
pub use room_manager::{RoomFilter, RoomManager};
pub use server::{Authenticator, WebSocketServer, WebSocketServerBuilder};

// Re-export commonly used types from tungstenite
pub use tungstenite::Message as RawMessage;
pub use tungstenite::protocol::CloseFrame;

/// Re-exported so callers can cancel sends and broadcasts.
pub use tokio_util::sync::CancellationToken;
