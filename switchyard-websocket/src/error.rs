//! Error types for WebSocket operations.

use thiserror::Error;

/// WebSocket error type.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The caller's cancellation token fired before the operation completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// The hub has been closed and no longer accepts work
    #[error("Hub closed")]
    HubClosed,

    /// Client not registered with the hub
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// A client with this id is already registered
    #[error("Client already registered: {0}")]
    ClientExists(String),

    /// Room not found
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Room was destroyed
    #[error("Room destroyed: {0}")]
    RoomDestroyed(String),

    /// A room with this id already exists
    #[error("Room already exists: {0}")]
    RoomExists(String),

    /// Room is at capacity
    #[error("Room {room_id} is full (capacity {capacity})")]
    RoomFull {
        /// Room identifier
        room_id: String,
        /// Configured member limit
        capacity: usize,
    },

    /// The manager already holds the maximum number of rooms
    #[error("Room limit reached ({limit})")]
    RoomLimitReached {
        /// Configured room limit
        limit: usize,
    },

    /// Implicit room creation is switched off
    #[error("Dynamic room creation is disabled: {0}")]
    DynamicRoomsDisabled(String),

    /// No room template registered under this name
    #[error("Unknown room type: {0}")]
    UnknownRoomType(String),

    /// Inbound frame exceeded the configured size
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Received payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A user handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// A user handler panicked
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Upgrade request rejected by the authenticator
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

impl WebSocketError {
    /// Create a handler error from any displayable value.
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        Self::Handler(err.to_string())
    }

    /// True for missing or destroyed rooms and unknown clients.
    ///
    /// A destroyed room is indistinguishable from a room that never existed
    /// for join and broadcast purposes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound(_) | Self::RoomDestroyed(_) | Self::ClientNotFound(_)
        )
    }

    /// True for capacity and policy violations.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::RoomFull { .. } | Self::RoomLimitReached { .. } | Self::DynamicRoomsDisabled(_)
        )
    }

    /// True when the error means the peer or the hub is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::HubClosed)
    }
}

/// Result type for WebSocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;
