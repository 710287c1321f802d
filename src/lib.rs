// Switchyard - WebSocket hub and room management for tokio
//
// This library provides connection pumps, rooms with presence and capacity
// limits, and a hub that serializes registration and broadcast.

// Re-export core functionality
pub use switchyard_websocket::*;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        CancellationToken,
        Client,
        Connection,
        ConnectionInfo,
        Envelope,
        Hub,
        HubConfig,
        HubHandler,
        Message,
        Room,
        RoomConfig,
        RoomFilter,
        RoomManager,
        WebSocketError,
        WebSocketResult,
        WebSocketServer,
        // Close codes
        close_code,
    };
}
