//! Integration tests for common Switchyard workflows.
//!
//! These tests drive the hub through real WebSocket framing, either over
//! in-memory duplex streams or over a TCP listener.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use switchyard::prelude::*;
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, protocol::Role};

// =============================================================================
// Helpers
// =============================================================================

type Peer = WebSocketStream<DuplexStream>;

/// Route hub logs to the test output. Set `RUST_LOG=switchyard_websocket=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect(hub: &Hub, id: &str) -> (Arc<Client>, Peer) {
    init_tracing();
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let peer = WebSocketStream::from_raw_socket(peer_io, Role::Client, None).await;

    let connection = Connection::from_stream(server, ConnectionInfo::with_id(id));
    let client = hub.serve(connection).await.unwrap();
    (client, peer)
}

async fn next_json<S>(peer: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

// =============================================================================
// Lobby Scenario
// =============================================================================

#[tokio::test]
async fn test_lobby_capacity_workflow() {
    let hub = Hub::new(HubConfig::builder().max_rooms(2).build().unwrap());
    let lobby = hub
        .create_room("lobby", "Lobby", Some(RoomConfig::new().with_max_clients(2)))
        .unwrap();

    let (a, mut peer_a) = connect(&hub, "a").await;
    let (b, mut peer_b) = connect(&hub, "b").await;
    let (c, _peer_c) = connect(&hub, "c").await;

    a.join("lobby").unwrap();
    b.join("lobby").unwrap();

    let targeted = hub
        .room("lobby")
        .unwrap()
        .emit("greet", &json!({"msg": "hi"}))
        .unwrap();
    assert_eq!(targeted, 2);
    for peer in [&mut peer_a, &mut peer_b] {
        assert_eq!(
            next_json(peer).await,
            json!({"type": "greet", "data": {"msg": "hi"}})
        );
    }

    let err = c.join("lobby").unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(lobby.len(), 2);
    assert!(!c.in_room("lobby"));

    assert!(b.leave("lobby"));
    assert!(hub.room("lobby").is_ok());
    c.join("lobby").unwrap();

    let mut members = lobby.member_ids();
    members.sort();
    assert_eq!(members, vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn test_room_limit_workflow() {
    let hub = Hub::new(HubConfig::builder().max_rooms(2).build().unwrap());
    hub.create_room("one", "One", None).unwrap();
    hub.create_room("two", "Two", None).unwrap();

    let err = hub.create_room("three", "Three", None).unwrap_err();
    assert!(matches!(err, WebSocketError::RoomLimitReached { limit: 2 }));
    assert_eq!(hub.rooms().room_count(), 2);

    let (client, _peer) = connect(&hub, "a").await;
    assert!(client.join("three").is_err());
    assert!(client.join("two").is_ok());
}

#[tokio::test]
async fn test_disconnect_cleans_up_membership() {
    let hub = Hub::new(HubConfig::default());
    hub.create_room(
        "temp",
        "Temp",
        Some(RoomConfig::new().with_destroy_when_empty(true)),
    )
    .unwrap();

    let (client, mut peer) = connect(&hub, "a").await;
    client.join("temp").unwrap();
    assert_eq!(hub.room("temp").unwrap().len(), 1);

    peer.close(None).await.unwrap();
    client.closed().await;

    for _ in 0..100 {
        if hub.room("temp").is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hub.room("temp").unwrap_err().is_not_found());
    assert_eq!(hub.client_count(), 0);
}

// =============================================================================
// Handler Trait
// =============================================================================

#[derive(Clone, Default)]
struct CountingHandler {
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl HubHandler for CountingHandler {
    async fn on_connect(&self, client: Arc<Client>) -> WebSocketResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        client.emit("hello", &client.id()).await
    }

    async fn on_disconnect(&self, _client: Arc<Client>) -> WebSocketResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_hub_handler_lifecycle() {
    let hub = Hub::new(HubConfig::default());
    let handler = CountingHandler::default();
    hub.with_handler(handler.clone());

    let (client, mut peer) = connect(&hub, "a").await;
    assert_eq!(next_json(&mut peer).await, json!({"type": "hello", "data": "a"}));

    client.close(close_code::NORMAL_CLOSURE, "done");
    for _ in 0..100 {
        if handler.disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Server Round Trip
// =============================================================================

#[tokio::test]
async fn test_query_parameters_reach_handlers() {
    let hub = Hub::new(HubConfig::default());
    hub.on_connect(|client| async move {
        let room = client.query_or("room", "general");
        client.join(&room)?;
        client.emit("joined", &room).await?;
        Ok::<_, WebSocketError>(())
    });

    let server = WebSocketServer::builder(hub.clone())
        .bind("127.0.0.1:0")
        .unwrap()
        .build()
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let url = format!("ws://{}/ws?room=rust%20fans&token=abc", addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "joined", "data": "rust fans"})
    );

    let room = hub.room("rust fans").unwrap();
    let members = room.members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].query("token"), Some("abc"));

    // Echo through a hub-level event handler.
    hub.on("ping", |client, data| async move { client.emit("pong", &data).await });
    socket
        .send(tungstenite::Message::text(json!({"type": "ping", "data": 42}).to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await, json!({"type": "pong", "data": 42}));

    hub.close();
}
