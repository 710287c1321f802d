mod common;

use common::{broken_connection, connection, eventually};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use switchyard_websocket::{Hub, HubConfig, RoomConfig, WebSocketError, close_code};

#[tokio::test]
async fn test_concurrent_close_runs_once() {
    let hub = Hub::new(HubConfig::default());
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    hub.on_disconnect(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let (conn, mut peer) = connection("a");
    let client = hub.serve(conn).await.unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.close(close_code::NORMAL_CLOSURE, &format!("close {i}")) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    eventually(|| disconnects.load(Ordering::SeqCst) == 1).await;
    let first = peer.next().await;
    assert!(first.is_close());

    // Give stragglers a chance to show up before counting.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let closes = 1 + peer.drain().iter().filter(|m| m.is_close()).count();
    assert_eq!(closes, 1);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(!client.is_connected());
    assert!(matches!(client.send("late").await, Err(WebSocketError::ConnectionClosed)));
}

#[tokio::test]
async fn test_close_frame_carries_code_and_reason() {
    let hub = Hub::new(HubConfig::default());
    let (conn, mut peer) = connection("a");
    let client = hub.serve(conn).await.unwrap();

    client.close(close_code::POLICY_VIOLATION, "kicked");
    let frame = peer.next().await;
    assert_eq!(frame.close_code(), Some(close_code::POLICY_VIOLATION));
    assert_eq!(frame.close_reason(), Some("kicked"));
}

#[tokio::test]
async fn test_registry_stays_consistent() {
    let hub = Hub::new(HubConfig::default());
    let mut tasks = Vec::new();

    // Every id is registered twice; exactly one of each pair wins.
    for i in 0..40 {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let id = format!("c{}", i % 20);
            let (conn, peer) = connection(&id);
            (hub.serve(conn).await, peer)
        }));
    }

    let mut accepted = Vec::new();
    let mut peers = Vec::new();
    for task in tasks {
        let (result, peer) = task.await.unwrap();
        match result {
            Ok(client) => accepted.push(client),
            Err(e) => assert!(matches!(e, WebSocketError::ClientExists(_))),
        }
        peers.push(peer);
    }
    assert_eq!(accepted.len(), 20);
    assert_eq!(hub.client_count(), 20);

    for client in accepted.iter().step_by(2) {
        client.close(close_code::NORMAL_CLOSURE, "");
    }
    eventually(|| hub.client_count() == 10).await;

    let mut ids: Vec<String> = hub.clients().iter().map(|c| c.id().to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn test_reconnect_with_same_id_after_close() {
    let hub = Hub::new(HubConfig::default());
    let (first, _p1) = connection("user-1");
    let client = hub.serve(first).await.unwrap();

    client.close(close_code::NORMAL_CLOSURE, "");
    eventually(|| hub.client("user-1").is_none()).await;

    let (second, _p2) = connection("user-1");
    let replacement = hub.serve(second).await.unwrap();
    assert!(replacement.is_connected());
    assert_eq!(hub.client_count(), 1);
}

#[tokio::test]
async fn test_write_failure_tears_client_down() {
    let hub = Hub::new(HubConfig::default());
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    hub.on_error(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    hub.create_room("r", "R", Some(RoomConfig::new())).unwrap();

    let (conn, _input) = broken_connection("a");
    let client = hub.serve(conn).await.unwrap();
    client.join("r").unwrap();

    client.send("doomed").await.unwrap();
    client.closed().await;

    eventually(|| hub.client_count() == 0).await;
    eventually(|| hub.room("r").unwrap().is_empty()).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_peer_disconnect_unregisters() {
    let hub = Hub::new(HubConfig::default());
    let (conn, peer) = connection("a");
    let client = hub.serve(conn).await.unwrap();
    client.join("lobby").unwrap();

    // Dropping the peer ends the read stream.
    drop(peer);
    client.closed().await;

    eventually(|| hub.client_count() == 0).await;
    eventually(|| hub.room("lobby").unwrap().is_empty()).await;
}
