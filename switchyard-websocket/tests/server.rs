use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use switchyard_websocket::{
    ConnectionInfo, Hub, HubConfig, WebSocketError, WebSocketResult, WebSocketServer,
    WebSocketServerBuilder, close_code,
};
use tokio::io::AsyncReadExt;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

async fn start(builder: WebSocketServerBuilder) -> SocketAddr {
    let server = assert_ok!(assert_ok!(builder.bind("127.0.0.1:0")).build().await);
    let addr = assert_ok!(server.local_addr());
    tokio::spawn(server.run());
    addr
}

fn token_auth(info: &ConnectionInfo) -> WebSocketResult<Option<serde_json::Value>> {
    match info.query_param("token") {
        Some("letmein") => Ok(Some(json!({"user": "alice", "roles": ["admin"]}))),
        Some(_) => Err(WebSocketError::Unauthorized("invalid token".to_string())),
        None => Err(WebSocketError::Unauthorized("missing token".to_string())),
    }
}

#[tokio::test]
async fn test_rejected_upgrade_gets_401() {
    let hub = Hub::new(HubConfig::default());
    let addr = start(WebSocketServer::builder(hub.clone()).authenticator(token_auth)).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=wrong"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert_eq!(hub.client_count(), 0);
}

#[tokio::test]
async fn test_principal_is_stored_on_client() {
    let hub = Hub::new(HubConfig::default());
    hub.on_connect(|client| async move {
        let user = client
            .principal()
            .and_then(|p| p["user"].as_str().map(str::to_string))
            .unwrap_or_default();
        client.emit("whoami", &user).await
    });
    let addr = start(WebSocketServer::builder(hub.clone()).authenticator(token_auth)).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=letmein"))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value, json!({"type": "whoami", "data": "alice"}));

    let clients = hub.clients();
    let client = &clients[0];
    assert_eq!(client.principal().unwrap()["roles"][0], json!("admin"));
    assert!(client.remote_addr().is_some());
}

#[tokio::test]
async fn test_subprotocol_negotiation() {
    let hub = Hub::new(HubConfig::default());
    let addr = start(
        WebSocketServer::builder(hub.clone())
            .subprotocol("chat.v2")
            .subprotocol("chat.v1"),
    )
    .await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        "graphql-ws, chat.v1".parse().unwrap(),
    );
    let (_socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("sec-websocket-protocol").unwrap(),
        "chat.v1"
    );

    for _ in 0..100 {
        if hub.client_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let clients = hub.clients();
    assert_eq!(clients[0].subprotocol(), Some("chat.v1"));
}

#[tokio::test]
async fn test_stalled_handshake_is_dropped() {
    let config = HubConfig::builder()
        .handshake_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let hub = Hub::new(config);
    let addr = start(WebSocketServer::builder(hub.clone())).await;

    // Connect but never send the upgrade request.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server kept a stalled handshake open");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(hub.client_count(), 0);
}

#[tokio::test]
async fn test_server_stops_when_hub_closes() {
    let hub = Hub::new(HubConfig::default());
    let server = WebSocketServer::builder(hub.clone())
        .bind("127.0.0.1:0")
        .unwrap()
        .build()
        .await
        .unwrap();
    let handle = tokio::spawn(server.run());

    hub.close();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

async fn wait_for_clients(hub: &Hub, count: usize) {
    for _ in 0..200 {
        if hub.client_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub never reached {count} clients");
}

#[tokio::test]
async fn test_ping_gets_exactly_one_pong() {
    let hub = Hub::new(HubConfig::default());
    let addr = start(WebSocketServer::builder(hub.clone())).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    wait_for_clients(&hub, 1).await;

    socket
        .send(tungstenite::Message::Ping(b"are you there".to_vec().into()))
        .await
        .unwrap();
    // Let any extra pong reach the wire before the marker is queued.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let clients = hub.clients();
    clients[0].send("marker").await.unwrap();

    let mut pongs = 0;
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            tungstenite::Message::Pong(payload) => {
                assert_eq!(&payload[..], b"are you there");
                pongs += 1;
            }
            tungstenite::Message::Text(text) => {
                assert_eq!(text.as_str(), "marker");
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(pongs, 1);
}

#[tokio::test]
async fn test_oversized_frame_is_rejected_by_transport() {
    let config = HubConfig::builder().max_message_size(1024).build().unwrap();
    let hub = Hub::new(config);
    let errors = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = std::sync::Arc::clone(&errors);
    hub.on_error(move |_, error| {
        if let WebSocketError::MessageTooLarge { max, .. } = error {
            seen.lock().push(*max);
        }
    });
    let addr = start(WebSocketServer::builder(hub.clone())).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    wait_for_clients(&hub, 1).await;

    socket
        .send(tungstenite::Message::text("x".repeat(4096)))
        .await
        .unwrap();

    // The server closes the connection; a close frame, if it gets through,
    // carries 1009.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("server kept an oversized connection open");
        match frame {
            Some(Ok(tungstenite::Message::Close(Some(close)))) => {
                assert_eq!(u16::from(close.code), close_code::MESSAGE_TOO_BIG);
                break;
            }
            Some(Ok(tungstenite::Message::Close(None))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    wait_for_clients(&hub, 0).await;
    assert_eq!(*errors.lock(), vec![1024]);
}
