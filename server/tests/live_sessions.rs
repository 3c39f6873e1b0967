//! End-to-end tests driving the router over real sockets.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpStream;
use tokio_test::assert_ok;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use packsync_server::broadcast::RoomRegistry;
use packsync_server::routes::{DistanceServiceConfig, RouteResolver};
use packsync_server::storage::{RouteCacheStore, StorageConfig};
use packsync_server::{router, AppState, NotifyAck};
use packsync_shared::{ChangeKind, ClientMessage, ServerMessage, SyncProtocol};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path().join("routes.sled").to_string_lossy().to_string());
    let store = Arc::new(RouteCacheStore::open(config).unwrap());
    let routes =
        Arc::new(RouteResolver::with_default_chain(store, &DistanceServiceConfig::default()).unwrap());
    let state = Arc::new(AppState::new(Arc::new(RoomRegistry::default()), routes));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    (dir, addr.to_string())
}

async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Binary(data) = frame {
            return SyncProtocol::decode_server(&data).unwrap();
        }
    }
}

async fn join(addr: &str, trip_id: &str) -> (Socket, String) {
    let (mut socket, _) = connect_async(format!("ws://{}/ws/{}", addr, trip_id))
        .await
        .unwrap();
    match next_message(&mut socket).await {
        ServerMessage::Welcome { session_id, trip_id: joined, .. } => {
            assert_eq!(joined, trip_id);
            (socket, session_id)
        }
        other => panic!("Expected Welcome, got {:?}", other),
    }
}

async fn notify(addr: &str, trip_id: &str) -> NotifyAck {
    reqwest::Client::new()
        .post(format!("http://{}/api/trips/{}/notify", addr, trip_id))
        .json(&serde_json::json!({ "kind": "PackingListChanged" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_notify_reaches_every_device_once() {
    let (_dir, addr) = start_server().await;

    let mut sockets = Vec::new();
    for _ in 0..3 {
        sockets.push(join(&addr, "trip-1").await.0);
    }
    let (mut bystander, _) = join(&addr, "trip-2").await;

    let ack = notify(&addr, "trip-1").await;
    assert_eq!(ack, NotifyAck { delivered: 3, failed: 0 });

    for socket in &mut sockets {
        match next_message(socket).await {
            ServerMessage::Changed { trip_id, kind, .. } => {
                assert_eq!(trip_id, "trip-1");
                assert_eq!(kind, ChangeKind::PackingListChanged);
            }
            other => panic!("Expected Changed, got {:?}", other),
        }
    }

    // The other trip only sees its own pong
    let ping = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 9 }).unwrap();
    bystander.send(Message::Binary(ping.to_vec())).await.unwrap();
    assert!(matches!(
        next_message(&mut bystander).await,
        ServerMessage::Pong { timestamp: 9, .. }
    ));
}

#[tokio::test]
async fn test_session_ids_are_not_reused_on_reconnect() {
    let (_dir, addr) = start_server().await;

    let (mut socket, first_id) = join(&addr, "trip-1").await;
    socket.close(None).await.unwrap();

    let (_socket, second_id) = join(&addr, "trip-1").await;
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_closed_device_stops_receiving() {
    let (_dir, addr) = start_server().await;

    let (mut leaving, _) = join(&addr, "trip-1").await;
    let (mut staying, _) = join(&addr, "trip-1").await;

    let goodbye = SyncProtocol::encode_client(&ClientMessage::Goodbye { reason: None }).unwrap();
    leaving.send(Message::Binary(goodbye.to_vec())).await.unwrap();

    // Wait until the room has processed the disconnect
    let mut ack = notify(&addr, "trip-1").await;
    for _ in 0..50 {
        if ack.delivered + ack.failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        ack = notify(&addr, "trip-1").await;
    }
    assert_eq!(ack.delivered, 1);

    assert!(matches!(
        next_message(&mut staying).await,
        ServerMessage::Changed { .. }
    ));
}

#[tokio::test]
async fn test_goodbye_closes_the_socket() {
    let (_dir, addr) = start_server().await;
    let (mut leaving, _) = join(&addr, "trip-1").await;

    let goodbye = SyncProtocol::encode_client(&ClientMessage::Goodbye { reason: None }).unwrap();
    leaving.send(Message::Binary(goodbye.to_vec())).await.unwrap();

    // The server drops both halves, so the stream ends without further frames
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match leaving.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(Message::Binary(data))) => {
                    panic!("unexpected frame after goodbye: {:?}", SyncProtocol::decode_server(&data))
                }
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert_ok!(ended);
}

#[tokio::test]
async fn test_json_ping_is_answered() {
    let (_dir, addr) = start_server().await;
    let (mut socket, _) = join(&addr, "trip-1").await;

    socket
        .send(Message::Text(r#"{"Ping":{"timestamp":77}}"#.to_string()))
        .await
        .unwrap();

    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Pong { timestamp: 77, .. }
    ));
}

#[tokio::test]
async fn test_route_endpoints() {
    let (_dir, addr) = start_server().await;
    let client = reqwest::Client::new();

    let response = assert_ok!(
        client
            .post(format!("http://{}/api/routes/resolve", addr))
            .json(&serde_json::json!({
                "userId": "user-1",
                "destinationId": "dest-1",
                "origin": { "lat": 48.0, "lng": 9.0 },
                "destination": { "lat": 48.1, "lng": 9.2 }
            }))
            .send()
            .await
    );
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let entry: serde_json::Value = response.json().await.unwrap();
    assert_eq!(entry["provider"], "haversine");

    let response = client
        .post(format!("http://{}/api/routes/resolve", addr))
        .json(&serde_json::json!({ "userId": "user-1", "destinationId": "dest-2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let removed: serde_json::Value = client
        .delete(format!("http://{}/api/routes/destinations/dest-1", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(removed["removed"], 1);
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let (_dir, addr) = start_server().await;
    let (_socket, _) = join(&addr, "trip-1").await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "healthy");
    assert_eq!(health["active_rooms"], 1);
    assert_eq!(health["active_sessions"], 1);
}
