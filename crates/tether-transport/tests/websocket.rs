//! End-to-end sessions over a real WebSocket listener.
#![cfg(feature = "websocket")]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tether_core::{Hub, HubConfig, MemoryBroker, MemoryPresenceStore};
use tether_protocol::{codec, Message, MessageType};
use tether_transport::{serve, SessionConfig, WebSocketTransport};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    hub: Hub,
    url: String,
    cancel: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start() -> Server {
    let transport = WebSocketTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let url = format!("ws://{}/ws", transport.local_addr().unwrap());

    let (hub, dispatcher) = Hub::new(
        HubConfig::default(),
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryBroker::new()),
    );
    let cancel = CancellationToken::new();
    tokio::spawn(dispatcher.run(cancel.clone()));

    let serve_hub = hub.clone();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        serve(&transport, serve_hub, SessionConfig::default(), serve_cancel).await;
    });

    Server { hub, url, cancel }
}

async fn connect(url: &str, user_id: Option<&'static str>) -> Result<Socket, WsError> {
    let mut request = url.into_client_request()?;
    if let Some(user_id) = user_id {
        request
            .headers_mut()
            .insert("x-user-id", HeaderValue::from_static(user_id));
    }
    request
        .headers_mut()
        .insert("user-agent", HeaderValue::from_static("tether-test"));
    connect_async(request).await.map(|(socket, _)| socket)
}

async fn next_message(socket: &mut Socket) -> Message {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => return codec::decode(text.as_bytes()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message received")
}

async fn next_of_kind(socket: &mut Socket, kind: &MessageType) -> Message {
    loop {
        let message = next_message(socket).await;
        if message.kind() == kind {
            return message;
        }
    }
}

async fn wait_until_disconnected(hub: &Hub, user_id: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while hub.is_user_connected(user_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user still connected");
}

#[tokio::test]
async fn test_connect_receives_own_presence() {
    let server = start().await;
    let mut socket = connect(&server.url, Some("alice")).await.unwrap();

    let online = next_message(&mut socket).await;
    assert_eq!(online.kind(), &MessageType::UserOnline);
    assert_eq!(online.presence_payload().unwrap().user_id, "alice");
    assert_eq!(server.hub.user_connection_count("alice").await, 1);
}

#[tokio::test]
async fn test_idle_peer_does_not_block_accept() {
    let server = start().await;
    let addr = server.url.trim_start_matches("ws://").trim_end_matches("/ws");
    let _idle = TcpStream::connect(addr).await.unwrap();

    let mut socket = tokio::time::timeout(Duration::from_secs(3), connect(&server.url, Some("alice")))
        .await
        .expect("connect stalled behind idle peer")
        .unwrap();

    let online = next_message(&mut socket).await;
    assert_eq!(online.presence_payload().unwrap().user_id, "alice");
}

#[tokio::test]
async fn test_missing_identity_is_rejected() {
    let server = start().await;

    let err = connect(&server.url, None).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.hub.total_connection_count().await, 0);
}

#[tokio::test]
async fn test_targeted_message_and_disconnect() {
    let server = start().await;
    let mut alice = connect(&server.url, Some("alice")).await.unwrap();
    let mut bob = connect(&server.url, Some("bob")).await.unwrap();

    assert_eq!(next_message(&mut alice).await.kind(), &MessageType::UserOnline);
    assert_eq!(next_message(&mut bob).await.kind(), &MessageType::UserOnline);

    server
        .hub
        .send_to_user("bob", Message::new("ride_update", json!({"eta": 2})))
        .await;
    let update = next_of_kind(&mut bob, &MessageType::from("ride_update")).await;
    assert_eq!(update.target_user_id(), Some("bob"));

    bob.close(None).await.unwrap();
    wait_until_disconnected(&server.hub, "bob").await;

    let offline = next_of_kind(&mut alice, &MessageType::UserOffline).await;
    assert_eq!(offline.presence_payload().unwrap().user_id, "bob");
}

#[tokio::test]
async fn test_shutdown_sends_close() {
    let server = start().await;
    let mut socket = connect(&server.url, Some("alice")).await.unwrap();
    next_message(&mut socket).await;

    server.cancel.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
