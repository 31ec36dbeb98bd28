use std::net::SocketAddr;
use std::time::Duration;

use coedit_common::protocol::signal::{HandshakeMessage, SignalMessage};
use coedit_relay::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    tokio::spawn(async move {
        coedit_relay::serve(listener, config, std::future::pending()).await.expect("relay should run");
    });
    addr
}

async fn connect(addr: SocketAddr) -> ClientSocket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.expect("client should connect");
    socket
}

async fn send(socket: &mut ClientSocket, message: &SignalMessage) {
    let encoded = serde_json::to_string(message).expect("frame should encode");
    socket.send(WsMessage::Text(encoded.into())).await.expect("frame should send");
}

async fn recv(socket: &mut ClientSocket) -> SignalMessage {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let message =
            next.expect("websocket should remain open").expect("websocket read should succeed");

        match message {
            WsMessage::Text(raw) => {
                return serde_json::from_str(raw.as_str()).expect("relay frame should decode");
            }
            WsMessage::Ping(payload) => {
                socket.send(WsMessage::Pong(payload)).await.expect("websocket should reply to ping");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn register(socket: &mut ClientSocket, id: &str, name: Option<&str>) {
    send(
        socket,
        &SignalMessage::Register { user_id: Some(id.to_string()), username: name.map(Into::into) },
    )
    .await;
    assert_eq!(recv(socket).await, SignalMessage::RegisterSuccess { user_id: id.to_string() });
}

fn offer(sender: &str, receiver: &str) -> SignalMessage {
    SignalMessage::Offer(HandshakeMessage::new(json!({ "type": "offer", "sdp": "v=0" }), sender, receiver))
}

fn quiet_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.request_username = false;
    config
}

#[tokio::test]
async fn offer_to_offline_receiver_is_delivered_after_it_registers() {
    let addr = spawn_relay(quiet_config()).await;

    let mut alice = connect(addr).await;
    register(&mut alice, "alice", Some("Alice")).await;
    send(&mut alice, &offer("alice", "bob")).await;

    let mut bob = connect(addr).await;
    register(&mut bob, "bob", None).await;

    let SignalMessage::Offer(delivered) = recv(&mut bob).await else {
        panic!("bob should receive the queued offer right after registerSuccess");
    };
    assert_eq!(delivered.sender_id.as_deref(), Some("alice"));
    assert_eq!(delivered.sender_name.as_deref(), Some("Alice"));
    assert_eq!(delivered.payload, Some(json!({ "type": "offer", "sdp": "v=0" })));
}

#[tokio::test]
async fn offer_is_routed_by_display_name() {
    let addr = spawn_relay(quiet_config()).await;

    let mut bob = connect(addr).await;
    register(&mut bob, "bob", Some("Bob")).await;
    let mut alice = connect(addr).await;
    register(&mut alice, "alice", None).await;

    send(&mut alice, &offer("alice", "Bob")).await;
    let SignalMessage::Offer(delivered) = recv(&mut bob).await else {
        panic!("bob should receive the offer addressed to his display name");
    };
    assert_eq!(delivered.sender_id.as_deref(), Some("alice"));
    assert_eq!(delivered.receiver_id.as_deref(), Some("Bob"));
}

#[tokio::test]
async fn register_without_name_is_asked_for_one() {
    let addr = spawn_relay(RelayConfig::default()).await;

    let mut client = connect(addr).await;
    send(&mut client, &SignalMessage::Register { user_id: None, username: None }).await;
    let SignalMessage::RegisterSuccess { user_id } = recv(&mut client).await else {
        panic!("first frame should be registerSuccess");
    };
    assert!(!user_id.is_empty());
    assert_eq!(recv(&mut client).await, SignalMessage::RequestUsername);

    send(&mut client, &SignalMessage::SetUsername { username: "Carol".into() }).await;

    let mut other = connect(addr).await;
    send(&mut other, &SignalMessage::Register { user_id: Some("dave".into()), username: None }).await;
    assert_eq!(recv(&mut other).await, SignalMessage::RegisterSuccess { user_id: "dave".into() });
    assert_eq!(recv(&mut other).await, SignalMessage::RequestUsername);
    send(&mut other, &SignalMessage::SetUsername { username: "Carol".into() }).await;
    let SignalMessage::Error { code, .. } = recv(&mut other).await else {
        panic!("taken display name should be rejected");
    };
    assert_eq!(code.as_deref(), Some("ALIAS_CONFLICT"));
}

#[tokio::test]
async fn invalid_candidate_is_answered_with_error_and_not_forwarded() {
    let addr = spawn_relay(quiet_config()).await;

    let mut bob = connect(addr).await;
    register(&mut bob, "bob", None).await;
    let mut alice = connect(addr).await;
    register(&mut alice, "alice", None).await;

    send(
        &mut alice,
        &SignalMessage::Candidate(HandshakeMessage {
            receiver_id: Some("bob".into()),
            ..Default::default()
        }),
    )
    .await;
    let SignalMessage::Error { code, message } = recv(&mut alice).await else {
        panic!("alice should receive a validation error");
    };
    assert_eq!(code.as_deref(), Some("VALIDATION_FAILED"));
    assert!(message.contains("candidate"));

    // A valid frame afterwards proves nothing was forwarded before it.
    send(&mut alice, &offer("alice", "bob")).await;
    assert!(matches!(recv(&mut bob).await, SignalMessage::Offer(_)));
}

#[tokio::test]
async fn unregistered_offer_without_sender_is_rejected() {
    let addr = spawn_relay(quiet_config()).await;
    let mut anonymous = connect(addr).await;

    send(
        &mut anonymous,
        &SignalMessage::Offer(HandshakeMessage {
            payload: Some(json!({ "sdp": "v=0" })),
            receiver_id: Some("bob".into()),
            ..Default::default()
        }),
    )
    .await;
    let SignalMessage::Error { code, .. } = recv(&mut anonymous).await else {
        panic!("expected an error frame");
    };
    assert_eq!(code.as_deref(), Some("REGISTRATION_REQUIRED"));
}

#[tokio::test]
async fn malformed_frame_yields_invalid_message_error() {
    let addr = spawn_relay(quiet_config()).await;
    let mut client = connect(addr).await;

    client.send(WsMessage::Text("not json".into())).await.expect("send garbage");
    let SignalMessage::Error { code, .. } = recv(&mut client).await else {
        panic!("expected an error frame");
    };
    assert_eq!(code.as_deref(), Some("INVALID_MESSAGE"));
}

#[tokio::test]
async fn reregistration_supersedes_previous_connection() {
    let addr = spawn_relay(quiet_config()).await;

    let mut first = connect(addr).await;
    register(&mut first, "alice", None).await;
    let mut second = connect(addr).await;
    register(&mut second, "alice", None).await;

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "superseded connection should be closed");

    let mut bob = connect(addr).await;
    register(&mut bob, "bob", None).await;
    send(&mut bob, &offer("bob", "alice")).await;
    assert!(matches!(recv(&mut second).await, SignalMessage::Offer(_)));
}

#[tokio::test]
async fn silent_client_is_evicted_and_later_offers_are_queued() {
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(150);
    let addr = spawn_relay(config).await;

    let mut silent = connect(addr).await;
    register(&mut silent, "silent", Some("Silent")).await;

    // Not polling the socket means pings go unanswered.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let saw_close = timeout(Duration::from_secs(2), async {
        loop {
            match silent.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(saw_close, "unresponsive client should be evicted");

    let mut alice = connect(addr).await;
    register(&mut alice, "alice", None).await;
    send(&mut alice, &offer("alice", "Silent")).await;

    // The alias went with the session, so the offer waits for whoever claims it.
    let mut revived = connect(addr).await;
    register(&mut revived, "silent", None).await;
    let early = timeout(Duration::from_millis(200), recv(&mut revived)).await;
    assert!(early.is_err(), "offer addressed by alias should still be queued: {early:?}");

    send(&mut revived, &SignalMessage::SetUsername { username: "Silent".into() }).await;
    let SignalMessage::Offer(delivered) = recv(&mut revived).await else {
        panic!("queued offer should be flushed once the name is claimed");
    };
    assert_eq!(delivered.receiver_id.as_deref(), Some("Silent"));
}

#[tokio::test]
async fn socket_that_never_registers_is_closed() {
    let mut config = quiet_config();
    config.registration_timeout = Duration::from_millis(150);
    let addr = spawn_relay(config).await;

    let mut idle = connect(addr).await;
    let mut registered = connect(addr).await;
    register(&mut registered, "alice", None).await;

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match idle.next().await {
                Some(Ok(WsMessage::Close(frame))) => {
                    return frame.map(|frame| frame.reason.to_string());
                }
                None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("unregistered socket should be closed");
    assert_eq!(closed.as_deref(), Some("registration timeout"));

    // Registered sockets are past the deadline and keep working.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut bob = connect(addr).await;
    register(&mut bob, "bob", None).await;
    send(&mut bob, &offer("bob", "alice")).await;
    assert!(matches!(recv(&mut registered).await, SignalMessage::Offer(_)));
}
