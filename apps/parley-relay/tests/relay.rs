use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use parley_proto::{ClientMessage, RefusalCode, RoomJoined, RoomLeft, ServerMessage};
use parley_relay::{RelayConfig, RelayState};
use serde_json::json;
use tokio::{net::TcpStream, sync::oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, PartialEq)]
enum Frame {
    Message(ServerMessage),
    Closed(Option<u16>),
}

struct Relay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_relay() -> Relay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        listen_addr: addr,
        handshake_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let state = RelayState::new(config, None);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = parley_relay::serve(listener, server_state, async move {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    Relay {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

async fn join(relay: &Relay, room: &str, name: &str) -> Client {
    let url = format!("ws://{}/ws?name={name}&roomName={room}", relay.addr);
    let (client, _) = connect_async(url.as_str()).await.unwrap();
    client
}

async fn next_frame(client: &mut Client) -> Frame {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for relay frame");
        match frame {
            Some(Ok(Message::Text(text))) => {
                return Frame::Message(ServerMessage::decode(text.as_bytes()).unwrap())
            }
            Some(Ok(Message::Close(frame))) => {
                return Frame::Closed(frame.map(|f| u16::from(f.code)))
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Frame::Closed(None),
        }
    }
}

fn joined(room: &str, name: &str, is_initiator: bool) -> Frame {
    Frame::Message(ServerMessage::RoomJoined(RoomJoined {
        room_name: room.into(),
        name: name.into(),
        is_initiator,
    }))
}

async fn send(client: &mut Client, message: &ClientMessage) {
    client
        .send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

async fn assert_refused(client: &mut Client, code: RefusalCode) {
    match next_frame(client).await {
        Frame::Message(ServerMessage::JoinRefused(refused)) => assert_eq!(refused.code, code),
        other => panic!("expected refusal, got {other:?}"),
    }
    assert_eq!(next_frame(client).await, Frame::Closed(Some(code.close_code())));
}

#[test_timeout::tokio_timeout_test]
async fn two_members_learn_each_others_roles() {
    let relay = spawn_relay().await;

    let mut alice = join(&relay, "party", "alice").await;
    assert_eq!(next_frame(&mut alice).await, joined("party", "alice", true));

    let mut bob = join(&relay, "party", "bob").await;
    assert_eq!(next_frame(&mut bob).await, joined("party", "alice", true));
    assert_eq!(next_frame(&mut bob).await, joined("party", "bob", false));
    assert_eq!(next_frame(&mut alice).await, joined("party", "bob", false));
}

#[test_timeout::tokio_timeout_test]
async fn third_member_is_refused_and_room_keeps_working() {
    let relay = spawn_relay().await;
    let mut alice = join(&relay, "party", "alice").await;
    next_frame(&mut alice).await;
    let mut bob = join(&relay, "party", "bob").await;
    next_frame(&mut bob).await;
    next_frame(&mut bob).await;
    next_frame(&mut alice).await;

    let mut carol = join(&relay, "party", "carol").await;
    assert_refused(&mut carol, RefusalCode::RoomFull).await;

    let payload = json!({"type": "offer", "sdp": "v=0"});
    send(
        &mut alice,
        &ClientMessage::PeerSignal {
            data: payload.clone(),
        },
    )
    .await;
    assert_eq!(
        next_frame(&mut bob).await,
        Frame::Message(ServerMessage::PeerSignal { data: payload })
    );
    assert_eq!(relay.state.registry.member_count(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_name_is_refused() {
    let relay = spawn_relay().await;
    let mut alice = join(&relay, "party", "alice").await;
    next_frame(&mut alice).await;

    let mut impostor = join(&relay, "party", "alice").await;
    assert_refused(&mut impostor, RefusalCode::NameTaken).await;
}

#[test_timeout::tokio_timeout_test]
async fn missing_parameters_time_out_into_refusal() {
    let relay = spawn_relay().await;
    let url = format!("ws://{}/ws?name=alice", relay.addr);
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    assert_refused(&mut client, RefusalCode::InvalidParameters).await;
    assert_eq!(relay.state.registry.room_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn room_join_envelope_fills_in_missing_parameters() {
    let relay = spawn_relay().await;
    let url = format!("ws://{}/ws", relay.addr);
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    send(
        &mut client,
        &ClientMessage::RoomJoin {
            room_name: "lobby".into(),
            name: "dana".into(),
        },
    )
    .await;
    assert_eq!(next_frame(&mut client).await, joined("lobby", "dana", true));
}

#[test_timeout::tokio_timeout_test]
async fn departures_notify_and_promote() {
    let relay = spawn_relay().await;
    let mut alice = join(&relay, "party", "alice").await;
    next_frame(&mut alice).await;
    let mut bob = join(&relay, "party", "bob").await;
    next_frame(&mut bob).await;
    next_frame(&mut bob).await;
    next_frame(&mut alice).await;

    alice.close(None).await.unwrap();

    assert_eq!(
        next_frame(&mut bob).await,
        Frame::Message(ServerMessage::RoomLeft(RoomLeft {
            room_name: "party".into(),
            name: "alice".into(),
        }))
    );
    assert_eq!(next_frame(&mut bob).await, joined("party", "bob", true));

    bob.close(None).await.unwrap();
    for _ in 0..50 {
        if relay.state.registry.room_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.state.registry.room_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_are_dropped_without_closing() {
    let relay = spawn_relay().await;
    let mut alice = join(&relay, "party", "alice").await;
    next_frame(&mut alice).await;
    let mut bob = join(&relay, "party", "bob").await;
    next_frame(&mut bob).await;
    next_frame(&mut bob).await;
    next_frame(&mut alice).await;

    alice
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();
    alice
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    send(
        &mut alice,
        &ClientMessage::PeerSignal {
            data: json!({"type": "candidate"}),
        },
    )
    .await;

    assert_eq!(
        next_frame(&mut bob).await,
        Frame::Message(ServerMessage::PeerSignal {
            data: json!({"type": "candidate"})
        })
    );
}
