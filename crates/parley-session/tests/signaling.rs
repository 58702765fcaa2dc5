mod common;

use std::time::Duration;

use common::{eventually, spawn_relay, wait_for};
use parley_proto::{RefusalCode, RoomJoined, RoomLeft};
use parley_session::{ConnectionStatus, SignalingClient, SignalingLink, StatusChange};
use serde_json::json;

fn notice(name: &str, is_initiator: bool) -> RoomJoined {
    RoomJoined {
        room_name: "party".into(),
        name: name.into(),
        is_initiator,
    }
}

#[test_timeout::tokio_timeout_test]
async fn clients_learn_roles_and_exchange_signals() {
    let relay = spawn_relay().await;
    let alice = SignalingClient::new(Duration::from_secs(2));
    let bob = SignalingClient::new(Duration::from_secs(2));
    let mut alice_joined = alice.events().room_joined.stream();
    let mut bob_joined = bob.events().room_joined.stream();
    let mut alice_signals = alice.events().peer_signal.stream();
    let mut alice_status = alice.events().status.stream();

    let link = alice.connect(&relay.url, "alice", "party").await.unwrap();
    assert_eq!(
        wait_for(&mut alice_status, |_| true).await,
        StatusChange {
            link,
            status: ConnectionStatus::Connecting,
            refusal: None
        }
    );
    assert_eq!(
        wait_for(&mut alice_status, |_| true).await.status,
        ConnectionStatus::Connected
    );
    assert_eq!(
        wait_for(&mut alice_joined, |_| true).await,
        notice("alice", true)
    );

    bob.connect(&relay.url, "bob", "party").await.unwrap();
    assert_eq!(wait_for(&mut alice_joined, |_| true).await, notice("bob", false));
    assert_eq!(wait_for(&mut bob_joined, |_| true).await, notice("alice", true));
    assert_eq!(wait_for(&mut bob_joined, |_| true).await, notice("bob", false));

    bob.send_signal(json!({ "type": "offer", "sdp": "v=0" })).unwrap();
    assert_eq!(
        wait_for(&mut alice_signals, |_| true).await,
        json!({ "type": "offer", "sdp": "v=0" })
    );
}

#[test_timeout::tokio_timeout_test]
async fn third_member_is_refused_with_reason() {
    let relay = spawn_relay().await;
    let alice = SignalingClient::default();
    let bob = SignalingClient::default();
    let mut bob_joined = bob.events().room_joined.stream();
    alice.connect(&relay.url, "alice", "party").await.unwrap();
    bob.connect(&relay.url, "bob", "party").await.unwrap();
    wait_for(&mut bob_joined, |joined| joined.name == "bob").await;

    let carol = SignalingClient::default();
    let mut carol_status = carol.events().status.stream();
    let link = carol.connect(&relay.url, "carol", "party").await.unwrap();
    let ended = wait_for(&mut carol_status, |change| {
        change.status == ConnectionStatus::Disconnected
    })
    .await;
    assert_eq!(ended.link, link);
    assert_eq!(ended.refusal, Some(RefusalCode::RoomFull));
    assert!(!carol.is_connected());
    assert!(alice.is_connected());
    assert_eq!(relay.state.registry.member_count(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn close_reports_once_and_peer_is_promoted() {
    let relay = spawn_relay().await;
    let alice = SignalingClient::default();
    let bob = SignalingClient::default();
    let mut bob_joined = bob.events().room_joined.stream();
    let mut bob_left = bob.events().room_left.stream();
    alice.connect(&relay.url, "alice", "party").await.unwrap();
    bob.connect(&relay.url, "bob", "party").await.unwrap();
    wait_for(&mut bob_joined, |joined| joined.name == "bob").await;

    let mut alice_status = alice.events().status.stream();
    alice.close();
    alice.close();
    assert_eq!(
        wait_for(&mut alice_status, |_| true).await.status,
        ConnectionStatus::Disconnected
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_status.try_recv().is_none());
    assert!(matches!(
        alice.send_signal(json!({})),
        Err(parley_session::SignalingError::NotConnected)
    ));

    assert_eq!(
        wait_for(&mut bob_left, |_| true).await,
        RoomLeft {
            room_name: "party".into(),
            name: "alice".into()
        }
    );
    assert_eq!(wait_for(&mut bob_joined, |_| true).await, notice("bob", true));

    bob.close();
    eventually(|| relay.state.registry.room_count() == 0).await;
}
