#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use parley_relay::{RelayConfig, RelayState};
use parley_session::EventStream;
use tokio::sync::oneshot;

pub struct Relay {
    pub url: String,
    pub state: Arc<RelayState>,
    _shutdown: oneshot::Sender<()>,
}

pub async fn spawn_relay() -> Relay {
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
        url: format!("ws://{addr}/ws"),
        state,
        _shutdown: shutdown_tx,
    }
}

/// Waits for the first event matching `pred`, skipping the rest.
pub async fn wait_for<T, F>(events: &mut EventStream<T>, mut pred: F) -> T
where
    F: FnMut(&T) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held");
}
