//! Client side of the relay protocol.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::{ClientMessage, RefusalCode, RoomJoined, RoomLeft, ServerMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::EventChannel;

/// Identifies one websocket connection made by a [`SignalingClient`].
pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub link: LinkId,
    pub status: ConnectionStatus,
    /// Set when the relay turned the join away.
    pub refusal: Option<RefusalCode>,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay connection timed out")]
    TimedOut,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Default)]
pub struct SignalingEvents {
    pub status: EventChannel<StatusChange>,
    pub room_joined: EventChannel<RoomJoined>,
    pub room_left: EventChannel<RoomLeft>,
    pub peer_signal: EventChannel<Value>,
}

/// What a session needs from the relay connection.
#[async_trait]
pub trait SignalingLink: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        name: &str,
        room_name: &str,
    ) -> Result<LinkId, SignalingError>;

    fn send_signal(&self, data: Value) -> Result<(), SignalingError>;

    fn close(&self);

    fn events(&self) -> &SignalingEvents;
}

pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    events: SignalingEvents,
    link: Mutex<Option<ActiveLink>>,
    next_link: AtomicU64,
    connect_timeout: Duration,
}

struct ActiveLink {
    id: LinkId,
    outbound: mpsc::UnboundedSender<Message>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: SignalingEvents::default(),
                link: Mutex::new(None),
                next_link: AtomicU64::new(0),
                connect_timeout,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }
}

impl Default for SignalingClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.inner.shutdown_link();
    }
}

#[async_trait]
impl SignalingLink for SignalingClient {
    async fn connect(
        &self,
        url: &str,
        name: &str,
        room_name: &str,
    ) -> Result<LinkId, SignalingError> {
        let url = relay_url(url, name, room_name)?;
        let link = self.inner.next_link.fetch_add(1, Ordering::SeqCst) + 1;

        self.close();
        self.inner.emit_status(link, ConnectionStatus::Connecting, None);

        let stream = match timeout(self.inner.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                self.inner.emit_status(link, ConnectionStatus::Disconnected, None);
                return Err(SignalingError::Connect(err.to_string()));
            }
            Err(_) => {
                self.inner.emit_status(link, ConnectionStatus::Disconnected, None);
                return Err(SignalingError::TimedOut);
            }
        };
        debug!(target = "signaling", link, url = %url, "relay websocket connected");

        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        *self.inner.link.lock() = Some(ActiveLink {
            id: link,
            outbound,
            reader: None,
        });
        self.inner.emit_status(link, ConnectionStatus::Connected, None);

        let reader_inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            let mut refusal = None;
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_inner.dispatch(text.as_bytes(), &mut refusal),
                    Ok(Message::Binary(bytes)) => reader_inner.dispatch(&bytes, &mut refusal),
                    Ok(Message::Close(frame)) => {
                        if refusal.is_none() {
                            refusal = frame
                                .and_then(|f| RefusalCode::from_close_code(u16::from(f.code)));
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "signaling", "relay websocket closed: {err}");
                            }
                            _ => warn!(target = "signaling", "relay websocket error: {err}"),
                        }
                        break;
                    }
                }
            }
            reader_inner.link_ended(link, refusal);
        });

        match self.inner.link.lock().as_mut() {
            Some(active) if active.id == link => active.reader = Some(reader),
            _ => reader.abort(),
        }
        Ok(link)
    }

    fn send_signal(&self, data: Value) -> Result<(), SignalingError> {
        let text = ClientMessage::PeerSignal { data }.to_json()?;
        let guard = self.inner.link.lock();
        let link = guard.as_ref().ok_or(SignalingError::NotConnected)?;
        link.outbound
            .send(Message::Text(text))
            .map_err(|_| SignalingError::NotConnected)
    }

    fn close(&self) {
        if let Some(link) = self.inner.shutdown_link() {
            info!(target = "signaling", link, "relay link closed");
            self.inner
                .emit_status(link, ConnectionStatus::Disconnected, None);
        }
    }

    fn events(&self) -> &SignalingEvents {
        &self.inner.events
    }
}

impl Inner {
    fn emit_status(&self, link: LinkId, status: ConnectionStatus, refusal: Option<RefusalCode>) {
        self.events.status.emit(&StatusChange {
            link,
            status,
            refusal,
        });
    }

    /// Sends a close frame and stops reading. Returns the id of the link that
    /// was open, if any.
    fn shutdown_link(&self) -> Option<LinkId> {
        let link = self.link.lock().take()?;
        let _ = link.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("client closed"),
        })));
        if let Some(reader) = link.reader {
            reader.abort();
        }
        Some(link.id)
    }

    fn link_ended(&self, link: LinkId, refusal: Option<RefusalCode>) {
        let ended = {
            let mut guard = self.link.lock();
            match guard.as_ref() {
                Some(active) if active.id == link => guard.take(),
                _ => None,
            }
        };
        if ended.is_some() {
            match refusal {
                Some(code) => warn!(target = "signaling", link, reason = %code, "relay refused join"),
                None => debug!(target = "signaling", link, "relay link ended"),
            }
            self.emit_status(link, ConnectionStatus::Disconnected, refusal);
        }
    }

    fn dispatch(&self, bytes: &[u8], refusal: &mut Option<RefusalCode>) {
        match ServerMessage::decode(bytes) {
            Ok(ServerMessage::RoomJoined(joined)) => self.events.room_joined.emit(&joined),
            Ok(ServerMessage::RoomLeft(left)) => self.events.room_left.emit(&left),
            Ok(ServerMessage::PeerSignal { data }) => self.events.peer_signal.emit(&data),
            Ok(ServerMessage::JoinRefused(refused)) => {
                debug!(target = "signaling", code = %refused.code, reason = %refused.reason, "join refused");
                *refusal = Some(refused.code);
            }
            Err(err) => warn!(target = "signaling", error = %err, "dropping unreadable relay frame"),
        }
    }
}

/// Appends the join parameters to the relay endpoint, accepting http(s)
/// spellings of the websocket scheme.
pub fn relay_url(base: &str, name: &str, room_name: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base).map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?;
    url.query_pairs_mut()
        .append_pair("name", name)
        .append_pair("roomName", room_name);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn relay_url_appends_join_parameters() {
        let url = relay_url("ws://relay.example:8080/ws", "alice smith", "party").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://relay.example:8080/ws?name=alice+smith&roomName=party"
        );
    }

    #[test_timeout::timeout]
    fn relay_url_maps_http_schemes() {
        assert_eq!(
            relay_url("https://relay.example/ws", "a", "b").unwrap().scheme(),
            "wss"
        );
        assert!(matches!(
            relay_url("ftp://relay.example", "a", "b"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(
            relay_url("not a url", "a", "b"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[test_timeout::timeout]
    fn send_without_link_fails() {
        let client = SignalingClient::default();
        assert!(matches!(
            client.send_signal(serde_json::json!({})),
            Err(SignalingError::NotConnected)
        ));
        assert!(!client.is_connected());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_connect_reports_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SignalingClient::new(Duration::from_secs(2));
        let mut statuses = client.events().status.stream();
        let result = client
            .connect(&format!("ws://{addr}/ws"), "alice", "party")
            .await;
        assert!(matches!(result, Err(SignalingError::Connect(_))));
        assert_eq!(
            statuses.recv().await.map(|s| s.status),
            Some(ConnectionStatus::Connecting)
        );
        assert_eq!(
            statuses.recv().await.map(|s| s.status),
            Some(ConnectionStatus::Disconnected)
        );
    }
}
