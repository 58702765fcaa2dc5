use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parley_proto::{ClientMessage, JoinRefused, RefusalCode, ServerMessage};
use serde::Deserialize;
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{rooms::Admission, telemetry, RelayState};

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub name: Option<String>,
    #[serde(rename = "roomName")]
    pub room_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinParams {
    name: String,
    room_name: String,
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("client closed socket before joining")]
    SocketClosed,
    #[error("client sent invalid payload: {0}")]
    InvalidPayload(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::Protocol(_) => "protocol_error",
        }
    }
}

pub async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
    Query(query): Query<JoinQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    query: JoinQuery,
    remote_addr: SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let params = match resolve_params(query, state.config.handshake_timeout, &mut ws_rx).await {
        Ok(Some(params)) => params,
        Ok(None) => {
            info!(remote = %remote_addr, "join refused: missing name or roomName");
            refuse(&mut ws_tx, RefusalCode::InvalidParameters).await;
            return;
        }
        Err(err) => {
            warn!(remote = %remote_addr, error = %err, "join handshake failed");
            telemetry::record_handshake_failure(err.metric_label());
            refuse(&mut ws_tx, RefusalCode::InvalidParameters).await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let admission = match state
        .registry
        .join(&params.room_name, &params.name, outbound_tx)
    {
        Ok(admission) => admission,
        Err(code) => {
            info!(
                remote = %remote_addr,
                room = %params.room_name,
                name = %params.name,
                reason = %code,
                "join refused"
            );
            refuse(&mut ws_tx, code).await;
            return;
        }
    };

    telemetry::record_join();
    state.record_occupancy();
    info!(
        remote = %remote_addr,
        room = %admission.room_name,
        name = %admission.name,
        is_initiator = admission.is_initiator,
        room_size = admission.room_size,
        "member joined"
    );

    let writer_name = admission.name.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode relay message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(name = %writer_name, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_client_frame(&state, &admission, text.as_bytes()),
            Ok(Message::Binary(bytes)) => handle_client_frame(&state, &admission, &bytes),
            Ok(Message::Close(frame)) => {
                debug!(
                    room = %admission.room_name,
                    name = %admission.name,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    room = %admission.room_name,
                    name = %admission.name,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        }
    }

    if let Some(departure) = state
        .registry
        .leave(&admission.room_name, admission.participant_id)
    {
        info!(
            room = %admission.room_name,
            name = %departure.name,
            remaining = departure.remaining,
            promoted = ?departure.promoted,
            room_deleted = departure.room_deleted,
            "member left"
        );
    }
    state.record_occupancy();
    writer.abort();
}

fn handle_client_frame(state: &RelayState, admission: &Admission, bytes: &[u8]) {
    match ClientMessage::decode(bytes) {
        Ok(ClientMessage::PeerSignal { data }) => {
            let delivered =
                state
                    .registry
                    .relay_signal(&admission.room_name, admission.participant_id, &data);
            telemetry::record_signals_relayed(delivered);
            if delivered == 0 {
                debug!(
                    room = %admission.room_name,
                    name = %admission.name,
                    "signal dropped: no other member in room"
                );
            }
        }
        Ok(ClientMessage::RoomJoin { .. }) => {
            debug!(
                room = %admission.room_name,
                name = %admission.name,
                "ignoring roomJoin from an admitted member"
            );
        }
        Err(err) => {
            telemetry::record_malformed_frame(err.metric_label());
            warn!(
                room = %admission.room_name,
                name = %admission.name,
                error = %err,
                "dropping malformed client frame"
            );
        }
    }
}

/// Takes the join parameters from the query string, falling back to a
/// `roomJoin` envelope for whatever the query left out.
async fn resolve_params(
    query: JoinQuery,
    handshake_timeout: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Option<JoinParams>, HandshakeError> {
    let mut name = query.name;
    let mut room_name = query.room_name;

    if name.is_none() || room_name.is_none() {
        let frame = timeout(handshake_timeout, ws_rx.next())
            .await
            .map_err(|_| HandshakeError::TimedOut)?
            .ok_or(HandshakeError::SocketClosed)?
            .map_err(|err| HandshakeError::Protocol(err.to_string()))?;
        let bytes = match frame {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return Err(HandshakeError::SocketClosed),
            other => {
                return Err(HandshakeError::InvalidPayload(format!(
                    "unexpected frame {other:?}"
                )))
            }
        };
        match ClientMessage::decode(&bytes)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?
        {
            ClientMessage::RoomJoin {
                room_name: joined_room,
                name: joined_name,
            } => {
                name = name.or(Some(joined_name));
                room_name = room_name.or(Some(joined_room));
            }
            ClientMessage::PeerSignal { .. } => {
                return Err(HandshakeError::InvalidPayload(
                    "peerSignal sent before joining a room".into(),
                ))
            }
        }
    }

    Ok(match (name, room_name) {
        (Some(name), Some(room_name)) => Some(JoinParams { name, room_name }),
        _ => None,
    })
}

async fn refuse(ws_tx: &mut SplitSink<WebSocket, Message>, code: RefusalCode) {
    telemetry::record_refusal(code);
    let notice = ServerMessage::JoinRefused(JoinRefused {
        code,
        reason: code.describe().to_string(),
    });
    if let Ok(text) = notice.to_json() {
        let _ = ws_tx.send(Message::Text(text)).await;
    }
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: code.close_code(),
            reason: Cow::Borrowed(code.as_str()),
        })))
        .await;
}

impl RelayState {
    fn record_occupancy(&self) {
        telemetry::record_occupancy(self.registry.room_count(), self.registry.member_count());
    }
}
