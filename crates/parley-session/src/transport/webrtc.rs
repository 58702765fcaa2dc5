//! WebRTC transport backed by webrtc-rs.
//!
//! The initiator opens the `parley` data channel; both sides trickle ICE
//! candidates as `{type: "candidate"}` signals. Once the channel is open the
//! transport reports `connect`, and later track changes renegotiate through
//! fresh offers.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    data_channel::{data_channel_message::DataChannelMessage, RTCDataChannel},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        RTCRtpTransceiver,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use super::{Role, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportPrimitive};
use crate::media::{MediaStream, MediaTrack, TrackKind};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: "parley".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

impl WireSignal {
    fn into_event(self) -> Option<TransportEvent> {
        match serde_json::to_value(self) {
            Ok(value) => Some(TransportEvent::Signal(value)),
            Err(err) => {
                warn!(target = "webrtc", error = %err, "failed to encode signal");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportPrimitive>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let shared = Arc::new(Shared {
            peer_connection,
            role,
            events,
            data_channel: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(Vec::new()),
            remote_streams: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            offer_in_flight: AtomicBool::new(false),
            renegotiate_pending: AtomicBool::new(false),
        });
        Shared::install_handlers(&shared);

        if role.is_initiator() {
            let channel = shared
                .peer_connection
                .create_data_channel(&self.config.data_channel_label, None)
                .await?;
            Shared::bind_data_channel(&shared, channel);
            shared.negotiate().await;
        }

        debug!(target = "webrtc", ?role, generation = shared.events.generation(), "peer connection created");
        Ok(Arc::new(WebRtcTransport { shared }))
    }
}

struct Shared {
    peer_connection: Arc<RTCPeerConnection>,
    role: Role,
    events: TransportEvents,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_streams: Mutex<HashSet<String>>,
    connected: AtomicBool,
    finished: AtomicBool,
    offer_in_flight: AtomicBool,
    renegotiate_pending: AtomicBool,
}

impl Shared {
    fn install_handlers(shared: &Arc<Self>) {
        let pc = &shared.peer_connection;

        let weak = Arc::downgrade(shared);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(shared), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Some(event) = (WireSignal::Candidate { candidate: init }).into_event() {
                            shared.events.emit(event);
                        }
                    }
                    Err(err) => warn!(target = "webrtc", error = %err, "failed to serialise candidate"),
                }
            })
        }));

        let weak = Arc::downgrade(shared);
        pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.negotiate().await;
                }
            })
        }));

        let weak = Arc::downgrade(shared);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                debug!(target = "webrtc", ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Failed => {
                        shared.finish(TransportEvent::Error("peer connection failed".into()))
                    }
                    RTCPeerConnectionState::Closed => shared.finish(TransportEvent::Close),
                    _ => {}
                }
            })
        }));

        let weak = Arc::downgrade(shared);
        pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.accept_remote_track(remote);
                    }
                })
            },
        ));

        if !shared.role.is_initiator() {
            let weak = Arc::downgrade(shared);
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        debug!(target = "webrtc", label = %channel.label(), "data channel received");
                        Shared::bind_data_channel(&shared, channel);
                    }
                })
            }));
        }
    }

    fn bind_data_channel(shared: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        *shared.data_channel.lock() = Some(Arc::clone(&channel));

        let weak: Weak<Self> = Arc::downgrade(shared);
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                shared.connected.store(true, Ordering::SeqCst);
                shared.events.emit(TransportEvent::Connect);
                if shared.renegotiate_pending.swap(false, Ordering::SeqCst) {
                    shared.negotiate().await;
                }
            })
        }));

        let weak = Arc::downgrade(shared);
        channel.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.finish(TransportEvent::Close);
                }
            })
        }));

        let weak = Arc::downgrade(shared);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.events.emit(TransportEvent::Data(message.data));
                }
            })
        }));
    }

    /// Emits the terminal event at most once.
    fn finish(&self, event: TransportEvent) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            self.events.emit(event);
        }
    }

    fn accept_remote_track(&self, remote: Arc<TrackRemote>) {
        let kind = match remote.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            other => {
                debug!(target = "webrtc", ?other, "ignoring remote track of unknown kind");
                return;
            }
        };
        let stream_id = remote.stream_id();
        if self.remote_streams.lock().insert(stream_id.clone()) {
            self.events.emit(TransportEvent::Stream {
                stream_id: stream_id.clone(),
            });
        }
        self.events.emit(TransportEvent::Track {
            track: MediaTrack {
                id: remote.id(),
                kind,
                label: format!("remote {kind}"),
            },
            stream_id,
        });

        // Keep the receiver drained so interceptors keep running.
        tokio::spawn(async move { while remote.read_rtp().await.is_ok() {} });
    }

    /// Creates and publishes an offer, unless one is already outstanding or
    /// the responder is not yet allowed to offer.
    async fn negotiate(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        let may_offer = self.role.is_initiator() || self.connected.load(Ordering::SeqCst);
        if !may_offer
            || self.peer_connection.signaling_state() != RTCSignalingState::Stable
            || self.offer_in_flight.swap(true, Ordering::SeqCst)
        {
            self.renegotiate_pending.store(true, Ordering::SeqCst);
            return;
        }
        if let Err(err) = self.publish_offer().await {
            self.offer_in_flight.store(false, Ordering::SeqCst);
            warn!(target = "webrtc", error = %err, "failed to create offer");
        }
    }

    async fn publish_offer(&self) -> Result<(), TransportError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        if let Some(event) = (WireSignal::Offer { sdp: offer.sdp }).into_event() {
            self.events.emit(event);
        }
        Ok(())
    }

    async fn flush_candidates(&self) -> Result<(), TransportError> {
        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            self.peer_connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportPrimitive for WebRtcTransport {
    async fn signal(&self, data: Value) -> Result<(), TransportError> {
        let signal: WireSignal = serde_json::from_value(data)
            .map_err(|err| TransportError::InvalidSignal(err.to_string()))?;
        let shared = &self.shared;
        let pc = &shared.peer_connection;

        match signal {
            WireSignal::Offer { sdp } => {
                if pc.signaling_state() != RTCSignalingState::Stable && shared.role.is_initiator() {
                    debug!(target = "webrtc", "ignoring colliding offer");
                    return Ok(());
                }
                pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                shared.flush_candidates().await?;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                if let Some(event) = (WireSignal::Answer { sdp: answer.sdp }).into_event() {
                    shared.events.emit(event);
                }
            }
            WireSignal::Answer { sdp } => {
                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                shared.flush_candidates().await?;
                shared.offer_in_flight.store(false, Ordering::SeqCst);
                if shared.renegotiate_pending.swap(false, Ordering::SeqCst) {
                    shared.negotiate().await;
                }
            }
            WireSignal::Candidate { candidate } => {
                if pc.remote_description().await.is_none() {
                    shared.pending_candidates.lock().push(candidate);
                } else {
                    pc.add_ice_candidate(candidate).await?;
                }
            }
        }
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let channel = self
            .shared
            .data_channel
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        channel.send(&payload).await?;
        Ok(())
    }

    async fn add_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
    ) -> Result<(), TransportError> {
        if self.shared.senders.lock().contains_key(&track.id) {
            return Ok(());
        }
        let capability = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id.clone(),
            stream.id.clone(),
        ));
        let sender = self
            .shared
            .peer_connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.shared.senders.lock().insert(track.id.clone(), sender);
        Ok(())
    }

    async fn remove_track(
        &self,
        track: &MediaTrack,
        _stream: &MediaStream,
    ) -> Result<(), TransportError> {
        let sender = self.shared.senders.lock().remove(&track.id);
        if let Some(sender) = sender {
            self.shared.peer_connection.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.shared.finish(TransportEvent::Close);
        let channel = self.shared.data_channel.lock().take();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        if let Err(err) = self.shared.peer_connection.close().await {
            warn!(target = "webrtc", error = %err, "failed to close peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn wire_signals_are_type_tagged() {
        let offer = serde_json::to_value(WireSignal::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(offer, json!({"type": "offer", "sdp": "v=0"}));

        let candidate: WireSignal = serde_json::from_value(json!({
            "type": "candidate",
            "candidate": {"candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host"}
        }))
        .unwrap();
        assert!(matches!(candidate, WireSignal::Candidate { .. }));
    }

    #[test_timeout::timeout]
    fn default_config_uses_public_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.data_channel_label, "parley");
    }

    #[test_timeout::tokio_timeout_test(30)]
    #[ignore = "opens real UDP sockets"]
    async fn host_candidates_connect_two_peers() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig {
            ice_servers: Vec::new(),
            ..WebRtcConfig::default()
        });
        let (a_events, mut a_rx) = TransportEvents::channel(1);
        let (b_events, mut b_rx) = TransportEvents::channel(1);
        let a = factory.create(Role::Initiator, a_events).await.unwrap();
        let b = factory.create(Role::Responder, b_events).await.unwrap();

        let (mut a_connected, mut b_connected) = (false, false);
        while !(a_connected && b_connected) {
            tokio::select! {
                Some(event) = a_rx.recv() => match event {
                    TransportEvent::Signal(data) => b.signal(data).await.unwrap(),
                    TransportEvent::Connect => a_connected = true,
                    _ => {}
                },
                Some(event) = b_rx.recv() => match event {
                    TransportEvent::Signal(data) => a.signal(data).await.unwrap(),
                    TransportEvent::Connect => b_connected = true,
                    _ => {}
                },
            }
        }

        a.send(Bytes::from_static(b"hello")).await.unwrap();
        loop {
            if let Some(TransportEvent::Data(data)) = b_rx.recv().await {
                assert_eq!(&data[..], b"hello");
                break;
            }
        }
        a.destroy().await;
        b.destroy().await;
    }
}
