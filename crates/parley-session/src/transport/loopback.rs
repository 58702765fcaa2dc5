//! In-process transport pairs.
//!
//! Behaves like a real peer connection from the session's point of view: the
//! initiator emits an offer, the responder answers, and both sides connect
//! once the answer is applied. Adding or removing a track produces a
//! renegotiation signal; the peer only raises `track` events for additions,
//! mirroring transports that never report remote removal.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Role, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportPrimitive};
use crate::media::{MediaStream, MediaTrack};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LoopbackSignal {
    Offer { endpoint: u64 },
    Answer { endpoint: u64 },
    Renegotiate { tracks: Vec<AnnouncedTrack> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnnouncedTrack {
    track: MediaTrack,
    stream_id: String,
}

struct Endpoint {
    events: TransportEvents,
    peer: Option<u64>,
    connected: bool,
    local: Vec<AnnouncedTrack>,
    remote_tracks: HashSet<String>,
    remote_streams: HashSet<String>,
}

impl Endpoint {
    fn announce(&self) {
        if let Ok(data) = serde_json::to_value(LoopbackSignal::Renegotiate {
            tracks: self.local.clone(),
        }) {
            self.events.emit(TransportEvent::Signal(data));
        }
    }
}

#[derive(Default)]
struct Network {
    endpoints: HashMap<u64, Endpoint>,
    next_id: u64,
}

impl Network {
    fn endpoint(&mut self, id: u64) -> Result<&mut Endpoint, TransportError> {
        self.endpoints.get_mut(&id).ok_or(TransportError::Closed)
    }
}

/// Shared switchboard; every transport created from the same network can
/// reach every other one.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_endpoints(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Raises an `error` event on every live endpoint.
    pub fn fail_all(&self, reason: &str) {
        for endpoint in self.inner.lock().endpoints.values() {
            endpoint
                .events
                .emit(TransportEvent::Error(reason.to_string()));
        }
    }

    /// Hands `payload` to every connected endpoint as if its peer had sent
    /// it over the data channel.
    pub fn deliver_raw(&self, payload: &[u8]) {
        for endpoint in self.inner.lock().endpoints.values() {
            if endpoint.connected {
                endpoint
                    .events
                    .emit(TransportEvent::Data(Bytes::copy_from_slice(payload)));
            }
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportPrimitive>, TransportError> {
        let mut network = self.inner.lock();
        let id = network.next_id;
        network.next_id += 1;
        if role.is_initiator() {
            let offer = serde_json::to_value(LoopbackSignal::Offer { endpoint: id })
                .map_err(|err| TransportError::Setup(err.to_string()))?;
            events.emit(TransportEvent::Signal(offer));
        }
        network.endpoints.insert(
            id,
            Endpoint {
                events,
                peer: None,
                connected: false,
                local: Vec::new(),
                remote_tracks: HashSet::new(),
                remote_streams: HashSet::new(),
            },
        );
        debug!(endpoint = id, ?role, "loopback transport created");
        Ok(Arc::new(LoopbackTransport {
            id,
            network: self.clone(),
        }))
    }
}

pub struct LoopbackTransport {
    id: u64,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    fn accept_offer(&self, network: &mut Network, remote: u64) -> Result<(), TransportError> {
        network.endpoint(remote)?.peer = Some(self.id);
        let own = network.endpoint(self.id)?;
        own.peer = Some(remote);
        let answer = serde_json::to_value(LoopbackSignal::Answer { endpoint: self.id })
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        own.events.emit(TransportEvent::Signal(answer));
        Ok(())
    }

    fn accept_answer(&self, network: &mut Network, remote: u64) -> Result<(), TransportError> {
        let responder = network.endpoint(remote)?;
        if responder.peer != Some(self.id) {
            return Err(TransportError::InvalidSignal(format!(
                "answer from endpoint {remote} that never saw our offer"
            )));
        }
        for id in [self.id, remote] {
            let endpoint = network.endpoint(id)?;
            if id == self.id {
                endpoint.peer = Some(remote);
            }
            endpoint.connected = true;
            endpoint.events.emit(TransportEvent::Connect);
        }
        for id in [self.id, remote] {
            let endpoint = network.endpoint(id)?;
            if !endpoint.local.is_empty() {
                endpoint.announce();
            }
        }
        Ok(())
    }

    fn apply_announcement(
        &self,
        network: &mut Network,
        tracks: Vec<AnnouncedTrack>,
    ) -> Result<(), TransportError> {
        let own = network.endpoint(self.id)?;
        let current: HashSet<String> = tracks.iter().map(|t| t.track.id.clone()).collect();
        for announced in tracks {
            if own.remote_streams.insert(announced.stream_id.clone()) {
                own.events.emit(TransportEvent::Stream {
                    stream_id: announced.stream_id.clone(),
                });
            }
            if own.remote_tracks.insert(announced.track.id.clone()) {
                own.events.emit(TransportEvent::Track {
                    track: announced.track,
                    stream_id: announced.stream_id,
                });
            }
        }
        own.remote_tracks.retain(|id| current.contains(id));
        Ok(())
    }

    fn update_local<F>(&self, change: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut Vec<AnnouncedTrack>),
    {
        let mut network = self.network.inner.lock();
        let own = network.endpoint(self.id)?;
        change(&mut own.local);
        if own.connected {
            own.announce();
        }
        Ok(())
    }
}

#[async_trait]
impl TransportPrimitive for LoopbackTransport {
    async fn signal(&self, data: Value) -> Result<(), TransportError> {
        let signal: LoopbackSignal = serde_json::from_value(data)
            .map_err(|err| TransportError::InvalidSignal(err.to_string()))?;
        let mut network = self.network.inner.lock();
        match signal {
            LoopbackSignal::Offer { endpoint } => self.accept_offer(&mut network, endpoint),
            LoopbackSignal::Answer { endpoint } => self.accept_answer(&mut network, endpoint),
            LoopbackSignal::Renegotiate { tracks } => self.apply_announcement(&mut network, tracks),
        }
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let mut network = self.network.inner.lock();
        let own = network.endpoint(self.id)?;
        let peer = match (own.connected, own.peer) {
            (true, Some(peer)) => peer,
            _ => return Err(TransportError::NotConnected),
        };
        let remote = network.endpoint(peer)?;
        remote.events.emit(TransportEvent::Data(payload));
        Ok(())
    }

    async fn add_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
    ) -> Result<(), TransportError> {
        let announced = AnnouncedTrack {
            track: track.clone(),
            stream_id: stream.id.clone(),
        };
        self.update_local(move |local| {
            if !local.iter().any(|t| t.track.id == announced.track.id) {
                local.push(announced);
            }
        })
    }

    async fn remove_track(
        &self,
        track: &MediaTrack,
        _stream: &MediaStream,
    ) -> Result<(), TransportError> {
        let id = track.id.clone();
        self.update_local(move |local| local.retain(|t| t.track.id != id))
    }

    async fn destroy(&self) {
        let mut network = self.network.inner.lock();
        let Some(own) = network.endpoints.remove(&self.id) else {
            return;
        };
        if let Some(peer) = own.peer {
            if let Some(remote) = network.endpoints.get_mut(&peer) {
                if remote.peer == Some(self.id) {
                    remote.peer = None;
                    remote.connected = false;
                    remote.events.emit(TransportEvent::Close);
                }
            }
        }
        own.events.emit(TransportEvent::Close);
        debug!(endpoint = self.id, "loopback transport destroyed");
    }
}
