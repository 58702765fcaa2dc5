//! Direct peer transports.
//!
//! A [`TransportPrimitive`] is one negotiation attempt between two peers. It
//! reports progress through the [`TransportEvents`] sink it was created with;
//! every event carries the generation of the transport that produced it so
//! the session can discard stragglers from a torn-down attempt.

pub mod loopback;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaStream, MediaTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport not connected")]
    NotConnected,
    #[error("transport already closed")]
    Closed,
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An opaque negotiation payload that must reach the peer's transport.
    Signal(Value),
    Connect,
    Close,
    Error(String),
    Stream { stream_id: String },
    Track { track: MediaTrack, stream_id: String },
    Data(Bytes),
}

type Sink = Arc<dyn Fn(u64, TransportEvent) + Send + Sync>;

/// Generation-tagged event sink handed to a transport on creation.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    sink: Sink,
}

impl TransportEvents {
    pub fn new<F>(generation: u64, sink: F) -> Self
    where
        F: Fn(u64, TransportEvent) + Send + Sync + 'static,
    {
        Self {
            generation,
            sink: Arc::new(sink),
        }
    }

    /// Sink that forwards into a channel, for driving a transport by hand.
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self::new(generation, move |_, event| {
            let _ = tx.send(event);
        });
        (events, rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(self.generation, event);
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
pub trait TransportPrimitive: Send + Sync {
    /// Applies a negotiation payload produced by the peer's transport.
    async fn signal(&self, data: Value) -> Result<(), TransportError>;

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream)
        -> Result<(), TransportError>;

    async fn remove_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
    ) -> Result<(), TransportError>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            self.add_track(track, stream).await?;
        }
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            self.remove_track(track, stream).await?;
        }
        Ok(())
    }

    async fn destroy(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportPrimitive>, TransportError>;
}
