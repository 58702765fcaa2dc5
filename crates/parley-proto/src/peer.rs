use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{decode_tagged, ProtocolError};

/// Envelopes multiplexed over the direct data channel once two peers are
/// connected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A renegotiation payload that would otherwise have gone through the relay.
    Signal { data: Value },
    /// `message` is the base64 ciphertext of a serialized [`crate::ChatMessage`].
    TextMessage { author: String, message: String },
    CryptoKey {
        name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    RemoteAudioRemoved,
    RemoteVideoRemoved,
}

impl PeerMessage {
    const TAGS: &'static [&'static str] = &[
        "signal",
        "text_message",
        "crypto_key",
        "remote_audio_removed",
        "remote_video_removed",
    ];

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_tagged(bytes, Self::TAGS)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Signal { .. } => "signal",
            PeerMessage::TextMessage { .. } => "text_message",
            PeerMessage::CryptoKey { .. } => "crypto_key",
            PeerMessage::RemoteAudioRemoved => "remote_audio_removed",
            PeerMessage::RemoteVideoRemoved => "remote_video_removed",
        }
    }
}
