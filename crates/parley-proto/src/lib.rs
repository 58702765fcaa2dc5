//! Wire envelopes for the Parley relay and the direct peer channel.
//!
//! Everything here is JSON tagged by a `type` field. The relay speaks
//! [`relay`] envelopes with clients; once two peers hold a direct channel
//! they exchange [`peer`] envelopes instead.

pub mod chat;
pub mod peer;
pub mod relay;

pub use chat::{
    Attachment, AttachmentKind, ChatMessage, MessageOrigin, UNKNOWN_AUTHOR, UNREADABLE_CONTENT,
};
pub use peer::PeerMessage;
pub use relay::{
    normalize_join_param, ClientMessage, JoinRefused, RefusalCode, RoomJoined, RoomLeft,
    ServerMessage,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is missing a type tag")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
        }
    }
}

/// Decodes a `type`-tagged envelope, telling unknown tags apart from
/// structurally broken payloads.
pub(crate) fn decode_tagged<T>(bytes: &[u8], known: &[&str]) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let tag = value
        .get("type")
        .and_then(|tag| tag.as_str())
        .ok_or(ProtocolError::MissingType)?;
    if !known.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}
