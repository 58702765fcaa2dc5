use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{decode_tagged, ProtocolError};

/// The form of a display name or room name the relay admits and echoes back
/// in notices. Clients compare notices against this form.
pub fn normalize_join_param(value: &str) -> &str {
    value.trim()
}

/// Messages a client may send to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Only needed when the join parameters were not passed in the query string.
    RoomJoin {
        #[serde(rename = "roomName")]
        room_name: String,
        name: String,
    },
    PeerSignal {
        data: Value,
    },
}

impl ClientMessage {
    const TAGS: &'static [&'static str] = &["roomJoin", "peerSignal"];

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_tagged(bytes, Self::TAGS)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub room_name: String,
    pub name: String,
    pub is_initiator: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeft {
    pub room_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRefused {
    pub code: RefusalCode,
    pub reason: String,
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    RoomJoined(RoomJoined),
    RoomLeft(RoomLeft),
    PeerSignal { data: Value },
    JoinRefused(JoinRefused),
}

impl ServerMessage {
    const TAGS: &'static [&'static str] = &["roomJoined", "roomLeft", "peerSignal", "joinRefused"];

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_tagged(bytes, Self::TAGS)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why the relay turned a join away. Each reason maps onto a close code in
/// the private 4000-4999 range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefusalCode {
    InvalidParameters,
    RoomFull,
    NameTaken,
}

impl RefusalCode {
    pub fn close_code(self) -> u16 {
        match self {
            RefusalCode::InvalidParameters => 4000,
            RefusalCode::RoomFull => 4001,
            RefusalCode::NameTaken => 4002,
        }
    }

    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(RefusalCode::InvalidParameters),
            4001 => Some(RefusalCode::RoomFull),
            4002 => Some(RefusalCode::NameTaken),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RefusalCode::InvalidParameters => "invalid_parameters",
            RefusalCode::RoomFull => "room_full",
            RefusalCode::NameTaken => "name_taken",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            RefusalCode::InvalidParameters => "both name and roomName are required",
            RefusalCode::RoomFull => "room already has two members",
            RefusalCode::NameTaken => "another member of the room uses this name",
        }
    }
}

impl std::fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
