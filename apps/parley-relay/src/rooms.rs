use std::sync::Arc;

use dashmap::DashMap;
use parley_proto::{normalize_join_param, RefusalCode, RoomJoined, RoomLeft, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub const ROOM_CAPACITY: usize = 2;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// All live rooms, keyed by room name. Each room's join, leave and notice
/// fan-out run under its map entry lock.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
}

#[derive(Default)]
struct Room {
    members: Vec<Participant>,
}

struct Participant {
    id: Uuid,
    name: String,
    is_initiator: bool,
    outbound: Outbound,
}

impl Participant {
    fn notice(&self, room_name: &str) -> RoomJoined {
        RoomJoined {
            room_name: room_name.to_string(),
            name: self.name.clone(),
            is_initiator: self.is_initiator,
        }
    }

    fn deliver(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub participant_id: Uuid,
    pub room_name: String,
    pub name: String,
    pub is_initiator: bool,
    pub room_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub name: String,
    pub remaining: usize,
    pub promoted: Option<String>,
    pub room_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_name: String,
    pub members: Vec<MemberSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub name: String,
    pub is_initiator: bool,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `name` into `room_name` and sends the join notices: every
    /// existing member hears about the newcomer, and the newcomer hears about
    /// every existing member followed by its own self-notice.
    pub fn join(
        &self,
        room_name: &str,
        name: &str,
        outbound: Outbound,
    ) -> Result<Admission, RefusalCode> {
        let room_name = normalize_join_param(room_name);
        let name = normalize_join_param(name);
        if room_name.is_empty() || name.is_empty() {
            return Err(RefusalCode::InvalidParameters);
        }

        let mut room = self.rooms.entry(room_name.to_string()).or_default();
        if room.members.len() >= ROOM_CAPACITY {
            return Err(RefusalCode::RoomFull);
        }
        if room.members.iter().any(|member| member.name == name) {
            return Err(RefusalCode::NameTaken);
        }

        let participant = Participant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_initiator: !room.members.iter().any(|member| member.is_initiator),
            outbound,
        };

        let announcement = participant.notice(room_name);
        for member in &room.members {
            member.deliver(ServerMessage::RoomJoined(announcement.clone()));
        }
        for member in &room.members {
            participant.deliver(ServerMessage::RoomJoined(member.notice(room_name)));
        }
        participant.deliver(ServerMessage::RoomJoined(announcement));

        let admission = Admission {
            participant_id: participant.id,
            room_name: room_name.to_string(),
            name: participant.name.clone(),
            is_initiator: participant.is_initiator,
            room_size: room.members.len() + 1,
        };
        room.members.push(participant);

        debug!(
            room = %admission.room_name,
            name = %admission.name,
            is_initiator = admission.is_initiator,
            "participant admitted"
        );
        Ok(admission)
    }

    /// Removes a participant, tells whoever remains, and hands the initiator
    /// role to the remaining member when the initiator was the one leaving.
    pub fn leave(&self, room_name: &str, participant_id: Uuid) -> Option<Departure> {
        let mut room = self.rooms.get_mut(room_name)?;
        let position = room
            .members
            .iter()
            .position(|member| member.id == participant_id)?;
        let departed = room.members.remove(position);

        let notice = RoomLeft {
            room_name: room_name.to_string(),
            name: departed.name.clone(),
        };
        for member in &room.members {
            member.deliver(ServerMessage::RoomLeft(notice.clone()));
        }

        let mut promoted = None;
        if departed.is_initiator {
            if let Some(heir) = room.members.first_mut() {
                heir.is_initiator = true;
                heir.deliver(ServerMessage::RoomJoined(heir.notice(room_name)));
                promoted = Some(heir.name.clone());
            }
        }

        let remaining = room.members.len();
        drop(room);

        let room_deleted = remaining == 0
            && self
                .rooms
                .remove_if(room_name, |_, room| room.members.is_empty())
                .is_some();

        Some(Departure {
            name: departed.name,
            remaining,
            promoted,
            room_deleted,
        })
    }

    /// Forwards a signal payload verbatim to every other member of the room.
    /// Returns how many members it reached.
    pub fn relay_signal(&self, room_name: &str, from: Uuid, data: &Value) -> usize {
        let Some(room) = self.rooms.get(room_name) else {
            return 0;
        };
        let delivered = room
            .members
            .iter()
            .filter(|member| member.id != from)
            .filter(|member| member.deliver(ServerMessage::PeerSignal { data: data.clone() }))
            .count();
        delivered
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.rooms.iter().map(|room| room.members.len()).sum()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .iter()
            .map(|entry| RoomSnapshot {
                room_name: entry.key().clone(),
                members: entry
                    .members
                    .iter()
                    .map(|member| MemberSnapshot {
                        name: member.name.clone(),
                        is_initiator: member.is_initiator,
                    })
                    .collect(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_name.cmp(&b.room_name));
        rooms
    }
}
