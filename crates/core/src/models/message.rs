//! Message model for room chat

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RoomKind;

/// Sender id used for store-generated system messages
pub const SYSTEM_SENDER: Uuid = Uuid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// Read state: a single flag in DMs, a reader set in groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadMarker {
    Direct { read: bool },
    Group { read_by: BTreeSet<Uuid> },
}

impl ReadMarker {
    pub fn for_room(kind: RoomKind) -> Self {
        match kind {
            RoomKind::Dm => ReadMarker::Direct { read: false },
            RoomKind::Group => ReadMarker::Group {
                read_by: BTreeSet::new(),
            },
        }
    }

    /// Record `reader` as having read the message. Returns true if anything changed.
    pub fn mark(&mut self, reader: Uuid) -> bool {
        match self {
            ReadMarker::Direct { read } => !std::mem::replace(read, true),
            ReadMarker::Group { read_by } => read_by.insert(reader),
        }
    }

    pub fn is_read_by(&self, reader: Uuid) -> bool {
        match self {
            ReadMarker::Direct { read } => *read,
            ReadMarker::Group { read_by } => read_by.contains(&reader),
        }
    }
}

/// Membership and settings events recorded in the room's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    GroupCreated,
    MemberInvited,
    InvitationAccepted,
    JoinedByInviteCode,
    MemberLeft,
    MemberKicked,
    OwnershipTransferred,
    SubManagerAppointed,
    SubManagerRemoved,
    RoomTypeChanged,
    RoomRenamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub action: SystemAction,
    pub actor_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
}

/// A message in a room. Never physically removed; deletion tombstones it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub body: String,
    /// Server-assigned, strictly increasing within a room
    pub created_at: DateTime<Utc>,
    /// Server-assigned position within the room
    pub sequence: i64,
    pub deleted: bool,
    pub deleted_by: Option<Uuid>,
    pub deleted_by_name: Option<String>,
    pub read: ReadMarker,
    pub system: Option<SystemEvent>,
}

impl Message {
    pub fn new(room_id: Uuid, room_kind: RoomKind, sender_id: Uuid, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            kind: MessageKind::Text,
            body,
            created_at: Utc::now(),
            sequence: 0,
            deleted: false,
            deleted_by: None,
            deleted_by_name: None,
            read: ReadMarker::for_room(room_kind),
            system: None,
        }
    }

    pub fn system(room_id: Uuid, room_kind: RoomKind, body: String, event: SystemEvent) -> Self {
        let mut message = Self::new(room_id, room_kind, SYSTEM_SENDER, body);
        message.kind = MessageKind::System;
        message.system = Some(event);
        message
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }

    /// Total order within a room: timestamp, then id
    pub fn stream_order(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_marker_is_a_set() {
        let reader = Uuid::new_v4();
        let mut marker = ReadMarker::for_room(RoomKind::Group);
        assert!(marker.mark(reader));
        assert!(!marker.mark(reader));
        assert_eq!(
            marker,
            ReadMarker::Group {
                read_by: [reader].into_iter().collect()
            }
        );
    }

    #[test]
    fn test_direct_marker_flips_once() {
        let mut marker = ReadMarker::for_room(RoomKind::Dm);
        assert!(!marker.is_read_by(Uuid::new_v4()));
        assert!(marker.mark(Uuid::new_v4()));
        assert!(!marker.mark(Uuid::new_v4()));
        assert!(marker.is_read_by(Uuid::new_v4()));
    }

    #[test]
    fn test_ties_break_on_id() {
        let room = Uuid::new_v4();
        let mut a = Message::new(room, RoomKind::Group, Uuid::new_v4(), "a".into());
        let mut b = Message::new(room, RoomKind::Group, Uuid::new_v4(), "b".into());
        b.created_at = a.created_at;
        a.id = Uuid::from_u128(1);
        b.id = Uuid::from_u128(2);
        assert_eq!(a.stream_order(&b), Ordering::Less);
    }
}
