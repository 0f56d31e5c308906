//! Turn a message snapshot into display rows for one viewer

use std::collections::BTreeSet;

use chorus_core::{DisplayBody, MemberInfo, MembershipStatus, ReadMarker, RoomKind};
use chrono::NaiveDate;
use uuid::Uuid;

use crate::engine::MessageSnapshot;
use crate::read_state::{unread_count_for, EntryPosition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub body: DisplayBody,
    pub is_own: bool,
    /// Draw the "older messages" boundary above this row
    pub divider_before: bool,
    /// Draw the unread marker above this row
    pub unread_marker: bool,
    /// First row of a new calendar day
    pub date_separator: Option<NaiveDate>,
    /// Group rooms: members who have not read it yet
    pub unread_count: Option<usize>,
    /// DM rooms: the other side has read it
    pub read: Option<bool>,
}

impl RenderedMessage {
    pub fn text(&self) -> &str {
        self.body.text()
    }
}

/// Render every visible message in `snapshot`. `members` feeds the group
/// unread counts; `entry` places the unread marker.
pub fn render(
    snapshot: &MessageSnapshot,
    members: &[MemberInfo],
    entry: EntryPosition,
) -> Vec<RenderedMessage> {
    let viewer = snapshot.filter.viewer;
    let active: BTreeSet<Uuid> = members
        .iter()
        .filter(|m| m.status == MembershipStatus::Active)
        .map(|m| m.user_id)
        .collect();
    let dividers: BTreeSet<Uuid> = snapshot.dividers.iter().copied().collect();
    let marker = match entry {
        EntryPosition::Marker { message_id, .. } => Some(message_id),
        EntryPosition::Newest => None,
    };

    let mut last_day = None;
    snapshot
        .messages
        .iter()
        .map(|message| {
            let day = message.created_at.date_naive();
            let date_separator = (last_day != Some(day)).then_some(day);
            last_day = Some(day);

            let (unread_count, read) = match (&message.read, snapshot.filter.room_kind) {
                _ if message.is_system() => (None, None),
                (ReadMarker::Group { .. }, RoomKind::Group) => {
                    (Some(unread_count_for(message, &active)), None)
                }
                (read_marker, _) => (None, Some(read_marker.is_read_by(viewer))),
            };

            RenderedMessage {
                message_id: message.id,
                sender_id: message.sender_id,
                body: snapshot.filter.display_body(message),
                is_own: message.sender_id == viewer,
                divider_before: dividers.contains(&message.id),
                unread_marker: marker == Some(message.id),
                date_separator,
                unread_count,
                read,
            }
        })
        .collect()
}
