//! Read-State Tracker
//!
//! Per-viewer read state: unread counts on group messages, the unread
//! marker shown on entry, and marking messages read while the viewer is in
//! the room with the page visible.

use std::collections::BTreeSet;
use std::sync::Arc;

use chorus_core::{Message, Storage};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::hub::{RoomEvent, UserEvent};
use crate::service::Shared;

/// Active members who have not yet read a group message. The sender never
/// counts.
pub fn unread_count_for(message: &Message, active_members: &BTreeSet<Uuid>) -> usize {
    active_members
        .iter()
        .filter(|id| **id != message.sender_id && !message.read.is_read_by(**id))
        .count()
}

/// A message from someone else that `viewer` has not read yet
pub fn is_unread_for(message: &Message, viewer: Uuid) -> bool {
    !message.is_system() && message.sender_id != viewer && !message.read.is_read_by(viewer)
}

/// Where the view lands when a room is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPosition {
    /// Show the unread marker above `message_id`
    Marker { message_id: Uuid, count: usize },
    /// Scroll straight to the newest message
    Newest,
}

/// Find the unread marker: the first message from others after
/// `last_access`, shown only when at least `threshold` such messages exist.
pub fn entry_position(
    messages: &[Message],
    viewer: Uuid,
    last_access: Option<DateTime<Utc>>,
    threshold: usize,
) -> EntryPosition {
    let mut qualifying = messages.iter().filter(|m| {
        !m.is_system() && m.sender_id != viewer && last_access.map_or(true, |at| m.created_at > at)
    });
    let Some(first) = qualifying.next() else {
        return EntryPosition::Newest;
    };
    let count = 1 + qualifying.count();
    if count >= threshold.max(1) {
        EntryPosition::Marker {
            message_id: first.id,
            count,
        }
    } else {
        EntryPosition::Newest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadReceipt {
    /// Messages newly marked read
    pub marked: usize,
    /// Room unread counter before it was reset
    pub cleared: u32,
}

/// Mark the loaded messages read, reset the room's unread counter, and
/// stamp the viewer's last access time. Idempotent.
pub fn mark_room_read<S: Storage>(
    store: &S,
    room_id: Uuid,
    viewer: Uuid,
    messages: &[Message],
) -> chorus_core::Result<ReadReceipt> {
    let unread: Vec<Uuid> = messages
        .iter()
        .filter(|m| m.room_id == room_id && is_unread_for(m, viewer))
        .map(|m| m.id)
        .collect();

    store.atomically(|store| {
        let cleared = store
            .find_membership(room_id, viewer)?
            .map_or(0, |m| m.unread_count);
        let marked = if unread.is_empty() {
            0
        } else {
            store.mark_messages_read(viewer, &unread)?
        };
        store.reset_unread(room_id, viewer, Utc::now())?;
        Ok(ReadReceipt { marked, cleared })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRead {
    Applied(ReadReceipt),
    /// Viewer is not in the room or the page is hidden
    Deferred,
}

/// Marks rooms read through the shared store, gated on presence
#[derive(Clone)]
pub struct ReadStateTracker {
    shared: Arc<Shared>,
}

impl ReadStateTracker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    pub async fn mark_read(
        &self,
        room_id: Uuid,
        viewer: Uuid,
        messages: &[Message],
    ) -> Result<MarkRead> {
        if !self.shared.presence.can_mark_read(room_id, viewer) {
            debug!("Mark read deferred");
            return Ok(MarkRead::Deferred);
        }

        let receipt = {
            let db = self.shared.db.lock().await;
            mark_room_read(&*db, room_id, viewer, messages)?
        };

        if receipt.marked > 0 {
            self.shared.hub.publish(room_id, RoomEvent::Messages);
        }
        if receipt.cleared > 0 {
            self.shared.hub.publish_user(viewer, UserEvent::Unread(room_id));
        }
        Ok(MarkRead::Applied(receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{
        ChorusConfig, Database, MembershipAuthority, MembershipRepository, MessageRepository,
        RoomKind, User, UserRepository,
    };

    fn user(db: &Database, name: &str) -> Uuid {
        let user = User::new(name);
        db.save_user(&user).unwrap();
        user.id
    }

    fn text(room: Uuid, sender: Uuid, body: &str) -> Message {
        Message::new(room, RoomKind::Group, sender, body.to_string())
    }

    #[test]
    fn test_marker_boundary_four_vs_five() {
        let viewer = Uuid::new_v4();
        let other = Uuid::new_v4();
        let room = Uuid::new_v4();
        let last_access = Utc::now() - chrono::Duration::hours(1);

        let mut messages = vec![text(room, viewer, "mine")];
        messages[0].created_at = last_access - chrono::Duration::minutes(5);
        for i in 0..4 {
            messages.push(text(room, other, &format!("new {}", i)));
        }
        assert_eq!(
            entry_position(&messages, viewer, Some(last_access), 5),
            EntryPosition::Newest
        );

        messages.push(text(room, other, "fifth"));
        assert_eq!(
            entry_position(&messages, viewer, Some(last_access), 5),
            EntryPosition::Marker {
                message_id: messages[1].id,
                count: 5
            }
        );
    }

    #[test]
    fn test_marker_ignores_own_and_system_messages() {
        let viewer = Uuid::new_v4();
        let room = Uuid::new_v4();
        let mut messages: Vec<Message> = (0..6).map(|i| text(room, viewer, &i.to_string())).collect();
        messages.push(Message::system(
            room,
            RoomKind::Group,
            "someone joined".into(),
            chorus_core::SystemEvent {
                action: chorus_core::SystemAction::InvitationAccepted,
                actor_id: None,
                target_id: None,
            },
        ));
        assert_eq!(entry_position(&messages, viewer, None, 5), EntryPosition::Newest);
    }

    #[test]
    fn test_unread_count_excludes_sender() {
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let active: BTreeSet<Uuid> = [sender, reader, Uuid::new_v4()].into_iter().collect();
        let mut message = text(room, sender, "hi");
        assert_eq!(unread_count_for(&message, &active), 2);
        message.read.mark(reader);
        assert_eq!(unread_count_for(&message, &active), 1);
    }

    #[test]
    fn test_mark_room_read_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let config = ChorusConfig::default();
        let owner = user(&db, "owner");
        let reader = user(&db, "reader");
        let room = MembershipAuthority::new(&db, &config)
            .create_group(owner, "Readers", &[reader], false)
            .unwrap();
        MembershipAuthority::new(&db, &config)
            .accept(reader, room.id, false)
            .unwrap();

        let mut message = text(room.id, owner, "hello");
        db.append_message(&mut message).unwrap();
        db.increment_unread(room.id, reader).unwrap();

        let (loaded, _) = db.latest_messages(room.id, 30, None).unwrap();
        let first = mark_room_read(&db, room.id, reader, &loaded).unwrap();
        assert_eq!(first.marked, 1);
        assert_eq!(first.cleared, 1);

        let (loaded, _) = db.latest_messages(room.id, 30, None).unwrap();
        let second = mark_room_read(&db, room.id, reader, &loaded).unwrap();
        assert_eq!(second, ReadReceipt::default());

        let me = db.find_membership(room.id, reader).unwrap().unwrap();
        assert_eq!(me.unread_count, 0);
        assert!(me.last_access_time.is_some());
        let stored = db.find_message(message.id).unwrap().unwrap();
        assert!(stored.read.is_read_by(reader));
    }
}
