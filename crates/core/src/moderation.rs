//! Moderation Engine
//!
//! Message deletion, per-viewer muting, and global blocking, plus the
//! per-viewer rendering filter those relations produce.
//!
//! Blocking in groups is one-sided: the blocker's own view labels the
//! blocked user's messages, but nothing stops the blocked user's messages
//! from reaching everyone else. Hiding the block from the blocked user
//! while also suppressing delivery would need a trusted mediator that can
//! read private block lists, so the asymmetry is kept as is.

use std::collections::BTreeSet;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Message, Room, RoomKind};
use crate::permissions::{authorize, AuthContext, RoomAction};
use crate::storage::Storage;

pub const TOMBSTONE_OWN: &str = "You deleted this message.";
pub const MUTED_PLACEHOLDER: &str = "Message from a muted member.";
pub const BLOCKED_PLACEHOLDER: &str = "Message from a blocked user.";

/// What a viewer sees in place of a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayBody {
    Text(String),
    System(String),
    Tombstone(String),
    Muted,
    Blocked,
}

impl DisplayBody {
    pub fn text(&self) -> &str {
        match self {
            DisplayBody::Text(s) | DisplayBody::System(s) | DisplayBody::Tombstone(s) => s,
            DisplayBody::Muted => MUTED_PLACEHOLDER,
            DisplayBody::Blocked => BLOCKED_PLACEHOLDER,
        }
    }
}

/// The viewer-scoped relations that change how a room's messages render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerFilter {
    pub viewer: Uuid,
    pub room_kind: RoomKind,
    /// Senders muted in this room
    pub muted: BTreeSet<Uuid>,
    /// Users the viewer has blocked anywhere
    pub blocked: BTreeSet<Uuid>,
}

impl ViewerFilter {
    pub fn new(viewer: Uuid, room_kind: RoomKind) -> Self {
        Self {
            viewer,
            room_kind,
            muted: BTreeSet::new(),
            blocked: BTreeSet::new(),
        }
    }

    /// In a DM, a blocked user's messages are dropped from the blocker's
    /// stream entirely. Groups keep them and label them instead.
    pub fn visible(&self, message: &Message) -> bool {
        !(self.room_kind == RoomKind::Dm && self.blocked.contains(&message.sender_id))
    }

    pub fn display_body(&self, message: &Message) -> DisplayBody {
        if message.is_system() {
            return DisplayBody::System(message.body.clone());
        }
        if message.deleted {
            let text = match (&message.deleted_by, &message.deleted_by_name) {
                (Some(by), _) if *by == self.viewer => TOMBSTONE_OWN.to_string(),
                (_, Some(name)) => format!("This message was deleted by {}.", name),
                _ => "This message was deleted.".to_string(),
            };
            return DisplayBody::Tombstone(text);
        }
        if message.sender_id != self.viewer {
            if self.blocked.contains(&message.sender_id) {
                return DisplayBody::Blocked;
            }
            if self.muted.contains(&message.sender_id) {
                return DisplayBody::Muted;
            }
        }
        DisplayBody::Text(message.body.clone())
    }

    /// Whether this viewer should ever be alerted about the message
    pub fn suppresses(&self, message: &Message) -> bool {
        self.blocked.contains(&message.sender_id) || self.muted.contains(&message.sender_id)
    }
}

pub struct ModerationEngine<'a, S: Storage> {
    store: &'a S,
}

impl<'a, S: Storage> ModerationEngine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    fn room(&self, room_id: Uuid) -> Result<Room> {
        self.store
            .find_room(room_id)?
            .ok_or_else(|| Error::not_found(format!("room {}", room_id)))
    }

    /// Whether `actor` may delete `message`
    pub fn can_delete(&self, actor: Uuid, message: &Message) -> Result<bool> {
        if message.is_system() {
            return Ok(false);
        }
        let room = self.room(message.room_id)?;
        let Some(me) = self.store.find_membership(room.id, actor)? else {
            return Ok(false);
        };
        let sender = self.store.find_membership(room.id, message.sender_id)?;
        let mut ctx = AuthContext::new(&room).with_message_sender(message.sender_id);
        if let Some(sender) = &sender {
            ctx = ctx.with_target(sender);
        }
        Ok(authorize(&me, RoomAction::DeleteMessage, &ctx).is_allowed())
    }

    /// Tombstone a message. Permanent; deleting a deleted message is a no-op.
    #[instrument(skip(self))]
    pub fn delete_message(&self, actor: Uuid, message_id: Uuid) -> Result<Message> {
        let mut message = self
            .store
            .find_message(message_id)?
            .ok_or_else(|| Error::not_found(format!("message {}", message_id)))?;
        if message.deleted {
            return Ok(message);
        }
        if message.is_system() {
            return Err(Error::invalid("system messages cannot be deleted"));
        }
        if !self.can_delete(actor, &message)? {
            return Err(Error::denied("you cannot delete this message"));
        }

        message.deleted = true;
        message.body.clear();
        message.deleted_by = Some(actor);
        message.deleted_by_name = Some(self.store.display_name(actor)?);
        self.store.update_message(&message)?;

        info!(room_id = %message.room_id, "Message deleted");
        Ok(message)
    }

    fn set_muted(&self, viewer: Uuid, room_id: Uuid, target: Uuid, muted: bool) -> Result<bool> {
        if viewer == target {
            return Err(Error::invalid("you cannot mute yourself"));
        }
        let room = self.room(room_id)?;
        if !room.is_group() {
            return Err(Error::invalid("muting is only available in group rooms"));
        }
        let mut me = match self.store.find_membership(room_id, viewer)? {
            Some(m) if m.is_active() => m,
            _ => return Err(Error::denied("you are not a member of this room")),
        };

        let changed = if muted {
            me.muted_users.insert(target)
        } else {
            me.muted_users.remove(&target)
        };
        if changed {
            self.store.save_membership(&me)?;
        }
        Ok(changed)
    }

    /// Hide `target`'s messages from `viewer` in this room only
    #[instrument(skip(self))]
    pub fn mute_user(&self, viewer: Uuid, room_id: Uuid, target: Uuid) -> Result<bool> {
        self.set_muted(viewer, room_id, target, true)
    }

    #[instrument(skip(self))]
    pub fn unmute_user(&self, viewer: Uuid, room_id: Uuid, target: Uuid) -> Result<bool> {
        self.set_muted(viewer, room_id, target, false)
    }

    /// Block `target` everywhere; also ends any friendship
    #[instrument(skip(self))]
    pub fn block_user(&self, actor: Uuid, target: Uuid) -> Result<bool> {
        if actor == target {
            return Err(Error::invalid("you cannot block yourself"));
        }
        let added = self.store.atomically(|store| {
            store.remove_friend(actor, target)?;
            store.block(actor, target)
        })?;
        if added {
            info!(target = %target, "User blocked");
        }
        Ok(added)
    }

    #[instrument(skip(self))]
    pub fn unblock_user(&self, actor: Uuid, target: Uuid) -> Result<bool> {
        let removed = self.store.unblock(actor, target)?;
        if removed {
            info!(target = %target, "User unblocked");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub fn add_friend(&self, actor: Uuid, target: Uuid) -> Result<()> {
        if actor == target {
            return Err(Error::invalid("you cannot befriend yourself"));
        }
        if self.store.is_blocked(actor, target)? {
            return Err(Error::BlockedByYou {
                names: vec![self.store.display_name(target)?],
            });
        }
        self.store.add_friend(actor, target)
    }

    /// Build the rendering filter for `viewer` in a room
    pub fn viewer_filter(&self, viewer: Uuid, room_id: Uuid) -> Result<ViewerFilter> {
        let room = self.room(room_id)?;
        let mut filter = ViewerFilter::new(viewer, room.kind);
        if let Some(me) = self.store.find_membership(room_id, viewer)? {
            filter.muted = me.muted_users;
        }
        filter.blocked = self.store.blocked_ids(viewer)?;
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChorusConfig;
    use crate::authority::MembershipAuthority;
    use crate::models::{Permission, User};
    use crate::storage::{Database, MessageRepository, RelationRepository, UserRepository};

    fn user(db: &Database, name: &str) -> Uuid {
        let user = User::new(name);
        db.save_user(&user).unwrap();
        user.id
    }

    fn post(db: &Database, room: &Room, sender: Uuid, body: &str) -> Message {
        let mut message = Message::new(room.id, room.kind, sender, body.to_string());
        db.append_message(&mut message).unwrap();
        message
    }

    struct Group {
        db: Database,
        room: Room,
        owner: Uuid,
        sub: Uuid,
        member: Uuid,
    }

    fn group(sub_permissions: &[Permission]) -> Group {
        let db = Database::open_in_memory().unwrap();
        let config = ChorusConfig::default();
        let owner = user(&db, "owner");
        let sub = user(&db, "sub");
        let member = user(&db, "member");
        let room = {
            let auth = MembershipAuthority::new(&db, &config);
            let room = auth.create_group(owner, "Mods", &[sub, member], false).unwrap();
            auth.accept(sub, room.id, false).unwrap();
            auth.accept(member, room.id, false).unwrap();
            auth.appoint_sub_manager(owner, room.id, sub, sub_permissions.iter().copied().collect())
                .unwrap();
            room
        };
        Group {
            db,
            room,
            owner,
            sub,
            member,
        }
    }

    #[test]
    fn test_delete_rules_and_tombstones() {
        let g = group(&[Permission::ManageMessages]);
        let engine = ModerationEngine::new(&g.db);
        let from_member = post(&g.db, &g.room, g.member, "spam");
        let from_owner = post(&g.db, &g.room, g.owner, "announcement");

        assert!(!engine.can_delete(g.sub, &from_owner).unwrap());
        assert!(matches!(
            engine.delete_message(g.sub, from_owner.id),
            Err(Error::AuthorizationDenied(_))
        ));

        let deleted = engine.delete_message(g.sub, from_member.id).unwrap();
        assert!(deleted.deleted);
        assert!(deleted.body.is_empty());
        assert_eq!(deleted.deleted_by_name.as_deref(), Some("sub"));

        let for_sub = ViewerFilter::new(g.sub, RoomKind::Group);
        let for_member = ViewerFilter::new(g.member, RoomKind::Group);
        assert_eq!(for_sub.display_body(&deleted).text(), TOMBSTONE_OWN);
        assert_eq!(
            for_member.display_body(&deleted).text(),
            "This message was deleted by sub."
        );

        // Second delete is a no-op
        let again = engine.delete_message(g.owner, from_member.id).unwrap();
        assert_eq!(again.deleted_by, Some(g.sub));
    }

    #[test]
    fn test_system_messages_cannot_be_deleted() {
        let g = group(&[]);
        let engine = ModerationEngine::new(&g.db);
        let (messages, _) = g.db.latest_messages(g.room.id, 1, None).unwrap();
        assert!(messages[0].is_system());
        assert!(matches!(
            engine.delete_message(g.owner, messages[0].id),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_mute_is_viewer_scoped() {
        let g = group(&[]);
        let engine = ModerationEngine::new(&g.db);
        let message = post(&g.db, &g.room, g.member, "hello");

        assert!(engine.mute_user(g.owner, g.room.id, g.member).unwrap());
        assert!(!engine.mute_user(g.owner, g.room.id, g.member).unwrap());

        let owner_view = engine.viewer_filter(g.owner, g.room.id).unwrap();
        let sub_view = engine.viewer_filter(g.sub, g.room.id).unwrap();
        assert_eq!(owner_view.display_body(&message), DisplayBody::Muted);
        assert_eq!(sub_view.display_body(&message).text(), "hello");

        assert!(engine.unmute_user(g.owner, g.room.id, g.member).unwrap());
        let owner_view = engine.viewer_filter(g.owner, g.room.id).unwrap();
        assert_eq!(owner_view.display_body(&message).text(), "hello");
    }

    #[test]
    fn test_mute_rejected_in_dm() {
        let db = Database::open_in_memory().unwrap();
        let config = ChorusConfig::default();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let room = MembershipAuthority::new(&db, &config).open_dm(a, b).unwrap();
        assert!(ModerationEngine::new(&db).mute_user(a, room.id, b).is_err());
    }

    #[test]
    fn test_block_removes_friendship_and_labels_group_messages() {
        let g = group(&[]);
        let engine = ModerationEngine::new(&g.db);
        engine.add_friend(g.owner, g.member).unwrap();
        assert!(g.db.are_friends(g.owner, g.member).unwrap());

        assert!(engine.block_user(g.owner, g.member).unwrap());
        assert!(!g.db.are_friends(g.owner, g.member).unwrap());

        let message = post(&g.db, &g.room, g.member, "hi all");
        let owner_view = engine.viewer_filter(g.owner, g.room.id).unwrap();
        assert!(owner_view.visible(&message));
        assert_eq!(owner_view.display_body(&message).text(), BLOCKED_PLACEHOLDER);

        // The blocked user and everyone else still see the text
        let member_view = engine.viewer_filter(g.member, g.room.id).unwrap();
        let sub_view = engine.viewer_filter(g.sub, g.room.id).unwrap();
        assert_eq!(member_view.display_body(&message).text(), "hi all");
        assert_eq!(sub_view.display_body(&message).text(), "hi all");

        assert!(matches!(
            engine.add_friend(g.owner, g.member),
            Err(Error::BlockedByYou { .. })
        ));
        assert!(engine.unblock_user(g.owner, g.member).unwrap());
        assert!(!engine.unblock_user(g.owner, g.member).unwrap());
    }

    #[test]
    fn test_dm_block_hides_messages() {
        let mut filter = ViewerFilter::new(Uuid::new_v4(), RoomKind::Dm);
        let other = Uuid::new_v4();
        filter.blocked.insert(other);
        let room = Uuid::new_v4();
        let theirs = Message::new(room, RoomKind::Dm, other, "hello".into());
        let mine = Message::new(room, RoomKind::Dm, filter.viewer, "hey".into());
        assert!(!filter.visible(&theirs));
        assert!(filter.visible(&mine));
    }
}
