//! Storage repository traits
//!
//! These traits define the Room Store interface, so the authority and sync
//! layers can run against SQLite, a mock, or a network backend.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Membership, Message, Room, User};

/// User directory operations
pub trait UserRepository {
    /// Insert or refresh a user
    fn save_user(&self, user: &User) -> Result<()>;

    fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Name shown for a user, "Anonymous" when unknown
    fn display_name(&self, id: Uuid) -> Result<String>;
}

/// Room metadata operations
pub trait RoomRepository {
    fn create_room(&self, room: &Room) -> Result<()>;

    fn find_room(&self, id: Uuid) -> Result<Option<Room>>;

    fn find_room_by_invite_code(&self, code: &str) -> Result<Option<Room>>;

    /// Overwrite all mutable room fields
    fn update_room(&self, room: &Room) -> Result<()>;

    /// Remove a room with its memberships and messages
    fn delete_room(&self, id: Uuid) -> Result<()>;

    /// Rooms where the user is active, or pending without a quiet block
    fn list_rooms_for_user(&self, user_id: Uuid) -> Result<Vec<Room>>;

    /// Record the newest message preview
    fn update_room_preview(&self, room_id: Uuid, preview: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Membership record operations
pub trait MembershipRepository {
    /// Insert, or replace the existing record for the same (room, user)
    fn save_membership(&self, membership: &Membership) -> Result<()>;

    fn find_membership(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Membership>>;

    /// Every record for a room, in join order
    fn list_memberships(&self, room_id: Uuid) -> Result<Vec<Membership>>;

    fn list_memberships_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>>;

    /// Hard-delete a record (cancelled invitations only)
    fn remove_membership(&self, room_id: Uuid, user_id: Uuid) -> Result<()>;

    fn set_in_room(&self, room_id: Uuid, user_id: Uuid, in_room: bool) -> Result<()>;

    /// Clear every `in_room` flag held by a user; returns how many were set
    fn reset_in_room(&self, user_id: Uuid) -> Result<usize>;

    fn increment_unread(&self, room_id: Uuid, user_id: Uuid) -> Result<()>;

    /// Zero the unread counter and stamp the access time
    fn reset_unread(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Message operations
pub trait MessageRepository {
    /// Append a message, assigning its server timestamp and sequence
    fn append_message(&self, message: &mut Message) -> Result<()>;

    fn find_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Newest `limit` messages in stream order, optionally only those at or
    /// after `since`. The flag reports whether older messages exist.
    fn latest_messages(
        &self,
        room_id: Uuid,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, bool)>;

    /// Persist tombstone and read-marker changes
    fn update_message(&self, message: &Message) -> Result<()>;

    /// Mark the given messages read by `reader`; returns how many changed
    fn mark_messages_read(&self, reader: Uuid, message_ids: &[Uuid]) -> Result<usize>;
}

/// Block and friend relations
pub trait RelationRepository {
    /// Returns false if the block already existed
    fn block(&self, blocker: Uuid, blocked: Uuid) -> Result<bool>;

    /// Returns false if there was no block
    fn unblock(&self, blocker: Uuid, blocked: Uuid) -> Result<bool>;

    fn is_blocked(&self, blocker: Uuid, blocked: Uuid) -> Result<bool>;

    /// Everyone `blocker` has blocked
    fn blocked_ids(&self, blocker: Uuid) -> Result<BTreeSet<Uuid>>;

    fn add_friend(&self, a: Uuid, b: Uuid) -> Result<()>;

    fn remove_friend(&self, a: Uuid, b: Uuid) -> Result<bool>;

    fn are_friends(&self, a: Uuid, b: Uuid) -> Result<bool>;
}

/// Combined storage interface
///
/// Provides access to all repository operations plus an atomic scope for
/// multi-record transitions.
pub trait Storage:
    UserRepository + RoomRepository + MembershipRepository + MessageRepository + RelationRepository
{
    /// Run `f` so its writes commit together or not at all. Nested calls
    /// join the outer scope.
    fn atomically<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T>;
}
