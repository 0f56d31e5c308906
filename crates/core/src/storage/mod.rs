//! SQLite storage layer for Chorus
//!
//! `Database` is the Room Store: each `*Store` borrows the connection for
//! one table family, and the repository traits expose them to the rest of
//! the crate.

mod memberships;
mod messages;
mod migrations;
mod parse;
mod preferences;
mod relations;
mod rooms;
mod traits;
mod users;

use std::cell::Cell;
use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Membership, Message, Room, User};

pub use memberships::MembershipStore;
pub use messages::MessageStore;
pub use preferences::{KeyValueStore, PreferencesStore, RoomPreferences};
pub use relations::RelationStore;
pub use rooms::RoomStore;
pub use traits::{
    MembershipRepository, MessageRepository, RelationRepository, RoomRepository, Storage,
    UserRepository,
};
pub use users::UserStore;

/// Main database handle
pub struct Database {
    conn: Connection,
    in_transaction: Cell<bool>,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            in_transaction: Cell::new(false),
        })
    }

    /// Current schema version
    pub fn schema_version(&self) -> u32 {
        migrations::current_version(&self.conn).unwrap_or(0)
    }

    pub fn users(&self) -> UserStore<'_> {
        UserStore::new(&self.conn)
    }

    pub fn rooms(&self) -> RoomStore<'_> {
        RoomStore::new(&self.conn)
    }

    pub fn memberships(&self) -> MembershipStore<'_> {
        MembershipStore::new(&self.conn)
    }

    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.conn)
    }

    pub fn relations(&self) -> RelationStore<'_> {
        RelationStore::new(&self.conn)
    }

    /// Device-local preferences
    pub fn preferences(&self) -> PreferencesStore<'_> {
        PreferencesStore::new(&self.conn)
    }
}

// Implement repository traits for Database
// This enables using Database through the trait interface

impl UserRepository for Database {
    fn save_user(&self, user: &User) -> Result<()> {
        self.users().save(user)
    }

    fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        self.users().find_by_id(id)
    }

    fn display_name(&self, id: Uuid) -> Result<String> {
        self.users().display_name(id)
    }
}

impl RoomRepository for Database {
    fn create_room(&self, room: &Room) -> Result<()> {
        self.rooms().create(room)
    }

    fn find_room(&self, id: Uuid) -> Result<Option<Room>> {
        self.rooms().find_by_id(id)
    }

    fn find_room_by_invite_code(&self, code: &str) -> Result<Option<Room>> {
        self.rooms().find_by_invite_code(code)
    }

    fn update_room(&self, room: &Room) -> Result<()> {
        self.rooms().update(room)
    }

    fn delete_room(&self, id: Uuid) -> Result<()> {
        self.rooms().delete(id)
    }

    fn list_rooms_for_user(&self, user_id: Uuid) -> Result<Vec<Room>> {
        self.rooms().list_for_user(user_id)
    }

    fn update_room_preview(&self, room_id: Uuid, preview: &str, at: DateTime<Utc>) -> Result<()> {
        self.rooms().update_preview(room_id, preview, at)
    }
}

impl MembershipRepository for Database {
    fn save_membership(&self, membership: &Membership) -> Result<()> {
        self.memberships().save(membership)
    }

    fn find_membership(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        self.memberships().find(room_id, user_id)
    }

    fn list_memberships(&self, room_id: Uuid) -> Result<Vec<Membership>> {
        self.memberships().list_for_room(room_id)
    }

    fn list_memberships_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>> {
        self.memberships().list_for_user(user_id)
    }

    fn remove_membership(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        self.memberships().remove(room_id, user_id)
    }

    fn set_in_room(&self, room_id: Uuid, user_id: Uuid, in_room: bool) -> Result<()> {
        self.memberships().set_in_room(room_id, user_id, in_room)
    }

    fn reset_in_room(&self, user_id: Uuid) -> Result<usize> {
        self.memberships().reset_in_room(user_id)
    }

    fn increment_unread(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        self.memberships().increment_unread(room_id, user_id)
    }

    fn reset_unread(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.memberships().reset_unread(room_id, user_id, at)
    }
}

impl MessageRepository for Database {
    fn append_message(&self, message: &mut Message) -> Result<()> {
        self.messages().append(message)
    }

    fn find_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.messages().find_by_id(id)
    }

    fn latest_messages(
        &self,
        room_id: Uuid,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, bool)> {
        self.messages().latest(room_id, limit, since)
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        self.messages().update(message)
    }

    fn mark_messages_read(&self, reader: Uuid, message_ids: &[Uuid]) -> Result<usize> {
        self.messages().mark_read(reader, message_ids)
    }
}

impl RelationRepository for Database {
    fn block(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        self.relations().block(blocker, blocked)
    }

    fn unblock(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        self.relations().unblock(blocker, blocked)
    }

    fn is_blocked(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        self.relations().is_blocked(blocker, blocked)
    }

    fn blocked_ids(&self, blocker: Uuid) -> Result<BTreeSet<Uuid>> {
        self.relations().blocked_ids(blocker)
    }

    fn add_friend(&self, a: Uuid, b: Uuid) -> Result<()> {
        self.relations().add_friend(a, b)
    }

    fn remove_friend(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.relations().remove_friend(a, b)
    }

    fn are_friends(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.relations().are_friends(a, b)
    }
}

impl Storage for Database {
    fn atomically<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if self.in_transaction.get() {
            return f(self);
        }

        let tx = self.conn.unchecked_transaction()?;
        self.in_transaction.set(true);
        let outcome = f(self);
        self.in_transaction.set(false);

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Rolling back transaction");
                // Dropping the transaction rolls it back
                drop(tx);
                Err(e)
            }
        }
    }
}
