//! Room storage operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{
    format_datetime, parse_datetime, parse_datetime_opt, parse_json, parse_named, parse_uuid,
    to_json, OptionalExt,
};
use crate::error::Result;
use crate::models::{Room, RoomKind};

const ROOM_COLUMNS: &str = "r.id, r.kind, r.name, r.owner_id, r.image_ref, r.is_public, \
     r.invite_code, r.settings_json, r.created_at, r.updated_at, r.last_message, r.last_message_at";

pub struct RoomStore<'a> {
    conn: &'a Connection,
}

impl<'a> RoomStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Room> {
        Ok(Room {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            kind: parse_named(&row.get::<_, String>(1)?, RoomKind::parse)?,
            name: row.get(2)?,
            owner_id: parse_uuid(&row.get::<_, String>(3)?)?,
            image_ref: row.get(4)?,
            is_public: row.get(5)?,
            invite_code: row.get(6)?,
            settings: parse_json(&row.get::<_, String>(7)?)?,
            created_at: parse_datetime(&row.get::<_, String>(8)?)?,
            updated_at: parse_datetime(&row.get::<_, String>(9)?)?,
            last_message: row.get(10)?,
            last_message_at: parse_datetime_opt(row.get(11)?)?,
        })
    }

    fn query_one(&self, filter: &str, param: String) -> Result<Option<Room>> {
        let sql = format!("SELECT {} FROM rooms r WHERE {}", ROOM_COLUMNS, filter);
        let room = self
            .conn
            .query_row(&sql, params![param], Self::from_row)
            .optional()?;
        Ok(room)
    }

    #[instrument(skip(self, room), fields(room_id = %room.id, kind = room.kind.as_str()))]
    pub fn create(&self, room: &Room) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rooms (id, kind, name, owner_id, image_ref, is_public, invite_code,
                                settings_json, created_at, updated_at, last_message, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                room.id.to_string(),
                room.kind.as_str(),
                room.name,
                room.owner_id.to_string(),
                room.image_ref,
                room.is_public,
                room.invite_code,
                to_json(&room.settings)?,
                format_datetime(&room.created_at),
                format_datetime(&room.updated_at),
                room.last_message,
                room.last_message_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Room>> {
        self.query_one("r.id = ?1", id.to_string())
    }

    pub fn find_by_invite_code(&self, code: &str) -> Result<Option<Room>> {
        self.query_one("r.invite_code = ?1", code.to_string())
    }

    #[instrument(skip(self, room), fields(room_id = %room.id))]
    pub fn update(&self, room: &Room) -> Result<()> {
        self.conn.execute(
            "UPDATE rooms SET name = ?2, owner_id = ?3, image_ref = ?4, is_public = ?5,
                              invite_code = ?6, settings_json = ?7, updated_at = ?8,
                              last_message = ?9, last_message_at = ?10
             WHERE id = ?1",
            params![
                room.id.to_string(),
                room.name,
                room.owner_id.to_string(),
                room.image_ref,
                room.is_public,
                room.invite_code,
                to_json(&room.settings)?,
                format_datetime(&room.updated_at),
                room.last_message,
                room.last_message_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    /// Memberships and messages go with the room via ON DELETE CASCADE
    #[instrument(skip(self))]
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM rooms WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Room>> {
        let sql = format!(
            "SELECT {} FROM rooms r
             INNER JOIN memberships m ON m.room_id = r.id
             WHERE m.user_id = ?1
               AND (m.status = 'active' OR (m.status = 'pending' AND m.blocked_invite = 0))
             ORDER BY COALESCE(r.last_message_at, r.created_at) DESC",
            ROOM_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rooms = stmt
            .query_map(params![user_id.to_string()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    pub fn update_preview(&self, room_id: Uuid, preview: &str, at: DateTime<Utc>) -> Result<()> {
        let stamp = format_datetime(&at);
        self.conn.execute(
            "UPDATE rooms SET last_message = ?2, last_message_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![room_id.to_string(), preview, stamp],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Membership, RoomRole};
    use crate::storage::Database;

    #[test]
    fn test_create_and_find_by_code() {
        let db = Database::open_in_memory().unwrap();
        let room = Room::new_group("Hikers", Uuid::new_v4(), true);
        db.rooms().create(&room).unwrap();

        let code = room.invite_code.clone().unwrap();
        let found = db.rooms().find_by_invite_code(&code).unwrap().unwrap();
        assert_eq!(found.id, room.id);
        assert_eq!(found.settings, room.settings);
        assert!(found.is_public);
    }

    #[test]
    fn test_delete_cascades_memberships() {
        let db = Database::open_in_memory().unwrap();
        let owner = Uuid::new_v4();
        let room = Room::new_group("Temp", owner, false);
        db.rooms().create(&room).unwrap();
        db.memberships()
            .save(&Membership::active(room.id, owner, RoomRole::Owner))
            .unwrap();

        db.rooms().delete(room.id).unwrap();
        assert!(db.rooms().find_by_id(room.id).unwrap().is_none());
        assert!(db.memberships().list_for_room(room.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_hides_quiet_invites() {
        let db = Database::open_in_memory().unwrap();
        let owner = Uuid::new_v4();
        let invitee = Uuid::new_v4();
        let visible = Room::new_group("Visible", owner, false);
        let hidden = Room::new_group("Hidden", owner, false);
        db.rooms().create(&visible).unwrap();
        db.rooms().create(&hidden).unwrap();

        db.memberships()
            .save(&Membership::pending(visible.id, invitee, owner))
            .unwrap();
        let mut quiet = Membership::pending(hidden.id, invitee, owner);
        quiet.blocked_invite = true;
        db.memberships().save(&quiet).unwrap();

        let rooms = db.rooms().list_for_user(invitee).unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, visible.id);
    }
}
