//! Membership storage operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::parse::{
    format_datetime, parse_datetime, parse_datetime_opt, parse_json, parse_named, parse_uuid,
    parse_uuid_opt, to_json, OptionalExt,
};
use crate::error::Result;
use crate::invariants::assert_membership_invariants;
use crate::models::{Membership, MembershipStatus, RoomRole};

const MEMBERSHIP_COLUMNS: &str = "id, room_id, user_id, status, role, permissions_json, \
     invited_by, joined_at, last_access_time, muted_users_json, in_room, unread_count, blocked_invite";

pub struct MembershipStore<'a> {
    conn: &'a Connection,
}

impl<'a> MembershipStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
        Ok(Membership {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            room_id: parse_uuid(&row.get::<_, String>(1)?)?,
            user_id: parse_uuid(&row.get::<_, String>(2)?)?,
            status: parse_named(&row.get::<_, String>(3)?, MembershipStatus::parse)?,
            role: RoomRole::from_u8(row.get(4)?),
            permissions: parse_json(&row.get::<_, String>(5)?)?,
            invited_by: parse_uuid_opt(row.get(6)?)?,
            joined_at: parse_datetime(&row.get::<_, String>(7)?)?,
            last_access_time: parse_datetime_opt(row.get(8)?)?,
            muted_users: parse_json(&row.get::<_, String>(9)?)?,
            in_room: row.get(10)?,
            unread_count: row.get(11)?,
            blocked_invite: row.get(12)?,
        })
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Membership>> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE {} ORDER BY joined_at, id",
            MEMBERSHIP_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or replace the record for (room, user). A re-invite replaces
    /// the old record wholesale, including its id.
    #[instrument(skip(self, m), fields(room_id = %m.room_id, user_id = %m.user_id, status = m.status.as_str()))]
    pub fn save(&self, m: &Membership) -> Result<()> {
        assert_membership_invariants(m);
        self.conn.execute(
            "INSERT INTO memberships (id, room_id, user_id, status, role, permissions_json,
                                      invited_by, joined_at, last_access_time, muted_users_json,
                                      in_room, unread_count, blocked_invite)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(room_id, user_id) DO UPDATE SET
                id = excluded.id,
                status = excluded.status,
                role = excluded.role,
                permissions_json = excluded.permissions_json,
                invited_by = excluded.invited_by,
                joined_at = excluded.joined_at,
                last_access_time = excluded.last_access_time,
                muted_users_json = excluded.muted_users_json,
                in_room = excluded.in_room,
                unread_count = excluded.unread_count,
                blocked_invite = excluded.blocked_invite",
            params![
                m.id.to_string(),
                m.room_id.to_string(),
                m.user_id.to_string(),
                m.status.as_str(),
                m.role.as_u8(),
                to_json(&m.permissions)?,
                m.invited_by.map(|id| id.to_string()),
                format_datetime(&m.joined_at),
                m.last_access_time.as_ref().map(format_datetime),
                to_json(&m.muted_users)?,
                m.in_room,
                m.unread_count,
                m.blocked_invite,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn find(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE room_id = ?1 AND user_id = ?2",
            MEMBERSHIP_COLUMNS
        );
        let membership = self
            .conn
            .query_row(
                &sql,
                params![room_id.to_string(), user_id.to_string()],
                Self::from_row,
            )
            .optional()?;
        Ok(membership)
    }

    pub fn list_for_room(&self, room_id: Uuid) -> Result<Vec<Membership>> {
        self.query("room_id = ?1", &[&room_id.to_string()])
    }

    pub fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>> {
        self.query("user_id = ?1", &[&user_id.to_string()])
    }

    #[instrument(skip(self))]
    pub fn remove(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM memberships WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_in_room(&self, room_id: Uuid, user_id: Uuid, in_room: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE memberships SET in_room = ?3 WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string(), in_room],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn reset_in_room(&self, user_id: Uuid) -> Result<usize> {
        let cleared = self.conn.execute(
            "UPDATE memberships SET in_room = 0 WHERE user_id = ?1 AND in_room = 1",
            params![user_id.to_string()],
        )?;
        if cleared > 0 {
            debug!(cleared, "Cleared stale in-room flags");
        }
        Ok(cleared)
    }

    pub fn increment_unread(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        self.conn.execute(
            "UPDATE memberships SET unread_count = unread_count + 1
             WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn reset_unread(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE memberships SET unread_count = 0, last_access_time = ?3
             WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string(), format_datetime(&at)],
        )?;
        Ok(())
    }
}
