//! Block and friend relations
//!
//! Blocks are global and one-directional: `blocker` hides `blocked`, never
//! the other way round. Friendships are symmetric and stored once per pair.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{format_datetime, parse_uuid};
use crate::error::Result;

pub struct RelationStore<'a> {
    conn: &'a Connection,
}

fn ordered(a: Uuid, b: Uuid) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl<'a> RelationStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self))]
    pub fn block(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
            params![
                blocker.to_string(),
                blocked.to_string(),
                format_datetime(&Utc::now())
            ],
        )?;
        Ok(inserted > 0)
    }

    #[instrument(skip(self))]
    pub fn unblock(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.to_string(), blocked.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn is_blocked(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2)",
            params![blocker.to_string(), blocked.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn blocked_ids(&self, blocker: Uuid) -> Result<BTreeSet<Uuid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT blocked_id FROM blocks WHERE blocker_id = ?1")?;
        let ids = stmt
            .query_map(params![blocker.to_string()], |row| {
                parse_uuid(&row.get::<_, String>(0)?)
            })?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn add_friend(&self, a: Uuid, b: Uuid) -> Result<()> {
        let (lo, hi) = ordered(a, b);
        self.conn.execute(
            "INSERT OR IGNORE INTO friends (user_lo, user_hi, created_at) VALUES (?1, ?2, ?3)",
            params![lo, hi, format_datetime(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn remove_friend(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let (lo, hi) = ordered(a, b);
        let removed = self.conn.execute(
            "DELETE FROM friends WHERE user_lo = ?1 AND user_hi = ?2",
            params![lo, hi],
        )?;
        Ok(removed > 0)
    }

    pub fn are_friends(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let (lo, hi) = ordered(a, b);
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM friends WHERE user_lo = ?1 AND user_hi = ?2)",
            params![lo, hi],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}
