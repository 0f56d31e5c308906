//! Database migration system
//!
//! Tracks schema versions and applies migrations in order.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info, instrument};

use super::parse::format_datetime;
use crate::error::Result;

/// A database migration
pub struct Migration {
    /// Version number (must be sequential starting from 1)
    pub version: u32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to run for this migration
    pub sql: &'static str,
}

/// All migrations in order
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema",
        sql: r#"
            -- Known users and their display names
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                nickname TEXT,
                created_at TEXT NOT NULL
            );

            -- DM and group rooms
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                image_ref TEXT,
                is_public INTEGER NOT NULL DEFAULT 0,
                invite_code TEXT UNIQUE,
                settings_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_message TEXT,
                last_message_at TEXT
            );

            -- One record per (room, user); retained after kick/leave
            CREATE TABLE IF NOT EXISTS memberships (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                role INTEGER NOT NULL,
                permissions_json TEXT NOT NULL DEFAULT '[]',
                invited_by TEXT,
                joined_at TEXT NOT NULL,
                last_access_time TEXT,
                muted_users_json TEXT NOT NULL DEFAULT '[]',
                in_room INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                blocked_invite INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
                UNIQUE(room_id, user_id)
            );

            -- Messages; deletion is a tombstone, never a row removal
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_by TEXT,
                deleted_by_name TEXT,
                read_json TEXT NOT NULL,
                system_json TEXT,
                FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
                UNIQUE(room_id, sequence)
            );

            -- Global, one-directional blocks
            CREATE TABLE IF NOT EXISTS blocks (
                blocker_id TEXT NOT NULL,
                blocked_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (blocker_id, blocked_id)
            );

            -- Symmetric friendships, stored with user_lo < user_hi
            CREATE TABLE IF NOT EXISTS friends (
                user_lo TEXT NOT NULL,
                user_hi TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_lo, user_hi)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "Add indexes for query performance",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);
            CREATE INDEX IF NOT EXISTS idx_memberships_room ON memberships(room_id);
            CREATE INDEX IF NOT EXISTS idx_messages_room_created
                ON messages(room_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_blocks_blocked ON blocks(blocked_id);
        "#,
    },
    Migration {
        version: 3,
        description: "Add device-local preferences",
        sql: r#"
            CREATE TABLE IF NOT EXISTS device_preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;
    Ok(())
}

/// Highest applied version, 0 for a fresh database
pub(crate) fn current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// Apply one migration and record it, all or nothing
fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        params![
            migration.version,
            migration.description,
            format_datetime(&Utc::now())
        ],
    )?;
    tx.commit()?;
    Ok(())
}

/// Run all pending migrations
#[instrument(skip(conn))]
pub fn run_migrations(conn: &Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let from = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );
        apply(conn, migration)?;
    }

    info!(from, to = current_version(conn)?, "Database schema updated");
    Ok(())
}
