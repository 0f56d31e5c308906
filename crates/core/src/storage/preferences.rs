//! Device-local preferences
//!
//! Viewer-local settings live behind the narrow [`KeyValueStore`] interface
//! and are never part of the shared room data. [`RoomPreferences`] is read
//! once when a room is opened and passed through from there.

use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse::{format_datetime, OptionalExt};
use crate::error::Result;

/// Minimal get/set interface over device-local storage
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed device preferences
pub struct PreferencesStore<'a> {
    conn: &'a Connection,
}

impl<'a> PreferencesStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl KeyValueStore for PreferencesStore<'_> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM device_preferences WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO device_preferences (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, format_datetime(&Utc::now())],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM device_preferences WHERE key = ?1", params![key])?;
        Ok(())
    }
}

const SOUND_ENABLED_KEY: &str = "sound_enabled";

fn room_key(room_id: Uuid, field: &str) -> String {
    format!("room:{}:{}", room_id, field)
}

/// Viewer-local settings for one room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPreferences {
    /// Device-wide notification sound switch
    pub sound_enabled: bool,
    /// Per-room sound mute
    pub mute_sound: bool,
    pub color_theme: Option<String>,
}

impl Default for RoomPreferences {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            mute_sound: false,
            color_theme: None,
        }
    }
}

impl RoomPreferences {
    pub fn load(kv: &impl KeyValueStore, room_id: Uuid) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            sound_enabled: kv
                .get(SOUND_ENABLED_KEY)?
                .map_or(defaults.sound_enabled, |v| v == "true"),
            mute_sound: kv
                .get(&room_key(room_id, "mute_sound"))?
                .map_or(defaults.mute_sound, |v| v == "true"),
            color_theme: kv.get(&room_key(room_id, "color_theme"))?,
        })
    }

    pub fn save(&self, kv: &impl KeyValueStore, room_id: Uuid) -> Result<()> {
        kv.set(SOUND_ENABLED_KEY, &self.sound_enabled.to_string())?;
        kv.set(
            &room_key(room_id, "mute_sound"),
            &self.mute_sound.to_string(),
        )?;
        match &self.color_theme {
            Some(theme) => kv.set(&room_key(room_id, "color_theme"), theme),
            None => kv.remove(&room_key(room_id, "color_theme")),
        }
    }

    /// Whether a local alert may sound in this room at all
    pub fn sound_allowed(&self) -> bool {
        self.sound_enabled && !self.mute_sound
    }
}
