//! User storage operations

use rusqlite::{params, Connection, Row};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{format_datetime, parse_datetime, parse_uuid, OptionalExt};
use crate::error::Result;
use crate::models::{User, ANONYMOUS_NAME};

pub struct UserStore<'a> {
    conn: &'a Connection,
}

impl<'a> UserStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            display_name: row.get(1)?,
            nickname: row.get(2)?,
            created_at: parse_datetime(&row.get::<_, String>(3)?)?,
        })
    }

    /// Insert a user, or refresh the names of an existing one
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub fn save(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, display_name, nickname, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name,
                                           nickname = excluded.nickname",
            params![
                user.id.to_string(),
                user.display_name,
                user.nickname,
                format_datetime(&user.created_at),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, display_name, nickname, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                Self::from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Preferred name for a user; unknown users are "Anonymous"
    pub fn display_name(&self, id: Uuid) -> Result<String> {
        Ok(self
            .find_by_id(id)?
            .map(|u| u.name().to_string())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[test]
    fn test_save_and_rename() {
        let db = Database::open_in_memory().unwrap();
        let user = User::new("Park Jisoo");
        db.users().save(&user).unwrap();
        assert_eq!(db.users().display_name(user.id).unwrap(), "Park Jisoo");

        let renamed = user.clone().with_nickname("jisoo");
        db.users().save(&renamed).unwrap();
        assert_eq!(db.users().display_name(user.id).unwrap(), "jisoo");
    }

    #[test]
    fn test_unknown_user_is_anonymous() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            db.users().display_name(Uuid::new_v4()).unwrap(),
            ANONYMOUS_NAME
        );
    }
}
