//! Message storage operations

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{params, Connection, Row};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{
    format_datetime, parse_datetime, parse_datetime_opt, parse_json, parse_json_opt, parse_named,
    parse_uuid, parse_uuid_opt, to_json, OptionalExt,
};
use crate::error::Result;
use crate::models::{Message, MessageKind};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, kind, body, created_at, sequence, \
     deleted, deleted_by, deleted_by_name, read_json, system_json";

pub struct MessageStore<'a> {
    conn: &'a Connection,
}

impl<'a> MessageStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            room_id: parse_uuid(&row.get::<_, String>(1)?)?,
            sender_id: parse_uuid(&row.get::<_, String>(2)?)?,
            kind: parse_named(&row.get::<_, String>(3)?, MessageKind::parse)?,
            body: row.get(4)?,
            created_at: parse_datetime(&row.get::<_, String>(5)?)?,
            sequence: row.get(6)?,
            deleted: row.get(7)?,
            deleted_by: parse_uuid_opt(row.get(8)?)?,
            deleted_by_name: row.get(9)?,
            read: parse_json(&row.get::<_, String>(10)?)?,
            system: parse_json_opt(row.get(11)?)?,
        })
    }

    /// Next (timestamp, sequence) for a room: never earlier than now and
    /// always strictly after the room's newest message
    fn next_position(&self, room_id: Uuid) -> Result<(DateTime<Utc>, i64)> {
        let (last_at, last_seq): (Option<String>, Option<i64>) = self.conn.query_row(
            "SELECT MAX(created_at), MAX(sequence) FROM messages WHERE room_id = ?1",
            params![room_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let now = Utc::now().trunc_subsecs(6);
        let created_at = match parse_datetime_opt(last_at)? {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        Ok((created_at, last_seq.unwrap_or(0) + 1))
    }

    /// Append a message; the store assigns `created_at` and `sequence`
    #[instrument(skip(self, message), fields(room_id = %message.room_id, message_id = %message.id))]
    pub fn append(&self, message: &mut Message) -> Result<()> {
        let (created_at, sequence) = self.next_position(message.room_id)?;
        message.created_at = created_at;
        message.sequence = sequence;

        self.conn.execute(
            "INSERT INTO messages (id, room_id, sender_id, kind, body, created_at, sequence,
                                   deleted, deleted_by, deleted_by_name, read_json, system_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.sender_id.to_string(),
                message.kind.as_str(),
                message.body,
                format_datetime(&message.created_at),
                message.sequence,
                message.deleted,
                message.deleted_by.map(|id| id.to_string()),
                message.deleted_by_name,
                to_json(&message.read)?,
                message.system.as_ref().map(to_json).transpose()?,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        let message = self
            .conn
            .query_row(&sql, params![id.to_string()], Self::from_row)
            .optional()?;
        Ok(message)
    }

    /// Newest `limit` messages in stream order. Fetches one extra row to
    /// learn whether older history exists.
    #[instrument(skip(self))]
    pub fn latest(
        &self,
        room_id: Uuid,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, bool)> {
        let sql = format!(
            "SELECT {} FROM messages
             WHERE room_id = ?1 AND (?2 IS NULL OR created_at >= ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let mut messages = stmt
            .query_map(
                params![
                    room_id.to_string(),
                    since.as_ref().map(format_datetime),
                    fetch
                ],
                Self::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let has_more = messages.len() > limit;
        messages.truncate(limit);
        messages.reverse();
        Ok((messages, has_more))
    }

    /// Persist the mutable parts of a message: body, tombstone, read marker
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub fn update(&self, message: &Message) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET body = ?2, deleted = ?3, deleted_by = ?4, deleted_by_name = ?5,
                                 read_json = ?6
             WHERE id = ?1",
            params![
                message.id.to_string(),
                message.body,
                message.deleted,
                message.deleted_by.map(|id| id.to_string()),
                message.deleted_by_name,
                to_json(&message.read)?,
            ],
        )?;
        Ok(())
    }

    /// Mark messages read by `reader`, skipping the reader's own messages
    pub fn mark_read(&self, reader: Uuid, message_ids: &[Uuid]) -> Result<usize> {
        let mut changed = 0;
        for id in message_ids {
            let Some(mut message) = self.find_by_id(*id)? else {
                continue;
            };
            if message.sender_id == reader {
                continue;
            }
            if message.read.mark(reader) {
                self.update(&message)?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReadMarker, Room, RoomKind};
    use crate::storage::Database;

    fn setup() -> (Database, Room) {
        let db = Database::open_in_memory().unwrap();
        let room = Room::new_group("Room", Uuid::new_v4(), false);
        db.rooms().create(&room).unwrap();
        (db, room)
    }

    fn send(db: &Database, room: &Room, body: &str) -> Message {
        let mut message = Message::new(room.id, room.kind, room.owner_id, body.to_string());
        db.messages().append(&mut message).unwrap();
        message
    }

    #[test]
    fn test_append_assigns_increasing_positions() {
        let (db, room) = setup();
        let first = send(&db, &room, "one");
        let second = send(&db, &room, "two");
        assert!(second.created_at > first.created_at);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn test_latest_returns_newest_in_order() {
        let (db, room) = setup();
        let sent: Vec<Message> = (0..10).map(|i| send(&db, &room, &format!("m{}", i))).collect();

        let (page, has_more) = db.messages().latest(room.id, 4, None).unwrap();
        assert!(has_more);
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m6", "m7", "m8", "m9"]);

        let (all, has_more) = db.messages().latest(room.id, 10, None).unwrap();
        assert!(!has_more);
        assert_eq!(
            all.iter().map(|m| m.id).collect::<Vec<_>>(),
            sent.iter().map(|m| m.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_latest_since_filters_history() {
        let (db, room) = setup();
        send(&db, &room, "before");
        let cutoff = send(&db, &room, "at").created_at;
        send(&db, &room, "after");

        let (page, has_more) = db.messages().latest(room.id, 30, Some(cutoff)).unwrap();
        assert!(!has_more);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body, "at");
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let (db, room) = setup();
        let message = send(&db, &room, "hi");
        let reader = Uuid::new_v4();

        assert_eq!(db.messages().mark_read(reader, &[message.id]).unwrap(), 1);
        assert_eq!(db.messages().mark_read(reader, &[message.id]).unwrap(), 0);

        let loaded = db.messages().find_by_id(message.id).unwrap().unwrap();
        assert_eq!(
            loaded.read,
            ReadMarker::Group {
                read_by: [reader].into_iter().collect()
            }
        );
    }

    #[test]
    fn test_dm_read_flag() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = Room::new_dm(a, b);
        db.rooms().create(&room).unwrap();
        let mut message = Message::new(room.id, RoomKind::Dm, a, "yo".into());
        db.messages().append(&mut message).unwrap();

        // Sender's own read does not flip the flag
        assert_eq!(db.messages().mark_read(a, &[message.id]).unwrap(), 0);
        assert_eq!(db.messages().mark_read(b, &[message.id]).unwrap(), 1);
        let loaded = db.messages().find_by_id(message.id).unwrap().unwrap();
        assert_eq!(loaded.read, ReadMarker::Direct { read: true });
    }
}
