//! Presence Tracker
//!
//! Tracks which rooms each viewer has open and whether the page is
//! visible. `in_room` is written through to the membership row so that
//! senders can mark messages read for members who are looking at the room.

use chorus_core::{Database, MembershipRepository};
use dashmap::DashSet;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

pub struct PresenceTracker {
    in_room: DashSet<(Uuid, Uuid)>,
    visible: watch::Sender<bool>,
}

impl PresenceTracker {
    pub fn new(visible: bool) -> Self {
        Self {
            in_room: DashSet::new(),
            visible: watch::channel(visible).0,
        }
    }

    /// Record page visibility. A hidden page does not count as being in
    /// any room, so the persisted `in_room` flag of every open room follows
    /// the page.
    pub(crate) fn set_visible(&self, db: &Database, visible: bool) -> Result<()> {
        for entry in self.in_room.iter() {
            let (room_id, viewer) = *entry;
            db.set_in_room(room_id, viewer, visible)?;
        }
        let changed = self.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
        if changed {
            debug!(visible, rooms = self.in_room.len(), "Page visibility changed");
        }
        Ok(())
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn watch_visibility(&self) -> watch::Receiver<bool> {
        self.visible.subscribe()
    }

    pub fn is_in_room(&self, room_id: Uuid, viewer: Uuid) -> bool {
        self.in_room.contains(&(room_id, viewer))
    }

    /// Reading is allowed only while the room is open and on screen
    pub fn can_mark_read(&self, room_id: Uuid, viewer: Uuid) -> bool {
        self.is_in_room(room_id, viewer) && self.is_visible()
    }

    pub(crate) fn enter(&self, db: &Database, room_id: Uuid, viewer: Uuid) -> Result<()> {
        db.set_in_room(room_id, viewer, self.is_visible())?;
        self.in_room.insert((room_id, viewer));
        debug!(room_id = %room_id, viewer = %viewer, "Entered room");
        Ok(())
    }

    pub(crate) fn exit(&self, db: &Database, room_id: Uuid, viewer: Uuid) -> Result<()> {
        self.in_room.remove(&(room_id, viewer));
        db.set_in_room(room_id, viewer, false)?;
        debug!(room_id = %room_id, viewer = %viewer, "Left room view");
        Ok(())
    }

    /// Clear flags left behind by a previous run that never exited its rooms
    pub(crate) fn reset_all(&self, db: &Database, viewer: Uuid) -> Result<usize> {
        self.in_room.retain(|(_, user)| *user != viewer);
        Ok(db.reset_in_room(viewer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Membership, Room, RoomRepository, RoomRole};

    fn setup() -> (Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let viewer = Uuid::new_v4();
        let room = Room::new_group("Presence", viewer, false);
        db.create_room(&room).unwrap();
        db.save_membership(&Membership::active(room.id, viewer, RoomRole::Owner))
            .unwrap();
        (db, room.id, viewer)
    }

    #[test]
    fn test_enter_and_exit_persist_flag() {
        let (db, room, viewer) = setup();
        let presence = PresenceTracker::new(true);

        presence.enter(&db, room, viewer).unwrap();
        assert!(presence.can_mark_read(room, viewer));
        assert!(db.find_membership(room, viewer).unwrap().unwrap().in_room);

        presence.exit(&db, room, viewer).unwrap();
        assert!(!presence.can_mark_read(room, viewer));
        assert!(!db.find_membership(room, viewer).unwrap().unwrap().in_room);
    }

    #[test]
    fn test_hidden_page_blocks_reading() {
        let (db, room, viewer) = setup();
        let presence = PresenceTracker::new(true);
        presence.enter(&db, room, viewer).unwrap();

        presence.set_visible(&db, false).unwrap();
        assert!(presence.is_in_room(room, viewer));
        assert!(!presence.can_mark_read(room, viewer));
    }

    #[test]
    fn test_visibility_writes_in_room_through() {
        let (db, room, viewer) = setup();
        let presence = PresenceTracker::new(true);
        presence.enter(&db, room, viewer).unwrap();

        presence.set_visible(&db, false).unwrap();
        assert!(!db.find_membership(room, viewer).unwrap().unwrap().in_room);

        presence.set_visible(&db, true).unwrap();
        assert!(db.find_membership(room, viewer).unwrap().unwrap().in_room);
    }

    #[test]
    fn test_enter_while_hidden_stays_out_of_room() {
        let (db, room, viewer) = setup();
        let presence = PresenceTracker::new(false);
        presence.enter(&db, room, viewer).unwrap();

        assert!(presence.is_in_room(room, viewer));
        assert!(!db.find_membership(room, viewer).unwrap().unwrap().in_room);
    }

    #[test]
    fn test_reset_all_clears_stale_flags() {
        let (db, room, viewer) = setup();
        db.set_in_room(room, viewer, true).unwrap();

        let presence = PresenceTracker::new(true);
        assert_eq!(presence.reset_all(&db, viewer).unwrap(), 1);
        assert!(!db.find_membership(room, viewer).unwrap().unwrap().in_room);
    }

    #[tokio::test]
    async fn test_visibility_watch_sees_changes() {
        let (db, _, _) = setup();
        let presence = PresenceTracker::new(false);
        let mut rx = presence.watch_visibility();
        presence.set_visible(&db, true).unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
