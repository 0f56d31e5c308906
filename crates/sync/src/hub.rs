//! Room change hub
//!
//! Every command that mutates a room publishes a `RoomEvent` on that room's
//! broadcast channel; live subscriptions listen and reload their snapshot.
//! Viewer-scoped changes (block list, unread counters, room list) go out on
//! a per-user channel instead.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Something changed in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    /// A message was appended, tombstoned, or read
    Messages,
    /// Membership status, role, permissions, mutes, or presence changed
    Membership,
    /// Room metadata (name, visibility, image, settings) changed
    Room,
    /// The room is gone; subscribers should stop
    Deleted,
}

/// Something changed for one user across rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// Unread counter changed for this room
    Unread(Uuid),
    /// Rooms were added to or removed from the user's list
    Rooms,
    /// The user's block list changed
    Relations,
}

pub struct RoomHub {
    rooms: DashMap<Uuid, broadcast::Sender<RoomEvent>>,
    users: DashMap<Uuid, broadcast::Sender<UserEvent>>,
    capacity: usize,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, room_id: Uuid) -> broadcast::Receiver<RoomEvent> {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscribe_user(&self, user_id: Uuid) -> broadcast::Receiver<UserEvent> {
        self.users
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a room. Returns how many subscribers received it.
    pub fn publish(&self, room_id: Uuid, event: RoomEvent) -> usize {
        let delivered = match self.rooms.get(&room_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        debug!(room_id = %room_id, ?event, delivered, "Room event");
        if event == RoomEvent::Deleted {
            self.rooms.remove(&room_id);
        } else if delivered == 0 {
            self.rooms
                .remove_if(&room_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    pub fn publish_user(&self, user_id: Uuid, event: UserEvent) -> usize {
        let delivered = match self.users.get(&user_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.users
                .remove_if(&user_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Drop channels nobody listens to anymore
    pub fn prune(&self) {
        self.rooms.retain(|_, tx| tx.receiver_count() > 0);
        self.users.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn room_channels(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_channels(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_room_subscribers_only() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        let mut other_rx = hub.subscribe(other);

        assert_eq!(hub.publish(room, RoomEvent::Messages), 1);
        assert_eq!(rx.recv().await.unwrap(), RoomEvent::Messages);
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let hub = RoomHub::new(8);
        assert_eq!(hub.publish(Uuid::new_v4(), RoomEvent::Room), 0);
        assert_eq!(hub.publish_user(Uuid::new_v4(), UserEvent::Rooms), 0);
    }

    #[tokio::test]
    async fn test_deleted_closes_channel() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);

        hub.publish(room, RoomEvent::Deleted);
        assert_eq!(rx.recv().await.unwrap(), RoomEvent::Deleted);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(hub.room_channels(), 0);
    }

    #[test]
    fn test_publish_drops_abandoned_channels() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        drop(hub.subscribe(room));
        drop(hub.subscribe_user(user));
        assert_eq!(hub.room_channels(), 1);

        assert_eq!(hub.publish(room, RoomEvent::Messages), 0);
        assert_eq!(hub.publish_user(user, UserEvent::Rooms), 0);
        assert_eq!(hub.room_channels(), 0);
        assert_eq!(hub.user_channels(), 0);
    }

    #[test]
    fn test_prune_drops_idle_channels() {
        let hub = RoomHub::new(8);
        let kept = hub.subscribe(Uuid::new_v4());
        drop(hub.subscribe(Uuid::new_v4()));
        hub.prune();
        assert_eq!(hub.room_channels(), 1);
        drop(kept);
    }
}
