//! Notification Trigger
//!
//! Decides whether a freshly observed message should raise an alert. The
//! last seen message id is kept per room and viewer, so every open session
//! judges "new" against what its own viewer has already seen.

use chorus_core::{Message, RoomPreferences, ViewerFilter};
use dashmap::DashMap;
use uuid::Uuid;

/// What the viewer has configured and can currently see
#[derive(Debug, Clone, Copy)]
pub struct AlertContext<'a> {
    pub prefs: &'a RoomPreferences,
    pub filter: &'a ViewerFilter,
    pub page_visible: bool,
}

#[derive(Default)]
pub struct NotificationTrigger {
    /// (room, viewer) -> newest message id seen, `None` for a primed empty room
    last_seen: DashMap<(Uuid, Uuid), Option<Uuid>>,
}

impl NotificationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a room for `viewer` with what is already on screen
    pub fn prime(&self, room_id: Uuid, viewer: Uuid, latest: Option<Uuid>) {
        self.last_seen.insert((room_id, viewer), latest);
    }

    /// Record `latest` as the newest message the viewer in `ctx` has seen
    /// in its room and decide whether to alert. An unprimed room only
    /// primes.
    pub fn observe(&self, latest: &Message, ctx: AlertContext<'_>) -> bool {
        let key = (latest.room_id, ctx.filter.viewer);
        match self.last_seen.insert(key, Some(latest.id)) {
            None => false,
            Some(Some(id)) if id == latest.id => false,
            Some(_) => should_alert(latest, ctx),
        }
    }

    /// Forget one viewer's room, e.g. when its session closes
    pub fn reset(&self, room_id: Uuid, viewer: Uuid) {
        self.last_seen.remove(&(room_id, viewer));
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

fn should_alert(message: &Message, ctx: AlertContext<'_>) -> bool {
    !message.is_system()
        && !message.deleted
        && message.sender_id != ctx.filter.viewer
        && ctx.prefs.sound_allowed()
        && !ctx.filter.suppresses(message)
        && ctx.page_visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::RoomKind;

    struct Fixture {
        room: Uuid,
        viewer: Uuid,
        other: Uuid,
        prefs: RoomPreferences,
        filter: ViewerFilter,
    }

    impl Fixture {
        fn new() -> Self {
            let viewer = Uuid::new_v4();
            Self {
                room: Uuid::new_v4(),
                viewer,
                other: Uuid::new_v4(),
                prefs: RoomPreferences::default(),
                filter: ViewerFilter::new(viewer, RoomKind::Group),
            }
        }

        fn ctx(&self) -> AlertContext<'_> {
            AlertContext {
                prefs: &self.prefs,
                filter: &self.filter,
                page_visible: true,
            }
        }

        fn from(&self, sender: Uuid) -> Message {
            Message::new(self.room, RoomKind::Group, sender, "ping".into())
        }
    }

    #[test]
    fn test_first_observation_primes() {
        let fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        assert!(!trigger.observe(&fx.from(fx.other), fx.ctx()));
        assert!(trigger.observe(&fx.from(fx.other), fx.ctx()));
    }

    #[test]
    fn test_same_message_alerts_once() {
        let fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        trigger.observe(&fx.from(fx.other), fx.ctx());
        let message = fx.from(fx.other);
        assert!(trigger.observe(&message, fx.ctx()));
        assert!(!trigger.observe(&message, fx.ctx()));
    }

    #[test]
    fn test_viewers_track_last_seen_separately() {
        let fx = Fixture::new();
        let second = ViewerFilter::new(Uuid::new_v4(), RoomKind::Group);
        let second_ctx = AlertContext {
            filter: &second,
            ..fx.ctx()
        };
        let trigger = NotificationTrigger::new();
        trigger.prime(fx.room, fx.viewer, None);
        trigger.prime(fx.room, second.viewer, None);

        let ping = fx.from(fx.other);
        assert!(trigger.observe(&ping, fx.ctx()));
        assert!(trigger.observe(&ping, second_ctx));

        trigger.reset(fx.room, fx.viewer);
        assert_eq!(trigger.tracked(), 1);
        assert!(!trigger.observe(&ping, second_ctx));
    }

    #[test]
    fn test_primed_empty_room_alerts_on_first_message() {
        let fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        trigger.prime(fx.room, fx.viewer, None);
        assert!(trigger.observe(&fx.from(fx.other), fx.ctx()));
    }

    #[test]
    fn test_own_messages_never_alert() {
        let fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        trigger.observe(&fx.from(fx.other), fx.ctx());
        assert!(!trigger.observe(&fx.from(fx.viewer), fx.ctx()));
    }

    #[test]
    fn test_muted_sound_and_hidden_page_suppress() {
        let mut fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        trigger.observe(&fx.from(fx.other), fx.ctx());

        fx.prefs.mute_sound = true;
        assert!(!trigger.observe(&fx.from(fx.other), fx.ctx()));

        fx.prefs.mute_sound = false;
        let hidden = AlertContext {
            page_visible: false,
            ..fx.ctx()
        };
        assert!(!trigger.observe(&fx.from(fx.other), hidden));
    }

    #[test]
    fn test_muted_or_blocked_sender_suppresses() {
        let mut fx = Fixture::new();
        let trigger = NotificationTrigger::new();
        trigger.observe(&fx.from(fx.other), fx.ctx());

        fx.filter.muted.insert(fx.other);
        assert!(!trigger.observe(&fx.from(fx.other), fx.ctx()));

        fx.filter.muted.clear();
        fx.filter.blocked.insert(fx.other);
        assert!(!trigger.observe(&fx.from(fx.other), fx.ctx()));
    }
}
