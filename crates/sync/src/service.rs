//! Async command surface
//!
//! `ChatService` owns the store behind a mutex and the room hub. Each
//! command validates and applies through the core (authority, moderation,
//! sync engine) and then publishes what changed, so every live
//! subscription reloads on its own.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chorus_core::{
    Capabilities, ChorusConfig, Database, KeyValueStore, LeaveOutcome, MemberInfo, Membership,
    MembershipAuthority, MembershipRepository, Message, ModerationEngine, PermissionSet, Room,
    RoomPreferences, RoomRepository, User, UserRepository,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::{self, MessageSubscription};
use crate::error::Result;
use crate::hub::{RoomEvent, RoomHub, UserEvent};
use crate::notify::NotificationTrigger;
use crate::presence::PresenceTracker;
use crate::read_state::{MarkRead, ReadStateTracker};
use crate::session::{Draft, RoomSession};
use crate::subscription::{spawn_reloader, Subscription};

/// State shared by the service, its sessions, and their background tasks
pub(crate) struct Shared {
    pub(crate) db: Mutex<Database>,
    pub(crate) hub: RoomHub,
    pub(crate) config: ChorusConfig,
    pub(crate) presence: PresenceTracker,
    pub(crate) notifier: NotificationTrigger,
}

/// Chat core handle. Cheap to clone.
#[derive(Clone)]
pub struct ChatService {
    pub(crate) shared: Arc<Shared>,
}

impl ChatService {
    pub fn new(db: Database, config: ChorusConfig) -> Self {
        let hub = RoomHub::new(config.event_buffer);
        Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                hub,
                config,
                presence: PresenceTracker::new(true),
                notifier: NotificationTrigger::new(),
            }),
        }
    }

    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: ChorusConfig) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, config))
    }

    pub fn open_in_memory(config: ChorusConfig) -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, config))
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.shared.config
    }

    pub fn hub(&self) -> &RoomHub {
        &self.shared.hub
    }

    pub fn read_state(&self) -> ReadStateTracker {
        ReadStateTracker::new(self.shared.clone())
    }

    async fn authority<T>(
        &self,
        f: impl FnOnce(&MembershipAuthority<'_, Database>) -> chorus_core::Result<T>,
    ) -> Result<T> {
        let db = self.shared.db.lock().await;
        let authority = MembershipAuthority::new(&*db, &self.shared.config);
        Ok(f(&authority)?)
    }

    async fn moderation<T>(
        &self,
        f: impl FnOnce(&ModerationEngine<'_, Database>) -> chorus_core::Result<T>,
    ) -> Result<T> {
        let db = self.shared.db.lock().await;
        Ok(f(&ModerationEngine::new(&*db))?)
    }

    fn publish(&self, room_id: Uuid, events: &[RoomEvent]) {
        for event in events {
            self.shared.hub.publish(room_id, *event);
        }
    }

    fn publish_users(&self, users: impl IntoIterator<Item = Uuid>, event: UserEvent) {
        for user in users {
            self.shared.hub.publish_user(user, event);
        }
    }

    // ---- users and relations ----

    pub async fn register_user(&self, display_name: &str) -> Result<User> {
        let user = User::new(display_name.trim());
        self.shared.db.lock().await.save_user(&user)?;
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn block_user(&self, actor: Uuid, target: Uuid) -> Result<bool> {
        let added = self.moderation(|m| m.block_user(actor, target)).await?;
        if added {
            self.publish_users([actor], UserEvent::Relations);
        }
        Ok(added)
    }

    #[instrument(skip(self))]
    pub async fn unblock_user(&self, actor: Uuid, target: Uuid) -> Result<bool> {
        let removed = self.moderation(|m| m.unblock_user(actor, target)).await?;
        if removed {
            self.publish_users([actor], UserEvent::Relations);
        }
        Ok(removed)
    }

    pub async fn add_friend(&self, actor: Uuid, target: Uuid) -> Result<()> {
        self.moderation(|m| m.add_friend(actor, target)).await
    }

    // ---- room lifecycle ----

    pub async fn create_group(
        &self,
        creator: Uuid,
        name: &str,
        invitees: &[Uuid],
        is_public: bool,
    ) -> Result<Room> {
        let room = self
            .authority(|a| a.create_group(creator, name, invitees, is_public))
            .await?;
        self.publish_users(
            std::iter::once(creator).chain(invitees.iter().copied()),
            UserEvent::Rooms,
        );
        Ok(room)
    }

    pub async fn open_dm(&self, opener: Uuid, peer: Uuid) -> Result<Room> {
        let room = self.authority(|a| a.open_dm(opener, peer)).await?;
        self.publish(room.id, &[RoomEvent::Membership]);
        self.publish_users([opener, peer], UserEvent::Rooms);
        Ok(room)
    }

    #[instrument(skip(self))]
    pub async fn delete_room(&self, actor: Uuid, room_id: Uuid) -> Result<()> {
        let members = self
            .authority(|a| {
                let members = a.members(room_id)?;
                a.delete_room(actor, room_id)?;
                Ok(members)
            })
            .await?;
        self.publish(room_id, &[RoomEvent::Deleted]);
        self.publish_users(members.iter().map(|m| m.user_id), UserEvent::Rooms);
        Ok(())
    }

    // ---- invitations ----

    pub async fn invite(
        &self,
        actor: Uuid,
        room_id: Uuid,
        targets: &[Uuid],
    ) -> Result<Vec<Membership>> {
        let invited = self.authority(|a| a.invite(actor, room_id, targets)).await?;
        self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        self.publish_users(invited.iter().map(|m| m.user_id), UserEvent::Rooms);
        Ok(invited)
    }

    pub async fn accept(&self, user: Uuid, room_id: Uuid, force_join: bool) -> Result<Membership> {
        let membership = self
            .authority(|a| a.accept(user, room_id, force_join))
            .await?;
        self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        self.publish_users([user], UserEvent::Rooms);
        Ok(membership)
    }

    pub async fn join_by_code(&self, user: Uuid, code: &str, force_join: bool) -> Result<Room> {
        let room = self
            .authority(|a| a.join_by_code(user, code, force_join))
            .await?;
        self.publish(room.id, &[RoomEvent::Membership, RoomEvent::Messages]);
        self.publish_users([user], UserEvent::Rooms);
        Ok(room)
    }

    pub async fn reject(&self, user: Uuid, room_id: Uuid) -> Result<()> {
        self.authority(|a| a.reject(user, room_id)).await?;
        self.publish(room_id, &[RoomEvent::Membership]);
        self.publish_users([user], UserEvent::Rooms);
        Ok(())
    }

    pub async fn cancel_invitation(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        self.authority(|a| a.cancel_invitation(actor, room_id, target))
            .await?;
        self.publish(room_id, &[RoomEvent::Membership]);
        self.publish_users([target], UserEvent::Rooms);
        Ok(())
    }

    // ---- membership ----

    #[instrument(skip(self))]
    pub async fn kick(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        self.authority(|a| a.kick(actor, room_id, target)).await?;
        self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        self.publish_users([target], UserEvent::Rooms);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn leave(&self, user: Uuid, room_id: Uuid) -> Result<LeaveOutcome> {
        let outcome = self.authority(|a| a.leave(user, room_id)).await?;
        if outcome.room_deleted {
            self.publish(room_id, &[RoomEvent::Deleted]);
        } else {
            self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        }
        self.publish_users([user], UserEvent::Rooms);
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn transfer_ownership(
        &self,
        actor: Uuid,
        room_id: Uuid,
        new_owner: Uuid,
    ) -> Result<()> {
        self.authority(|a| a.transfer_ownership(actor, room_id, new_owner))
            .await?;
        self.publish(
            room_id,
            &[RoomEvent::Membership, RoomEvent::Room, RoomEvent::Messages],
        );
        Ok(())
    }

    pub async fn appoint_sub_manager(
        &self,
        actor: Uuid,
        room_id: Uuid,
        target: Uuid,
        permissions: PermissionSet,
    ) -> Result<()> {
        self.authority(|a| a.appoint_sub_manager(actor, room_id, target, permissions))
            .await?;
        self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        Ok(())
    }

    pub async fn remove_sub_manager(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        self.authority(|a| a.remove_sub_manager(actor, room_id, target))
            .await?;
        self.publish(room_id, &[RoomEvent::Membership, RoomEvent::Messages]);
        Ok(())
    }

    pub async fn update_sub_manager_permissions(
        &self,
        actor: Uuid,
        room_id: Uuid,
        target: Uuid,
        permissions: PermissionSet,
    ) -> Result<()> {
        self.authority(|a| a.update_sub_manager_permissions(actor, room_id, target, permissions))
            .await?;
        self.publish(room_id, &[RoomEvent::Membership]);
        Ok(())
    }

    // ---- room settings ----

    pub async fn update_room_visibility(
        &self,
        actor: Uuid,
        room_id: Uuid,
        is_public: bool,
    ) -> Result<Room> {
        let room = self
            .authority(|a| a.update_room_visibility(actor, room_id, is_public))
            .await?;
        self.publish(room_id, &[RoomEvent::Room, RoomEvent::Messages]);
        Ok(room)
    }

    pub async fn rename_room(&self, actor: Uuid, room_id: Uuid, name: &str) -> Result<Room> {
        let room = self.authority(|a| a.rename_room(actor, room_id, name)).await?;
        self.publish(room_id, &[RoomEvent::Room, RoomEvent::Messages]);
        Ok(room)
    }

    pub async fn update_room_image(
        &self,
        actor: Uuid,
        room_id: Uuid,
        image_ref: Option<String>,
    ) -> Result<Room> {
        let room = self
            .authority(|a| a.update_room_image(actor, room_id, image_ref))
            .await?;
        self.publish(room_id, &[RoomEvent::Room]);
        Ok(room)
    }

    /// Persist device-local preferences for a room. Open sessions keep the
    /// values they loaded.
    pub async fn save_room_preferences(&self, room_id: Uuid, prefs: &RoomPreferences) -> Result<()> {
        let db = self.shared.db.lock().await;
        prefs.save(&db.preferences(), room_id)?;
        Ok(())
    }

    pub async fn room_preferences(&self, room_id: Uuid) -> Result<RoomPreferences> {
        let db = self.shared.db.lock().await;
        Ok(RoomPreferences::load(&db.preferences(), room_id)?)
    }

    /// Device-local setting outside any room
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let db = self.shared.db.lock().await;
        db.preferences().set(key, value)?;
        Ok(())
    }

    // ---- messages ----

    #[instrument(skip(self, body))]
    pub async fn send(&self, room_id: Uuid, sender: Uuid, body: &str) -> Result<Message> {
        let delivery = {
            let db = self.shared.db.lock().await;
            engine::send_message(&*db, room_id, sender, body)?
        };
        self.publish(room_id, &[RoomEvent::Messages]);
        self.publish_users(delivery.unread_for.iter().copied(), UserEvent::Unread(room_id));
        self.publish_users([sender], UserEvent::Rooms);
        debug!(message_id = %delivery.message.id, "Message sent");
        Ok(delivery.message)
    }

    /// Send the draft's content. The draft is cleared up front and its
    /// content put back if the send fails.
    pub async fn send_draft(&self, room_id: Uuid, sender: Uuid, draft: &mut Draft) -> Result<Message> {
        let body = draft.take();
        match self.send(room_id, sender, &body).await {
            Ok(message) => Ok(message),
            Err(e) => {
                draft.restore(body);
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_message(&self, actor: Uuid, message_id: Uuid) -> Result<Message> {
        let message = self
            .moderation(|m| m.delete_message(actor, message_id))
            .await?;
        self.publish(message.room_id, &[RoomEvent::Messages]);
        Ok(message)
    }

    pub async fn mute_user(&self, viewer: Uuid, room_id: Uuid, target: Uuid) -> Result<bool> {
        let changed = self
            .moderation(|m| m.mute_user(viewer, room_id, target))
            .await?;
        if changed {
            self.publish(room_id, &[RoomEvent::Membership]);
        }
        Ok(changed)
    }

    pub async fn unmute_user(&self, viewer: Uuid, room_id: Uuid, target: Uuid) -> Result<bool> {
        let changed = self
            .moderation(|m| m.unmute_user(viewer, room_id, target))
            .await?;
        if changed {
            self.publish(room_id, &[RoomEvent::Membership]);
        }
        Ok(changed)
    }

    /// Mark the viewer's loaded page read, if they are looking at the room
    pub async fn mark_read(&self, room_id: Uuid, viewer: Uuid) -> Result<MarkRead> {
        let page = {
            let db = self.shared.db.lock().await;
            engine::load_page(&*db, room_id, viewer, self.shared.config.page_size)?
        };
        self.read_state()
            .mark_read(room_id, viewer, &page.messages)
            .await
    }

    // ---- presence ----

    /// Page shown or hidden. Open rooms count as entered only while shown.
    pub async fn set_page_visible(&self, visible: bool) -> Result<()> {
        let db = self.shared.db.lock().await;
        self.shared.presence.set_visible(&db, visible)
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.shared.presence
    }

    /// Clear `in_room` flags left over from a previous run
    pub async fn reset_presence(&self, viewer: Uuid) -> Result<usize> {
        let db = self.shared.db.lock().await;
        self.shared.presence.reset_all(&db, viewer)
    }

    // ---- queries ----

    pub async fn rooms_for(&self, user: Uuid) -> Result<Vec<Room>> {
        Ok(self.shared.db.lock().await.list_rooms_for_user(user)?)
    }

    pub async fn members(&self, room_id: Uuid) -> Result<Vec<MemberInfo>> {
        self.authority(|a| a.members(room_id)).await
    }

    pub async fn capabilities(&self, viewer: Uuid, room_id: Uuid) -> Result<Capabilities> {
        self.authority(|a| a.capabilities(viewer, room_id)).await
    }

    // ---- subscriptions ----

    pub async fn subscribe_messages(&self, room_id: Uuid, viewer: Uuid) -> Result<MessageSubscription> {
        MessageSubscription::start(self.shared.clone(), room_id, viewer).await
    }

    /// Member list with roles and permissions
    pub async fn subscribe_members(&self, room_id: Uuid) -> Result<Subscription<Vec<MemberInfo>>> {
        let config = self.shared.config.clone();
        spawn_reloader(
            self.shared.clone(),
            self.shared.hub.subscribe(room_id),
            move |db: &Database| MembershipAuthority::new(db, &config).members(room_id),
        )
        .await
    }

    /// What `viewer` may currently do in the room
    pub async fn subscribe_capabilities(
        &self,
        room_id: Uuid,
        viewer: Uuid,
    ) -> Result<Subscription<Capabilities>> {
        let config = self.shared.config.clone();
        spawn_reloader(
            self.shared.clone(),
            self.shared.hub.subscribe(room_id),
            move |db: &Database| MembershipAuthority::new(db, &config).capabilities(viewer, room_id),
        )
        .await
    }

    /// Unread counter per room for `viewer`
    pub async fn subscribe_unread_counts(
        &self,
        viewer: Uuid,
    ) -> Result<Subscription<BTreeMap<Uuid, u32>>> {
        spawn_reloader(
            self.shared.clone(),
            self.shared.hub.subscribe_user(viewer),
            move |db: &Database| {
                Ok(db
                    .list_memberships_for_user(viewer)?
                    .into_iter()
                    .filter(|m| m.is_active())
                    .map(|m| (m.room_id, m.unread_count))
                    .collect())
            },
        )
        .await
    }

    /// The viewer's room list, newest activity first
    pub async fn subscribe_rooms(&self, viewer: Uuid) -> Result<Subscription<Vec<Room>>> {
        spawn_reloader(
            self.shared.clone(),
            self.shared.hub.subscribe_user(viewer),
            move |db: &Database| db.list_rooms_for_user(viewer),
        )
        .await
    }

    /// Open a room view for `viewer`
    pub async fn open_room(&self, room_id: Uuid, viewer: Uuid) -> Result<RoomSession> {
        let session = RoomSession::open(self.clone(), room_id, viewer).await?;
        info!(room_id = %room_id, viewer = %viewer, "Room opened");
        Ok(session)
    }
}
