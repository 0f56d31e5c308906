//! Membership Authority
//!
//! Validates and applies every membership, role, and room-setting
//! transition. Each operation authorizes through [`crate::permissions`],
//! applies its writes inside one store transaction, checks the room
//! invariants before commit, and records a system message in the room's
//! stream.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::ChorusConfig;
use crate::error::{Error, Result};
use crate::invariants::check_room_invariants;
use crate::models::{
    generate_invite_code, normalize_invite_code, MemberInfo, Membership, MembershipStatus,
    Message, PermissionSet, Room, RoomRole, SystemAction, SystemEvent,
};
use crate::permissions::{authorize, AuthContext, Capabilities, RoomAction};
use crate::storage::Storage;

const INVITE_CODE_ATTEMPTS: usize = 8;

/// Result of a successful `leave`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The departing user was the last active member and the room is gone
    pub room_deleted: bool,
}

pub struct MembershipAuthority<'a, S: Storage> {
    store: &'a S,
    config: &'a ChorusConfig,
}

impl<'a, S: Storage> MembershipAuthority<'a, S> {
    pub fn new(store: &'a S, config: &'a ChorusConfig) -> Self {
        Self { store, config }
    }

    // ---- lookups ----

    fn room(&self, room_id: Uuid) -> Result<Room> {
        self.store
            .find_room(room_id)?
            .ok_or_else(|| Error::not_found(format!("room {}", room_id)))
    }

    fn group(&self, room_id: Uuid) -> Result<Room> {
        let room = self.room(room_id)?;
        if !room.is_group() {
            return Err(Error::invalid("operation only applies to group rooms"));
        }
        Ok(room)
    }

    /// The acting user's membership, which must be active
    fn actor(&self, room_id: Uuid, user_id: Uuid) -> Result<Membership> {
        match self.store.find_membership(room_id, user_id)? {
            Some(m) if m.is_active() => Ok(m),
            _ => Err(Error::denied("you are not a member of this room")),
        }
    }

    fn membership(&self, room_id: Uuid, user_id: Uuid) -> Result<Membership> {
        self.store
            .find_membership(room_id, user_id)?
            .ok_or_else(|| Error::not_found(format!("membership of {} in {}", user_id, room_id)))
    }

    /// Target of a role operation, which must be active
    fn active_target(&self, room_id: Uuid, user_id: Uuid) -> Result<Membership> {
        let target = self.membership(room_id, user_id)?;
        if !target.is_active() {
            let name = self.store.display_name(user_id)?;
            return Err(Error::invariant(format!("{} is not active", name)));
        }
        Ok(target)
    }

    fn context<'r>(&self, room: &'r Room) -> AuthContext<'r> {
        AuthContext::new(room).with_invite_policy(self.config.invite_policy)
    }

    fn unique_invite_code(&self) -> Result<String> {
        for _ in 0..INVITE_CODE_ATTEMPTS {
            let code = generate_invite_code();
            if self.store.find_room_by_invite_code(&code)?.is_none() {
                return Ok(code);
            }
        }
        Err(Error::invariant("could not allocate a unique invite code"))
    }

    /// Display names of active members in `room_id` that `user` has blocked
    fn blocked_members_present(&self, user: Uuid, room_id: Uuid) -> Result<Vec<String>> {
        let blocked = self.store.blocked_ids(user)?;
        if blocked.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .list_memberships(room_id)?
            .into_iter()
            .filter(|m| m.is_active() && blocked.contains(&m.user_id))
            .map(|m| self.store.display_name(m.user_id))
            .collect()
    }

    fn verify(&self, room_id: Uuid) -> Result<()> {
        check_room_invariants(
            &self.store.list_memberships(room_id)?,
            self.config.max_sub_managers,
        )
    }

    fn post_system(
        &self,
        room: &Room,
        action: SystemAction,
        actor: Option<Uuid>,
        target: Option<Uuid>,
    ) -> Result<Message> {
        let actor_name = actor.map(|id| self.store.display_name(id)).transpose()?;
        let target_name = target.map(|id| self.store.display_name(id)).transpose()?;
        let body = describe(
            action,
            actor_name.as_deref().unwrap_or_default(),
            target_name.as_deref().unwrap_or_default(),
            room,
        );

        let event = SystemEvent {
            action,
            actor_id: actor,
            target_id: target,
        };
        let mut message = Message::system(room.id, room.kind, body, event);
        self.store.append_message(&mut message)?;
        self.store
            .update_room_preview(room.id, &message.body, message.created_at)?;
        Ok(message)
    }

    // ---- room lifecycle ----

    /// Create a group room owned by `creator`, inviting `invitees`
    #[instrument(skip(self, invitees), fields(invitees = invitees.len()))]
    pub fn create_group(
        &self,
        creator: Uuid,
        name: &str,
        invitees: &[Uuid],
        is_public: bool,
    ) -> Result<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("group name cannot be empty"));
        }

        let mut room = Room::new_group(name, creator, is_public);
        room.invite_code = if is_public {
            Some(self.unique_invite_code()?)
        } else {
            None
        };
        let owner = Membership::active(room.id, creator, RoomRole::Owner);
        let targets = self.screen_invitees(&room, creator, invitees)?;

        self.store.atomically(|store| {
            store.create_room(&room)?;
            store.save_membership(&owner)?;
            self.post_system(&room, SystemAction::GroupCreated, Some(creator), None)?;
            for target in &targets {
                self.record_invite(&room, creator, *target)?;
            }
            self.verify(room.id)
        })?;

        info!(room_id = %room.id, "Group created");
        Ok(room)
    }

    /// Create, reopen, or return the DM between `opener` and `peer`
    #[instrument(skip(self))]
    pub fn open_dm(&self, opener: Uuid, peer: Uuid) -> Result<Room> {
        if opener == peer {
            return Err(Error::invalid("cannot open a conversation with yourself"));
        }

        let room_id = Room::dm_id(opener, peer);
        if let Some(room) = self.store.find_room(room_id)? {
            let mut mine = self.membership(room_id, opener)?;
            if !mine.is_active() {
                let has_owner = self
                    .store
                    .list_memberships(room_id)?
                    .iter()
                    .any(|m| m.is_owner());
                mine.status = MembershipStatus::Active;
                mine.role = if has_owner {
                    RoomRole::Member
                } else {
                    RoomRole::Owner
                };
                mine.joined_at = Utc::now();
                self.store.atomically(|store| {
                    store.save_membership(&mine)?;
                    self.verify(room_id)
                })?;
                debug!(room_id = %room_id, "Rejoined direct conversation");
            }
            return Ok(room);
        }

        let room = Room::new_dm(opener, peer);
        self.store.atomically(|store| {
            store.create_room(&room)?;
            store.save_membership(&Membership::active(room.id, opener, RoomRole::Owner))?;
            store.save_membership(&Membership::active(room.id, peer, RoomRole::Member))?;
            self.verify(room.id)
        })?;
        Ok(room)
    }

    /// Delete a group room with all of its memberships and messages
    #[instrument(skip(self))]
    pub fn delete_room(&self, actor: Uuid, room_id: Uuid) -> Result<()> {
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::DeleteRoom, &self.context(&room)).into_result()?;

        self.store.atomically(|store| store.delete_room(room_id))?;
        info!(room_id = %room_id, "Room deleted");
        Ok(())
    }

    // ---- invitations ----

    /// Reject duplicates and users the inviter has blocked
    fn screen_invitees(&self, room: &Room, inviter: Uuid, targets: &[Uuid]) -> Result<Vec<Uuid>> {
        let unique: BTreeSet<Uuid> = targets.iter().copied().collect();
        if unique.contains(&inviter) {
            return Err(Error::invalid("you cannot invite yourself"));
        }

        let mut blocked_names = Vec::new();
        for target in &unique {
            if let Some(existing) = self.store.find_membership(room.id, *target)? {
                let name = self.store.display_name(*target)?;
                match existing.status {
                    MembershipStatus::Active => {
                        return Err(Error::invariant(format!("{} is already a member", name)))
                    }
                    MembershipStatus::Pending => {
                        return Err(Error::invariant(format!("{} is already invited", name)))
                    }
                    _ => {}
                }
            }
            if self.store.is_blocked(inviter, *target)? {
                blocked_names.push(self.store.display_name(*target)?);
            }
        }

        if !blocked_names.is_empty() {
            return Err(Error::BlockedByYou {
                names: blocked_names,
            });
        }
        Ok(unique.into_iter().collect())
    }

    /// Write a fresh pending record. An invitee who has blocked the inviter
    /// is invited quietly: the room stays hidden from their list.
    fn record_invite(&self, room: &Room, inviter: Uuid, target: Uuid) -> Result<Membership> {
        let mut pending = Membership::pending(room.id, target, inviter);
        pending.blocked_invite = self.store.is_blocked(target, inviter)?;
        self.store.save_membership(&pending)?;
        self.post_system(room, SystemAction::MemberInvited, Some(inviter), Some(target))?;
        Ok(pending)
    }

    /// Invite `targets` into a group room as pending members
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub fn invite(&self, actor: Uuid, room_id: Uuid, targets: &[Uuid]) -> Result<Vec<Membership>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::InviteMembers, &self.context(&room)).into_result()?;

        let targets = self.screen_invitees(&room, actor, targets)?;
        let invited = self.store.atomically(|_| {
            let invited = targets
                .iter()
                .map(|target| self.record_invite(&room, actor, *target))
                .collect::<Result<Vec<_>>>()?;
            self.verify(room_id)?;
            Ok(invited)
        })?;

        info!(room_id = %room_id, count = invited.len(), "Members invited");
        Ok(invited)
    }

    fn activate(
        &self,
        room: &Room,
        mut membership: Membership,
        action: SystemAction,
    ) -> Result<Membership> {
        membership.status = MembershipStatus::Active;
        membership.role = RoomRole::Member;
        membership.permissions.clear();
        membership.blocked_invite = false;
        membership.joined_at = Utc::now();
        membership.unread_count = 0;

        self.store.atomically(|store| {
            store.save_membership(&membership)?;
            self.post_system(room, action, None, Some(membership.user_id))?;
            self.verify(room.id)
        })?;
        Ok(membership)
    }

    /// Accept a pending invitation. Fails with `BlockedMembersPresent` when
    /// active members are on the acceptor's block list, unless `force_join`.
    #[instrument(skip(self))]
    pub fn accept(&self, user: Uuid, room_id: Uuid, force_join: bool) -> Result<Membership> {
        let room = self.group(room_id)?;
        let pending = self.membership(room_id, user)?;
        if pending.status != MembershipStatus::Pending {
            return Err(Error::invariant("no pending invitation"));
        }

        if !force_join {
            let names = self.blocked_members_present(user, room_id)?;
            if !names.is_empty() {
                return Err(Error::BlockedMembersPresent { names });
            }
        }

        let active = self.activate(&room, pending, SystemAction::InvitationAccepted)?;
        info!(room_id = %room_id, "Invitation accepted");
        Ok(active)
    }

    /// Join a public room by its invite code
    #[instrument(skip(self))]
    pub fn join_by_code(&self, user: Uuid, code: &str, force_join: bool) -> Result<Room> {
        let code = normalize_invite_code(code);
        let invalid = || Error::not_found("invalid invite code");
        let room = self
            .store
            .find_room_by_invite_code(&code)?
            .filter(|r| r.is_group())
            .ok_or_else(invalid)?;
        if !room.is_public {
            return Err(Error::denied("private rooms cannot be joined by code"));
        }

        let existing = self.store.find_membership(room.id, user)?;
        if let Some(m) = &existing {
            // A quietly blocked invitee must not learn the room exists
            if m.blocked_invite {
                return Err(invalid());
            }
            match m.status {
                MembershipStatus::Active => {
                    return Err(Error::invariant("already a member of this room"))
                }
                MembershipStatus::Pending => {
                    self.accept(user, room.id, force_join)?;
                    return Ok(room);
                }
                MembershipStatus::Rejected => {
                    return Err(Error::denied(
                        "you declined this invitation; ask the owner to invite you again",
                    ))
                }
                MembershipStatus::Kicked | MembershipStatus::Left => {}
            }
        }

        if !force_join {
            let names = self.blocked_members_present(user, room.id)?;
            if !names.is_empty() {
                return Err(Error::BlockedMembersPresent { names });
            }
        }

        // Rejoining keeps the viewer's own mute list
        let mut fresh = Membership::active(room.id, user, RoomRole::Member);
        fresh.muted_users = existing.map(|m| m.muted_users).unwrap_or_default();
        self.activate(&room, fresh, SystemAction::JoinedByInviteCode)?;
        info!(room_id = %room.id, "Joined by invite code");
        Ok(room)
    }

    /// Decline a pending invitation
    #[instrument(skip(self))]
    pub fn reject(&self, user: Uuid, room_id: Uuid) -> Result<()> {
        let mut pending = self.membership(room_id, user)?;
        if pending.status != MembershipStatus::Pending {
            return Err(Error::invariant("no pending invitation"));
        }
        pending.status = MembershipStatus::Rejected;
        self.store.save_membership(&pending)?;
        debug!(room_id = %room_id, "Invitation rejected");
        Ok(())
    }

    /// Withdraw a pending or rejected invitation, removing the record
    #[instrument(skip(self))]
    pub fn cancel_invitation(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::CancelInvitation, &self.context(&room)).into_result()?;

        let record = self.membership(room_id, target)?;
        if !matches!(
            record.status,
            MembershipStatus::Pending | MembershipStatus::Rejected
        ) {
            return Err(Error::invariant("only open or declined invitations can be cancelled"));
        }
        self.store.remove_membership(room_id, target)?;
        debug!(room_id = %room_id, target = %target, "Invitation cancelled");
        Ok(())
    }

    // ---- departures ----

    /// Remove an active member. A second kick of the same target fails
    /// with "not active".
    #[instrument(skip(self))]
    pub fn kick(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        if actor == target {
            return Err(Error::invariant("you cannot kick yourself"));
        }
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        let mut victim = self.membership(room_id, target)?;
        authorize(
            &me,
            RoomAction::KickMember,
            &self.context(&room).with_target(&victim),
        )
        .into_result()?;
        if !victim.is_active() {
            let name = self.store.display_name(target)?;
            return Err(Error::invariant(format!("{} is not active", name)));
        }

        victim.status = MembershipStatus::Kicked;
        victim.demote();
        victim.in_room = false;
        self.store.atomically(|store| {
            store.save_membership(&victim)?;
            self.post_system(&room, SystemAction::MemberKicked, Some(actor), Some(target))?;
            self.verify(room_id)
        })?;

        info!(room_id = %room_id, target = %target, "Member kicked");
        Ok(())
    }

    /// Leave a room. Owners must transfer ownership first unless nobody
    /// else is active, in which case the room is deleted.
    #[instrument(skip(self))]
    pub fn leave(&self, user: Uuid, room_id: Uuid) -> Result<LeaveOutcome> {
        let room = self.room(room_id)?;
        let mut me = self.membership(room_id, user)?;
        if !me.is_active() {
            return Err(Error::invariant("not an active member"));
        }

        let memberships = self.store.list_memberships(room_id)?;
        let others: Vec<&Membership> = memberships
            .iter()
            .filter(|m| m.is_active() && m.user_id != user)
            .collect();

        if others.is_empty() {
            self.store.atomically(|store| store.delete_room(room_id))?;
            info!(room_id = %room_id, "Last member left, room deleted");
            return Ok(LeaveOutcome { room_deleted: true });
        }

        if room.is_dm() {
            let mut peer = others[0].clone();
            let hand_over = me.is_owner();
            me.status = MembershipStatus::Left;
            me.in_room = false;
            if hand_over {
                me.role = RoomRole::Member;
                peer.role = RoomRole::Owner;
            }
            self.store.atomically(|store| {
                store.save_membership(&me)?;
                if hand_over {
                    store.save_membership(&peer)?;
                }
                self.verify(room_id)
            })?;
            return Ok(LeaveOutcome {
                room_deleted: false,
            });
        }

        if me.is_owner() {
            return Err(Error::invariant(
                "transfer ownership before leaving a room with other members",
            ));
        }
        if !room.settings.allow_member_leave {
            return Err(Error::denied("leaving is turned off for this room"));
        }

        me.status = MembershipStatus::Left;
        me.demote();
        me.in_room = false;
        self.store.atomically(|store| {
            store.save_membership(&me)?;
            self.post_system(&room, SystemAction::MemberLeft, None, Some(user))?;
            self.verify(room_id)
        })?;

        info!(room_id = %room_id, "Member left");
        Ok(LeaveOutcome {
            room_deleted: false,
        })
    }

    // ---- roles ----

    /// Hand the owner role to another active member in one update
    #[instrument(skip(self))]
    pub fn transfer_ownership(&self, actor: Uuid, room_id: Uuid, new_owner: Uuid) -> Result<()> {
        let mut room = self.group(room_id)?;
        let mut me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::TransferOwnership, &self.context(&room)).into_result()?;
        if new_owner == actor {
            return Err(Error::invalid("you already own this room"));
        }
        let mut heir = self.active_target(room_id, new_owner)?;

        heir.role = RoomRole::Owner;
        heir.permissions.clear();
        me.demote();
        room.owner_id = new_owner;
        room.touch();

        self.store.atomically(|store| {
            store.save_membership(&me)?;
            store.save_membership(&heir)?;
            store.update_room(&room)?;
            self.post_system(
                &room,
                SystemAction::OwnershipTransferred,
                Some(actor),
                Some(new_owner),
            )?;
            self.verify(room_id)
        })?;

        info!(room_id = %room_id, new_owner = %new_owner, "Ownership transferred");
        Ok(())
    }

    /// Promote an active plain member to sub-manager with `permissions`
    #[instrument(skip(self, permissions))]
    pub fn appoint_sub_manager(
        &self,
        actor: Uuid,
        room_id: Uuid,
        target: Uuid,
        permissions: PermissionSet,
    ) -> Result<()> {
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ManageSubManagers, &self.context(&room)).into_result()?;

        let mut member = self.active_target(room_id, target)?;
        if !member.is_plain_member() {
            return Err(Error::invariant(format!(
                "{} is already {}",
                self.store.display_name(target)?,
                member.role.display_name().to_lowercase()
            )));
        }
        let current = self
            .store
            .list_memberships(room_id)?
            .iter()
            .filter(|m| m.is_sub_manager())
            .count();
        if current >= self.config.max_sub_managers {
            return Err(Error::invariant(format!(
                "a room can have at most {} sub-managers",
                self.config.max_sub_managers
            )));
        }

        member.role = RoomRole::SubManager;
        member.permissions = permissions;
        self.store.atomically(|store| {
            store.save_membership(&member)?;
            self.post_system(
                &room,
                SystemAction::SubManagerAppointed,
                Some(actor),
                Some(target),
            )?;
            self.verify(room_id)
        })?;

        info!(room_id = %room_id, target = %target, "Sub-manager appointed");
        Ok(())
    }

    /// Return a sub-manager to plain member
    #[instrument(skip(self))]
    pub fn remove_sub_manager(&self, actor: Uuid, room_id: Uuid, target: Uuid) -> Result<()> {
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ManageSubManagers, &self.context(&room)).into_result()?;

        let mut member = self.active_target(room_id, target)?;
        if !member.is_sub_manager() {
            return Err(Error::invariant("target is not a sub-manager"));
        }

        member.demote();
        self.store.atomically(|store| {
            store.save_membership(&member)?;
            self.post_system(
                &room,
                SystemAction::SubManagerRemoved,
                Some(actor),
                Some(target),
            )?;
            self.verify(room_id)
        })?;

        info!(room_id = %room_id, target = %target, "Sub-manager removed");
        Ok(())
    }

    /// Replace a sub-manager's granted permissions
    #[instrument(skip(self, permissions))]
    pub fn update_sub_manager_permissions(
        &self,
        actor: Uuid,
        room_id: Uuid,
        target: Uuid,
        permissions: PermissionSet,
    ) -> Result<()> {
        let room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ManageSubManagers, &self.context(&room)).into_result()?;

        let mut member = self.active_target(room_id, target)?;
        if !member.is_sub_manager() {
            return Err(Error::invariant("target is not a sub-manager"));
        }
        member.permissions = permissions;
        self.store.atomically(|store| {
            store.save_membership(&member)?;
            self.verify(room_id)
        })
    }

    // ---- room settings ----

    /// Toggle public/private. Going public provisions an invite code; going
    /// private invalidates it.
    #[instrument(skip(self))]
    pub fn update_room_visibility(
        &self,
        actor: Uuid,
        room_id: Uuid,
        is_public: bool,
    ) -> Result<Room> {
        let mut room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ChangeVisibility, &self.context(&room)).into_result()?;
        if room.is_public == is_public {
            return Ok(room);
        }

        room.is_public = is_public;
        room.invite_code = if is_public {
            Some(self.unique_invite_code()?)
        } else {
            None
        };
        room.touch();
        self.store.atomically(|store| {
            store.update_room(&room)?;
            self.post_system(&room, SystemAction::RoomTypeChanged, Some(actor), None)?;
            Ok(())
        })?;

        info!(room_id = %room_id, is_public, "Room visibility changed");
        Ok(room)
    }

    #[instrument(skip(self))]
    pub fn rename_room(&self, actor: Uuid, room_id: Uuid, name: &str) -> Result<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("group name cannot be empty"));
        }
        let mut room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ManageSettings, &self.context(&room)).into_result()?;
        if room.name == name {
            return Ok(room);
        }

        room.name = name.to_string();
        room.touch();
        self.store.atomically(|store| {
            store.update_room(&room)?;
            self.post_system(&room, SystemAction::RoomRenamed, Some(actor), None)?;
            Ok(())
        })?;
        Ok(room)
    }

    /// Store the reference returned by the upload service
    #[instrument(skip(self))]
    pub fn update_room_image(
        &self,
        actor: Uuid,
        room_id: Uuid,
        image_ref: Option<String>,
    ) -> Result<Room> {
        let mut room = self.group(room_id)?;
        let me = self.actor(room_id, actor)?;
        authorize(&me, RoomAction::ManageSettings, &self.context(&room)).into_result()?;

        room.image_ref = image_ref;
        room.touch();
        self.store.update_room(&room)?;
        Ok(room)
    }

    // ---- views ----

    /// Membership rows for the member list, in join order
    pub fn members(&self, room_id: Uuid) -> Result<Vec<MemberInfo>> {
        self.store
            .list_memberships(room_id)?
            .into_iter()
            .map(|m| {
                Ok(MemberInfo {
                    display_name: self.store.display_name(m.user_id)?,
                    user_id: m.user_id,
                    role: m.role,
                    status: m.status,
                    permissions: m.permissions,
                    in_room: m.in_room,
                })
            })
            .collect()
    }

    /// What `viewer` may currently do in the room
    pub fn capabilities(&self, viewer: Uuid, room_id: Uuid) -> Result<Capabilities> {
        let room = self.room(room_id)?;
        Ok(match self.store.find_membership(room_id, viewer)? {
            Some(m) => Capabilities::for_member(&m, &room, self.config.invite_policy),
            None => Capabilities::default(),
        })
    }
}

fn describe(action: SystemAction, actor: &str, target: &str, room: &Room) -> String {
    match action {
        SystemAction::GroupCreated => format!("{} created the group", actor),
        SystemAction::MemberInvited => format!("{} invited {}", actor, target),
        SystemAction::InvitationAccepted => format!("{} joined the conversation", target),
        SystemAction::JoinedByInviteCode => {
            format!("{} joined the conversation with an invite code", target)
        }
        SystemAction::MemberLeft => format!("{} left the room", target),
        SystemAction::MemberKicked => format!("{} removed {} from the room", actor, target),
        SystemAction::OwnershipTransferred => {
            format!("{} made {} the owner", actor, target)
        }
        SystemAction::SubManagerAppointed => {
            format!("{} made {} a sub-manager", actor, target)
        }
        SystemAction::SubManagerRemoved => {
            format!("{} is no longer a sub-manager", target)
        }
        SystemAction::RoomTypeChanged => {
            let kind = if room.is_public { "public" } else { "private" };
            format!("{} made the room {}", actor, kind)
        }
        SystemAction::RoomRenamed => format!("{} renamed the room to \"{}\"", actor, room.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvitePolicy;
    use crate::models::{Permission, User};
    use crate::storage::{
        Database, MembershipRepository, MessageRepository, RelationRepository, RoomRepository,
        UserRepository,
    };

    struct Fixture {
        db: Database,
        config: ChorusConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                config: ChorusConfig::default(),
            }
        }

        fn authority(&self) -> MembershipAuthority<'_, Database> {
            MembershipAuthority::new(&self.db, &self.config)
        }

        fn user(&self, name: &str) -> Uuid {
            let user = User::new(name);
            self.db.save_user(&user).unwrap();
            user.id
        }

        /// Group owned by `owner` with `members` already active
        fn group(&self, owner: Uuid, members: &[Uuid]) -> Room {
            let auth = self.authority();
            let room = auth.create_group(owner, "Study group", members, false).unwrap();
            for m in members {
                auth.accept(*m, room.id, false).unwrap();
            }
            room
        }

        fn status(&self, room: &Room, user: Uuid) -> MembershipStatus {
            self.db.find_membership(room.id, user).unwrap().unwrap().status
        }

        fn role(&self, room: &Room, user: Uuid) -> RoomRole {
            self.db.find_membership(room.id, user).unwrap().unwrap().role
        }

        fn assert_invariants(&self, room: &Room) {
            check_room_invariants(&self.db.list_memberships(room.id).unwrap(), 3).unwrap();
        }
    }

    fn perms(list: &[Permission]) -> PermissionSet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_create_group_invites_pending() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let friend = fx.user("friend");
        let room = fx
            .authority()
            .create_group(owner, "  Weekend  ", &[friend], false)
            .unwrap();

        assert_eq!(room.name, "Weekend");
        assert_eq!(fx.role(&room, owner), RoomRole::Owner);
        assert_eq!(fx.status(&room, friend), MembershipStatus::Pending);

        let (messages, _) = fx.db.latest_messages(room.id, 30, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_system()));
        assert_eq!(messages[1].body, "owner invited friend");
    }

    #[test]
    fn test_public_group_code_join() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let joiner = fx.user("joiner");
        let room = fx.authority().create_group(owner, "Open", &[], true).unwrap();
        let code = room.invite_code.clone().unwrap();

        let joined = fx
            .authority()
            .join_by_code(joiner, &code.to_lowercase(), false)
            .unwrap();
        assert_eq!(joined.id, room.id);
        assert_eq!(fx.status(&room, joiner), MembershipStatus::Active);

        let again = fx.authority().join_by_code(joiner, &code, false);
        assert!(matches!(again, Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_code_join_rules() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let decliner = fx.user("decliner");
        let hider = fx.user("hider");
        let room = fx.authority().create_group(owner, "Open", &[], true).unwrap();
        let code = room.invite_code.clone().unwrap();

        // Public rooms do not allow member invites by default; the owner can
        fx.authority().invite(owner, room.id, &[decliner]).unwrap();
        fx.authority().reject(decliner, room.id).unwrap();
        assert!(matches!(
            fx.authority().join_by_code(decliner, &code, false),
            Err(Error::AuthorizationDenied(_))
        ));

        fx.db.block(hider, owner).unwrap();
        fx.authority().invite(owner, room.id, &[hider]).unwrap();
        assert!(matches!(
            fx.authority().join_by_code(hider, &code, false),
            Err(Error::NotFound(_))
        ));

        assert!(matches!(
            fx.authority().join_by_code(decliner, "INV-NOPE00", false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_invite_rejected() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let a = fx.user("a");
        let room = fx.group(owner, &[a]);
        let b = fx.user("b");

        assert!(matches!(
            fx.authority().invite(owner, room.id, &[a]),
            Err(Error::InvariantViolation(_))
        ));
        fx.authority().invite(owner, room.id, &[b]).unwrap();
        assert!(matches!(
            fx.authority().invite(a, room.id, &[b]),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_invite_blocked_by_you() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let pest = fx.user("pest");
        let room = fx.group(owner, &[]);
        fx.db.block(owner, pest).unwrap();

        match fx.authority().invite(owner, room.id, &[pest]) {
            Err(Error::BlockedByYou { names }) => assert_eq!(names, vec!["pest".to_string()]),
            other => panic!("expected BlockedByYou, got {:?}", other),
        }
    }

    #[test]
    fn test_invite_policy_owner_only() {
        let mut fx = Fixture::new();
        fx.config.invite_policy = InvitePolicy::OwnerOnly;
        let owner = fx.user("owner");
        let member = fx.user("member");
        let outsider = fx.user("outsider");
        let room = fx.group(owner, &[member]);

        assert!(matches!(
            fx.authority().invite(member, room.id, &[outsider]),
            Err(Error::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn test_accept_with_blocked_member_present() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let rival = fx.user("rival");
        let joiner = fx.user("joiner");
        let room = fx.group(owner, &[rival]);
        fx.authority().invite(owner, room.id, &[joiner]).unwrap();
        fx.db.block(joiner, rival).unwrap();

        let err = fx.authority().accept(joiner, room.id, false).unwrap_err();
        assert!(err.is_recoverable());
        match err {
            Error::BlockedMembersPresent { names } => assert_eq!(names, vec!["rival".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.status(&room, joiner), MembershipStatus::Pending);

        fx.authority().accept(joiner, room.id, true).unwrap();
        assert_eq!(fx.status(&room, joiner), MembershipStatus::Active);
    }

    #[test]
    fn test_cancel_invitation_removes_record() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let member = fx.user("member");
        let invitee = fx.user("invitee");
        let room = fx.group(owner, &[member]);
        fx.authority().invite(owner, room.id, &[invitee]).unwrap();

        assert!(matches!(
            fx.authority().cancel_invitation(member, room.id, invitee),
            Err(Error::AuthorizationDenied(_))
        ));
        fx.authority().cancel_invitation(owner, room.id, invitee).unwrap();
        assert!(fx.db.find_membership(room.id, invitee).unwrap().is_none());

        assert!(matches!(
            fx.authority().cancel_invitation(owner, room.id, member),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_sub_manager_kick_scenario() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let b = fx.user("b");
        let c = fx.user("c");
        let d = fx.user("d");
        let room = fx.group(owner, &[b, c, d]);
        let auth = fx.authority();

        auth.appoint_sub_manager(owner, room.id, b, perms(&[Permission::KickMember]))
            .unwrap();
        auth.appoint_sub_manager(owner, room.id, d, PermissionSet::new())
            .unwrap();

        auth.kick(b, room.id, c).unwrap();
        assert_eq!(fx.status(&room, c), MembershipStatus::Kicked);

        assert!(matches!(
            auth.kick(b, room.id, d),
            Err(Error::AuthorizationDenied(_))
        ));
        assert_eq!(fx.status(&room, d), MembershipStatus::Active);
        fx.assert_invariants(&room);
    }

    #[test]
    fn test_double_kick_is_not_active() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let target = fx.user("target");
        let room = fx.group(owner, &[target]);

        fx.authority().kick(owner, room.id, target).unwrap();
        let second = fx.authority().kick(owner, room.id, target).unwrap_err();
        assert!(matches!(second, Error::InvariantViolation(ref m) if m.contains("not active")));
    }

    #[test]
    fn test_self_kick_is_invariant_violation() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let room = fx.group(owner, &[]);
        assert!(matches!(
            fx.authority().kick(owner, room.id, owner),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_owner_leave_requires_transfer() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let x = fx.user("x");
        let y = fx.user("y");
        let room = fx.group(owner, &[x, y]);
        let auth = fx.authority();

        assert!(matches!(
            auth.leave(owner, room.id),
            Err(Error::InvariantViolation(_))
        ));

        auth.transfer_ownership(owner, room.id, x).unwrap();
        let outcome = auth.leave(owner, room.id).unwrap();
        assert!(!outcome.room_deleted);

        assert_eq!(fx.role(&room, x), RoomRole::Owner);
        assert_eq!(fx.status(&room, owner), MembershipStatus::Left);
        assert_eq!(fx.db.find_room(room.id).unwrap().unwrap().owner_id, x);
        fx.assert_invariants(&room);
    }

    #[test]
    fn test_transfer_to_sub_manager_clears_permissions() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let sub = fx.user("sub");
        let room = fx.group(owner, &[sub]);
        let auth = fx.authority();
        auth.appoint_sub_manager(owner, room.id, sub, perms(&Permission::ALL))
            .unwrap();

        auth.transfer_ownership(owner, room.id, sub).unwrap();
        let heir = fx.db.find_membership(room.id, sub).unwrap().unwrap();
        assert_eq!(heir.role, RoomRole::Owner);
        assert!(heir.permissions.is_empty());
        assert_eq!(fx.role(&room, owner), RoomRole::Member);
        fx.assert_invariants(&room);
    }

    #[test]
    fn test_transfer_to_inactive_rejected() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let invitee = fx.user("invitee");
        let room = fx.authority().create_group(owner, "G", &[invitee], false).unwrap();
        assert!(matches!(
            fx.authority().transfer_ownership(owner, room.id, invitee),
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(fx.role(&room, owner), RoomRole::Owner);
    }

    #[test]
    fn test_last_member_leaving_deletes_room() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let room = fx.group(owner, &[]);
        let outcome = fx.authority().leave(owner, room.id).unwrap();
        assert!(outcome.room_deleted);
        assert!(fx.db.find_room(room.id).unwrap().is_none());
    }

    #[test]
    fn test_member_leave_respects_setting() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let member = fx.user("member");
        let room = fx.group(owner, &[member]);

        let mut locked = fx.db.find_room(room.id).unwrap().unwrap();
        locked.settings.allow_member_leave = false;
        fx.db.update_room(&locked).unwrap();
        assert!(matches!(
            fx.authority().leave(member, room.id),
            Err(Error::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn test_sub_manager_ceiling() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let members: Vec<Uuid> = (0..4).map(|i| fx.user(&format!("m{}", i))).collect();
        let room = fx.group(owner, &members);
        let auth = fx.authority();

        for m in &members[..3] {
            auth.appoint_sub_manager(owner, room.id, *m, PermissionSet::new())
                .unwrap();
        }
        assert!(matches!(
            auth.appoint_sub_manager(owner, room.id, members[3], PermissionSet::new()),
            Err(Error::InvariantViolation(_))
        ));

        auth.remove_sub_manager(owner, room.id, members[0]).unwrap();
        auth.appoint_sub_manager(owner, room.id, members[3], PermissionSet::new())
            .unwrap();
        fx.assert_invariants(&room);
    }

    #[test]
    fn test_only_owner_manages_sub_managers() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let sub = fx.user("sub");
        let other = fx.user("other");
        let room = fx.group(owner, &[sub, other]);
        let auth = fx.authority();
        auth.appoint_sub_manager(owner, room.id, sub, perms(&Permission::ALL))
            .unwrap();

        assert!(matches!(
            auth.appoint_sub_manager(sub, room.id, other, PermissionSet::new()),
            Err(Error::AuthorizationDenied(_))
        ));

        auth.update_sub_manager_permissions(owner, room.id, sub, perms(&[Permission::ManageMessages]))
            .unwrap();
        let updated = fx.db.find_membership(room.id, sub).unwrap().unwrap();
        assert_eq!(updated.permissions, perms(&[Permission::ManageMessages]));
    }

    #[test]
    fn test_visibility_toggle_manages_code() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let member = fx.user("member");
        let room = fx.group(owner, &[member]);
        let auth = fx.authority();

        assert!(matches!(
            auth.update_room_visibility(member, room.id, true),
            Err(Error::AuthorizationDenied(_))
        ));

        let public = auth.update_room_visibility(owner, room.id, true).unwrap();
        let code = public.invite_code.clone().unwrap();
        assert!(code.starts_with("INV-"));

        let private = auth.update_room_visibility(owner, room.id, false).unwrap();
        assert!(private.invite_code.is_none());
        assert!(fx.db.find_room_by_invite_code(&code).unwrap().is_none());
    }

    #[test]
    fn test_rename_requires_manage_settings() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let sub = fx.user("sub");
        let room = fx.group(owner, &[sub]);
        let auth = fx.authority();

        auth.appoint_sub_manager(owner, room.id, sub, PermissionSet::new())
            .unwrap();
        assert!(auth.rename_room(sub, room.id, "Nope").is_err());

        auth.update_sub_manager_permissions(owner, room.id, sub, perms(&[Permission::ManageSettings]))
            .unwrap();
        let renamed = auth.rename_room(sub, room.id, "Book club").unwrap();
        assert_eq!(renamed.name, "Book club");
        // Visibility stays with the owner
        assert!(auth.update_room_visibility(sub, room.id, true).is_err());
    }

    #[test]
    fn test_delete_room_owner_only() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let member = fx.user("member");
        let room = fx.group(owner, &[member]);

        assert!(fx.authority().delete_room(member, room.id).is_err());
        fx.authority().delete_room(owner, room.id).unwrap();
        assert!(fx.db.find_room(room.id).unwrap().is_none());
        assert!(fx.db.list_memberships(room.id).unwrap().is_empty());
    }

    #[test]
    fn test_dm_open_and_leave() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");
        let auth = fx.authority();

        let room = auth.open_dm(a, b).unwrap();
        assert_eq!(auth.open_dm(b, a).unwrap().id, room.id);
        assert!(auth.open_dm(a, a).is_err());

        // Owner leaves: role passes to the peer
        assert!(!auth.leave(a, room.id).unwrap().room_deleted);
        assert_eq!(fx.role(&room, b), RoomRole::Owner);
        fx.assert_invariants(&room);

        // Reopening rejoins as a member
        auth.open_dm(a, b).unwrap();
        assert_eq!(fx.status(&room, a), MembershipStatus::Active);
        fx.assert_invariants(&room);

        auth.leave(a, room.id).unwrap();
        assert!(auth.leave(b, room.id).unwrap().room_deleted);
        assert!(fx.db.find_room(room.id).unwrap().is_none());
    }

    #[test]
    fn test_members_and_capabilities() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let member = fx.user("member");
        let room = fx.group(owner, &[member]);
        let auth = fx.authority();

        let members = auth.members(room.id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].display_name, "owner");

        let caps = auth.capabilities(owner, room.id).unwrap();
        assert!(caps.is_owner && caps.can_kick);
        let caps = auth.capabilities(member, room.id).unwrap();
        assert!(!caps.can_kick);
        assert_eq!(auth.capabilities(Uuid::new_v4(), room.id).unwrap(), Capabilities::default());
    }

    #[test]
    fn test_kicked_user_can_be_reinvited() {
        let fx = Fixture::new();
        let owner = fx.user("owner");
        let target = fx.user("target");
        let room = fx.group(owner, &[target]);
        let auth = fx.authority();

        auth.kick(owner, room.id, target).unwrap();
        auth.invite(owner, room.id, &[target]).unwrap();
        assert_eq!(fx.status(&room, target), MembershipStatus::Pending);
        auth.accept(target, room.id, false).unwrap();
        assert_eq!(fx.status(&room, target), MembershipStatus::Active);
    }
}
