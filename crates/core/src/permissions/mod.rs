//! Permission system for room operations
//!
//! Every role check goes through [`authorize`]; call sites never inspect
//! roles or sub-manager permission sets on their own.

use uuid::Uuid;

use crate::config::InvitePolicy;
use crate::error::{Error, Result};
use crate::models::{Membership, Permission, Room};

/// Action families that require authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction {
    // Member management
    InviteMembers,
    CancelInvitation,
    KickMember,
    ManageSubManagers,
    TransferOwnership,

    // Messages
    DeleteMessage,

    // Room settings
    ManageSettings,
    ChangeVisibility,
    DeleteRoom,
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert a denial into [`Error::AuthorizationDenied`]
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(Error::AuthorizationDenied(reason)),
        }
    }

    fn deny(reason: &str) -> Self {
        Decision::Deny(reason.to_string())
    }
}

/// What an authorization check may need to know beyond the actor
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub room: &'a Room,
    /// Membership the action is aimed at (kick target, message sender)
    pub target: Option<&'a Membership>,
    /// Author of the message, for message actions
    pub message_sender: Option<Uuid>,
    pub invite_policy: InvitePolicy,
}

impl<'a> AuthContext<'a> {
    pub fn new(room: &'a Room) -> Self {
        Self {
            room,
            target: None,
            message_sender: None,
            invite_policy: InvitePolicy::default(),
        }
    }

    pub fn with_target(mut self, target: &'a Membership) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_message_sender(mut self, sender: Uuid) -> Self {
        self.message_sender = Some(sender);
        self
    }

    pub fn with_invite_policy(mut self, policy: InvitePolicy) -> Self {
        self.invite_policy = policy;
        self
    }
}

/// Decide whether `actor` may perform `action` in the given context
pub fn authorize(actor: &Membership, action: RoomAction, ctx: &AuthContext<'_>) -> Decision {
    if !actor.is_active() {
        return Decision::deny("only active members can do that");
    }

    match action {
        RoomAction::KickMember => authorize_kick(actor, ctx),
        RoomAction::DeleteMessage => authorize_delete(actor, ctx),
        RoomAction::ManageSettings => authorize_settings(actor, ctx),
        RoomAction::InviteMembers => authorize_invite(actor, ctx),
        RoomAction::CancelInvitation
        | RoomAction::ManageSubManagers
        | RoomAction::TransferOwnership
        | RoomAction::ChangeVisibility
        | RoomAction::DeleteRoom => authorize_owner_only(actor, ctx),
    }
}

fn authorize_owner_only(actor: &Membership, ctx: &AuthContext<'_>) -> Decision {
    if ctx.room.is_dm() {
        return Decision::deny("direct conversations have no owner controls");
    }
    if actor.is_owner() {
        Decision::Allow
    } else {
        Decision::deny("only the owner can do that")
    }
}

fn authorize_kick(actor: &Membership, ctx: &AuthContext<'_>) -> Decision {
    if ctx.room.is_dm() {
        return Decision::deny("members cannot be removed from a direct conversation");
    }
    let Some(target) = ctx.target else {
        return Decision::deny("no kick target");
    };
    if target.user_id == actor.user_id {
        return Decision::deny("you cannot kick yourself");
    }
    if actor.is_owner() {
        return Decision::Allow;
    }
    if !actor.has_permission(Permission::KickMember) {
        return Decision::deny("you do not have permission to remove members");
    }
    if !target.is_plain_member() {
        return Decision::deny("sub-managers can only remove plain members");
    }
    Decision::Allow
}

fn authorize_delete(actor: &Membership, ctx: &AuthContext<'_>) -> Decision {
    let Some(sender) = ctx.message_sender else {
        return Decision::deny("no message to delete");
    };
    if sender == actor.user_id {
        return Decision::Allow;
    }
    if ctx.room.is_dm() {
        return Decision::deny("you can only delete your own messages here");
    }
    if actor.is_owner() {
        return Decision::Allow;
    }
    if !actor.has_permission(Permission::ManageMessages) {
        return Decision::deny("you do not have permission to delete this message");
    }
    // A sender with no surviving record is treated as a plain member
    let sender_is_plain = ctx.target.map_or(true, |m| m.is_plain_member());
    if !sender_is_plain {
        return Decision::deny("sub-managers can only delete messages from plain members");
    }
    Decision::Allow
}

fn authorize_settings(actor: &Membership, ctx: &AuthContext<'_>) -> Decision {
    if ctx.room.is_dm() {
        return Decision::deny("direct conversations have no settings");
    }
    if actor.has_permission(Permission::ManageSettings) {
        Decision::Allow
    } else {
        Decision::deny("you do not have permission to change room settings")
    }
}

fn authorize_invite(actor: &Membership, ctx: &AuthContext<'_>) -> Decision {
    if ctx.room.is_dm() {
        return Decision::deny("cannot invite into a direct conversation");
    }
    if actor.is_owner() {
        return Decision::Allow;
    }
    match ctx.invite_policy {
        InvitePolicy::OwnerOnly => Decision::deny("only the owner can invite"),
        InvitePolicy::AnyMember if ctx.room.settings.allow_member_invite => Decision::Allow,
        InvitePolicy::AnyMember => Decision::deny("member invitations are turned off"),
    }
}

/// What the viewer may do in a room, for the permission stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub is_owner: bool,
    pub is_sub_manager: bool,
    pub can_invite: bool,
    pub can_kick: bool,
    pub can_delete_others: bool,
    pub can_manage_settings: bool,
}

impl Capabilities {
    pub fn for_member(member: &Membership, room: &Room, invite_policy: InvitePolicy) -> Self {
        if !member.is_active() || room.is_dm() {
            return Self::default();
        }
        let ctx = AuthContext::new(room).with_invite_policy(invite_policy);
        Self {
            is_owner: member.is_owner(),
            is_sub_manager: member.is_sub_manager(),
            can_invite: authorize(member, RoomAction::InviteMembers, &ctx).is_allowed(),
            can_kick: member.has_permission(Permission::KickMember),
            can_delete_others: member.has_permission(Permission::ManageMessages),
            can_manage_settings: authorize(member, RoomAction::ManageSettings, &ctx).is_allowed(),
        }
    }
}
