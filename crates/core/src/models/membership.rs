//! Membership, role, and permission models

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a membership record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Invited, awaiting the invitee's answer
    Pending,
    /// Participating member
    Active,
    /// Invitee declined
    Rejected,
    /// Removed by the owner or a sub-manager
    Kicked,
    /// Left on their own
    Left,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Pending => "pending",
            MembershipStatus::Active => "active",
            MembershipStatus::Rejected => "rejected",
            MembershipStatus::Kicked => "kicked",
            MembershipStatus::Left => "left",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MembershipStatus::Pending),
            "active" => Some(MembershipStatus::Active),
            "rejected" => Some(MembershipStatus::Rejected),
            "kicked" => Some(MembershipStatus::Kicked),
            "left" => Some(MembershipStatus::Left),
            _ => None,
        }
    }

    /// States that only a fresh invitation (or code join) can leave
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MembershipStatus::Active)
    }
}

/// Room roles in priority order (highest to lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RoomRole {
    /// Plain participant
    Member = 1,
    /// Owner-appointed helper with a granted permission subset
    SubManager = 2,
    /// Single room owner
    Owner = 3,
}

impl RoomRole {
    pub fn display_name(&self) -> &'static str {
        match self {
            RoomRole::Owner => "Owner",
            RoomRole::SubManager => "Sub-manager",
            RoomRole::Member => "Member",
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            3 => RoomRole::Owner,
            2 => RoomRole::SubManager,
            _ => RoomRole::Member,
        }
    }
}

impl std::fmt::Display for RoomRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Moderation permissions an owner may grant to a sub-manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    KickMember,
    ManageMessages,
    ManageSettings,
}

impl Permission {
    pub const ALL: [Permission; 3] = [
        Permission::KickMember,
        Permission::ManageMessages,
        Permission::ManageSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::KickMember => "kick_member",
            Permission::ManageMessages => "manage_messages",
            Permission::ManageSettings => "manage_settings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

pub type PermissionSet = BTreeSet<Permission>;

/// A user's membership in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub status: MembershipStatus,
    pub role: RoomRole,
    /// Only meaningful while `role == SubManager`
    pub permissions: PermissionSet,
    pub invited_by: Option<Uuid>,
    pub joined_at: DateTime<Utc>,
    pub last_access_time: Option<DateTime<Utc>>,
    /// Senders whose messages this viewer has muted in this room
    pub muted_users: BTreeSet<Uuid>,
    /// Viewer currently has the room open
    pub in_room: bool,
    pub unread_count: u32,
    /// Invitee had blocked the inviter when invited; hidden from their room list
    pub blocked_invite: bool,
}

impl Membership {
    fn base(room_id: Uuid, user_id: Uuid, status: MembershipStatus, role: RoomRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            status,
            role,
            permissions: PermissionSet::new(),
            invited_by: None,
            joined_at: Utc::now(),
            last_access_time: None,
            muted_users: BTreeSet::new(),
            in_room: false,
            unread_count: 0,
            blocked_invite: false,
        }
    }

    pub fn active(room_id: Uuid, user_id: Uuid, role: RoomRole) -> Self {
        Self::base(room_id, user_id, MembershipStatus::Active, role)
    }

    pub fn pending(room_id: Uuid, user_id: Uuid, invited_by: Uuid) -> Self {
        let mut membership = Self::base(room_id, user_id, MembershipStatus::Pending, RoomRole::Member);
        membership.invited_by = Some(invited_by);
        membership
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }

    pub fn is_owner(&self) -> bool {
        self.is_active() && self.role == RoomRole::Owner
    }

    pub fn is_sub_manager(&self) -> bool {
        self.is_active() && self.role == RoomRole::SubManager
    }

    /// Plain active member: neither owner nor sub-manager
    pub fn is_plain_member(&self) -> bool {
        self.role == RoomRole::Member
    }

    /// Whether this member holds a sub-manager permission (owners hold all)
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.is_owner() || (self.is_sub_manager() && self.permissions.contains(&permission))
    }

    /// Drop to plain member, clearing any granted permissions
    pub fn demote(&mut self) {
        self.role = RoomRole::Member;
        self.permissions.clear();
    }
}

/// Member row for the membership stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: RoomRole,
    pub status: MembershipStatus,
    pub permissions: PermissionSet,
    pub in_room: bool,
}
