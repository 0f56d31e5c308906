//! Room model - DM and group conversation containers

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic DM room ids
const DM_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_3d2a_93b4_4e8e_a0c2_5f7d_1e9b_4a11);

const INVITE_CODE_PREFIX: &str = "INV-";
const INVITE_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const INVITE_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Two-party direct conversation
    Dm,
    /// Multi-party group room
    Group,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Dm => "dm",
            RoomKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(RoomKind::Dm),
            "group" => Some(RoomKind::Group),
            _ => None,
        }
    }
}

/// Owner-controlled group behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Whether non-owner members may invite
    pub allow_member_invite: bool,
    /// Whether non-owner members may leave on their own
    pub allow_member_leave: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_member_invite: true,
            allow_member_leave: true,
        }
    }
}

/// A conversation container. Memberships and messages reference it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub kind: RoomKind,
    pub name: String,
    pub owner_id: Uuid,
    /// Reference returned by the external upload service
    pub image_ref: Option<String>,
    pub is_public: bool,
    pub invite_code: Option<String>,
    pub settings: RoomSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Preview of the newest message body
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Room {
    pub fn new_group(name: impl Into<String>, owner_id: Uuid, is_public: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: RoomKind::Group,
            name: name.into(),
            owner_id,
            image_ref: None,
            is_public,
            invite_code: is_public.then(generate_invite_code),
            settings: RoomSettings {
                // Private rooms grow by member invites, public ones by code
                allow_member_invite: !is_public,
                allow_member_leave: true,
            },
            created_at: now,
            updated_at: now,
            last_message: None,
            last_message_at: None,
        }
    }

    /// DM between `opener` and `peer`; the opener is recorded as owner
    pub fn new_dm(opener: Uuid, peer: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Self::dm_id(opener, peer),
            kind: RoomKind::Dm,
            name: String::new(),
            owner_id: opener,
            image_ref: None,
            is_public: false,
            invite_code: None,
            settings: RoomSettings::default(),
            created_at: now,
            updated_at: now,
            last_message: None,
            last_message_at: None,
        }
    }

    /// Deterministic id for the DM between two users, independent of order
    pub fn dm_id(a: Uuid, b: Uuid) -> Uuid {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Uuid::new_v5(&DM_NAMESPACE, format!("dm_{}_{}", lo, hi).as_bytes())
    }

    pub fn is_dm(&self) -> bool {
        self.kind == RoomKind::Dm
    }

    pub fn is_group(&self) -> bool {
        self.kind == RoomKind::Group
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate a shareable invite code such as `INV-7QK2ZD`
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..INVITE_CODE_LEN)
        .map(|_| INVITE_CODE_CHARSET[rng.gen_range(0..INVITE_CODE_CHARSET.len())] as char)
        .collect();
    format!("{}{}", INVITE_CODE_PREFIX, suffix)
}

/// Canonical form of a user-typed invite code
pub fn normalize_invite_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_id_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(Room::dm_id(a, b), Room::dm_id(b, a));
        assert_ne!(Room::dm_id(a, b), Room::dm_id(a, Uuid::new_v4()));
    }

    #[test]
    fn test_invite_code_shape() {
        let code = generate_invite_code();
        assert!(code.starts_with("INV-"));
        assert_eq!(code.len(), 10);
        assert!(code[4..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_public_group_gets_code() {
        let owner = Uuid::new_v4();
        let public = Room::new_group("Book club", owner, true);
        let private = Room::new_group("Family", owner, false);
        assert!(public.invite_code.is_some());
        assert!(!public.settings.allow_member_invite);
        assert!(private.invite_code.is_none());
        assert!(private.settings.allow_member_invite);
    }

    #[test]
    fn test_normalize_invite_code() {
        assert_eq!(normalize_invite_code("  inv-ab12cd "), "INV-AB12CD");
    }
}
