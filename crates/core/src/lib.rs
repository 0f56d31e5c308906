//! Chorus Core Library
//!
//! Room and membership models, the permission rules, the Membership
//! Authority and Moderation Engine, and SQLite storage for the Chorus chat
//! core.

pub mod authority;
pub mod config;
pub mod error;
pub mod invariants;
pub mod models;
pub mod moderation;
pub mod permissions;
pub mod storage;

pub use authority::{LeaveOutcome, MembershipAuthority};
pub use config::{ChorusConfig, InvitePolicy};
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use moderation::{DisplayBody, ModerationEngine, ViewerFilter};
pub use permissions::*;
pub use storage::{
    Database, KeyValueStore, MembershipRepository, MessageRepository, PreferencesStore,
    RelationRepository, RoomPreferences, RoomRepository, Storage, UserRepository,
};
