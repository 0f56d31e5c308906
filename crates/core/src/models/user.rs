//! User model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback label for users with no usable name
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// A chat user as known to the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Account display name
    pub display_name: String,
    /// In-app nickname, preferred over the account name when set
    pub nickname: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            nickname: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Name shown to other users
    pub fn name(&self) -> &str {
        self.nickname
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| Some(self.display_name.as_str()).filter(|n| !n.trim().is_empty()))
            .unwrap_or(ANONYMOUS_NAME)
    }
}
