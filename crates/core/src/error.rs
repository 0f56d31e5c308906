//! Error types for Chorus Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Join-time conflict: active members are on the joiner's block list.
    /// Recoverable by re-issuing the command with `force_join`.
    #[error("Blocked members present: {}", names.join(", "))]
    BlockedMembersPresent { names: Vec<String> },

    /// Invite-time conflict: the inviter has blocked some of the invitees.
    #[error("Cannot invite blocked users: {}", names.join(", "))]
    BlockedByYou { names: Vec<String> },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Coarse error classification for callers that branch on the failure family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    Invariant,
    BlockedMembers,
    Transport,
    NotFound,
    Invalid,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AuthorizationDenied(_) => ErrorKind::Authorization,
            Error::InvariantViolation(_) => ErrorKind::Invariant,
            Error::BlockedMembersPresent { .. } | Error::BlockedByYou { .. } => {
                ErrorKind::BlockedMembers
            }
            Error::Transport(_) | Error::Database(_) | Error::Io(_) => ErrorKind::Transport,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidOperation(_) | Error::Serialization(_) | Error::Config(_) => {
                ErrorKind::Invalid
            }
        }
    }

    /// True when the caller may retry the same command with an explicit override
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::BlockedMembersPresent { .. })
    }

    pub(crate) fn denied(reason: impl Into<String>) -> Self {
        Error::AuthorizationDenied(reason.into())
    }

    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        Error::InvariantViolation(reason.into())
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidOperation(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
