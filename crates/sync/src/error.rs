//! Sync layer error types

use chorus_core::ErrorKind;

/// Sync result type
pub type Result<T> = std::result::Result<T, Error>;

/// Sync errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] chorus_core::Error),

    #[error("Room session closed")]
    SessionClosed,

    #[error("Subscription channel closed")]
    ChannelClosed,
}

impl Error {
    /// Failure family; closed channels count as transport failures
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Core(e) => e.kind(),
            Error::SessionClosed | Error::ChannelClosed => ErrorKind::Transport,
        }
    }

    /// The wrapped core error, if any
    pub fn as_core(&self) -> Option<&chorus_core::Error> {
        match self {
            Error::Core(e) => Some(e),
            _ => None,
        }
    }
}
