//! Data models for Chorus

mod membership;
mod message;
mod room;
mod user;

pub use membership::*;
pub use message::*;
pub use room::*;
pub use user::*;
