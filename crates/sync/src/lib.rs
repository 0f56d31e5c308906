//! Chorus Sync Library
//!
//! The live layer of the chat core, built on tokio.
//!
//! # Architecture
//!
//! - **Hub**: per-room broadcast of change events
//! - **Engine**: message sends and paged, per-viewer message snapshots
//! - **Read state**: unread counts, the entry marker, mark-read
//! - **Presence / Notify**: who is looking at a room, and when to alert
//! - **Session**: one open room view tying the above together
//! - **Service**: the async command surface
//!
//! # Usage
//!
//! ```ignore
//! let chat = ChatService::open(ChorusConfig::default_db_path()?, ChorusConfig::default())?;
//! let mut session = chat.open_room(room_id, me).await?;
//!
//! let mut draft = Draft::from("hello");
//! session.send(&mut draft).await?;
//!
//! while let Some(message) = session.next_alert().await {
//!     // play a sound
//! }
//! ```

pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod notify;
pub mod presence;
pub mod read_state;
pub mod render;
pub mod service;
pub mod session;
mod subscription;
pub mod window;

pub use engine::{Delivery, MessageSnapshot, MessageSubscription};
pub use error::{Error, Result};
pub use hub::{RoomEvent, RoomHub, UserEvent};
pub use notify::NotificationTrigger;
pub use presence::PresenceTracker;
pub use read_state::{EntryPosition, MarkRead, ReadReceipt, ReadStateTracker};
pub use render::RenderedMessage;
pub use service::ChatService;
pub use session::{Draft, RoomSession};
pub use subscription::Subscription;
pub use window::MessageWindow;
