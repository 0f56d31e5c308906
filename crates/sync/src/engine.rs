//! Message Sync Engine
//!
//! Sending messages and keeping a live, paged snapshot of a room's stream
//! for one viewer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chorus_core::invariants::assert_stream_order;
use chorus_core::{
    Error as CoreError, Membership, Message, ModerationEngine, ReadMarker, Storage, ViewerFilter,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hub::{RoomEvent, UserEvent};
use crate::service::Shared;
use crate::window::MessageWindow;

/// Result of a successful send
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Members whose unread counter went up
    pub unread_for: Vec<Uuid>,
}

/// Append a text message to a room.
///
/// In a DM, a sender who has blocked the peer is refused. A sender who is
/// blocked by the peer is quietly refused delivery: the message is stored
/// and visible to the sender, but the peer's stream hides it, it is never
/// counted as unread for them, and the room preview is left alone.
#[instrument(skip(store, body))]
pub fn send_message<S: Storage>(
    store: &S,
    room_id: Uuid,
    sender: Uuid,
    body: &str,
) -> chorus_core::Result<Delivery> {
    let body = body.trim();
    if body.is_empty() {
        return Err(CoreError::InvalidOperation(
            "message body cannot be empty".into(),
        ));
    }

    store.atomically(|store| {
        let room = store
            .find_room(room_id)?
            .ok_or_else(|| CoreError::NotFound(format!("room {}", room_id)))?;
        match store.find_membership(room_id, sender)? {
            Some(m) if m.is_active() => {}
            _ => {
                return Err(CoreError::AuthorizationDenied(
                    "you are not a member of this room".into(),
                ))
            }
        }

        let others: Vec<Membership> = store
            .list_memberships(room_id)?
            .into_iter()
            .filter(|m| m.is_active() && m.user_id != sender)
            .collect();

        let mut quiet_for = BTreeSet::new();
        if room.is_dm() {
            for peer in &others {
                if store.is_blocked(sender, peer.user_id)? {
                    return Err(CoreError::AuthorizationDenied(
                        "you have blocked this user".into(),
                    ));
                }
                if store.is_blocked(peer.user_id, sender)? {
                    quiet_for.insert(peer.user_id);
                }
            }
        }

        let mut message = Message::new(room.id, room.kind, sender, body.to_string());
        let present = others
            .iter()
            .filter(|m| m.in_room && !quiet_for.contains(&m.user_id))
            .map(|m| m.user_id);
        match &mut message.read {
            ReadMarker::Direct { read } => *read = present.count() > 0,
            ReadMarker::Group { read_by } => {
                read_by.insert(sender);
                read_by.extend(present);
            }
        }
        store.append_message(&mut message)?;

        let mut unread_for = Vec::new();
        for member in &others {
            if member.in_room || quiet_for.contains(&member.user_id) {
                continue;
            }
            store.increment_unread(room_id, member.user_id)?;
            unread_for.push(member.user_id);
        }
        if quiet_for.is_empty() {
            store.update_room_preview(room_id, &message.body, message.created_at)?;
        } else {
            debug!(room_id = %room_id, "Delivery withheld from blocking peer");
        }

        Ok(Delivery {
            message,
            unread_for,
        })
    })
}

/// One page of a room as `viewer` sees it
#[derive(Debug, Clone)]
pub struct Page {
    /// Visible messages in stream order
    pub messages: Vec<Message>,
    /// Full page before visibility filtering
    pub raw: Vec<Message>,
    pub has_more: bool,
    pub filter: ViewerFilter,
}

/// Load the newest `limit` messages of a room for `viewer`. Group members
/// only see history from when they joined.
pub fn load_page<S: Storage>(
    store: &S,
    room_id: Uuid,
    viewer: Uuid,
    limit: usize,
) -> chorus_core::Result<Page> {
    let room = store
        .find_room(room_id)?
        .ok_or_else(|| CoreError::NotFound(format!("room {}", room_id)))?;
    let me = match store.find_membership(room_id, viewer)? {
        Some(m) if m.is_active() => m,
        _ => {
            return Err(CoreError::AuthorizationDenied(
                "you are not a member of this room".into(),
            ))
        }
    };

    let since = room.is_group().then_some(me.joined_at);
    let (raw, has_more) = store.latest_messages(room_id, limit, since)?;
    assert_stream_order(&raw);
    let filter = ModerationEngine::new(store).viewer_filter(viewer, room_id)?;
    let messages = raw.iter().filter(|m| filter.visible(m)).cloned().collect();
    Ok(Page {
        messages,
        raw,
        has_more,
        filter,
    })
}

/// Move anchors that point at hidden messages onto the next visible one
fn visible_dividers(anchors: &[Uuid], page: &Page) -> Vec<Uuid> {
    let mut placed = Vec::new();
    for anchor in anchors {
        let Some(pos) = page.raw.iter().position(|m| m.id == *anchor) else {
            continue;
        };
        let target = page.raw[pos..]
            .iter()
            .find(|m| page.filter.visible(m))
            .map(|m| m.id);
        if let Some(id) = target {
            if !placed.contains(&id) {
                placed.push(id);
            }
        }
    }
    placed
}

/// Live state of a message subscription
#[derive(Debug, Clone)]
pub struct MessageSnapshot {
    pub room_id: Uuid,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub limit: usize,
    /// Divider anchors in request order, each on a visible message
    pub dividers: Vec<Uuid>,
    pub latest_id: Option<Uuid>,
    /// The newest message changed with this update
    pub new_tail: bool,
    pub filter: ViewerFilter,
    /// Bumped on every published update
    pub revision: u64,
}

impl MessageSnapshot {
    fn from_page(room_id: Uuid, page: Page, window: &MessageWindow, new_tail: bool) -> Self {
        let dividers = visible_dividers(window.dividers(), &page);
        Self {
            room_id,
            latest_id: page.messages.last().map(|m| m.id),
            messages: page.messages,
            has_more: page.has_more,
            limit: window.limit(),
            dividers,
            new_tail,
            filter: page.filter,
            revision: 0,
        }
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }
}

enum WindowCommand {
    LoadOlder(oneshot::Sender<bool>),
}

/// A viewer's live, paged view of one room's messages
pub struct MessageSubscription {
    rx: watch::Receiver<MessageSnapshot>,
    commands: mpsc::Sender<WindowCommand>,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MessageSubscription {
    pub(crate) async fn start(shared: Arc<Shared>, room_id: Uuid, viewer: Uuid) -> Result<Self> {
        // Subscribe before the first load so no change slips in between
        let room_events = shared.hub.subscribe(room_id);
        let user_events = shared.hub.subscribe_user(viewer);

        let mut window = MessageWindow::new(shared.config.page_size);
        let page = {
            let db = shared.db.lock().await;
            load_page(&*db, room_id, viewer, window.limit())?
        };
        window.observe(&page.messages, page.has_more);
        let snapshot = MessageSnapshot::from_page(room_id, page, &window, false);

        let (tx, rx) = watch::channel(snapshot);
        let (commands, command_rx) = mpsc::channel(8);
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(subscription_task(
            SubscriptionState {
                shared,
                room_id,
                viewer,
                window,
                tx,
                alive: alive.clone(),
            },
            room_events,
            user_events,
            command_rx,
        ));
        info!(room_id = %room_id, viewer = %viewer, "Message subscription started");

        Ok(Self {
            rx,
            commands,
            alive,
            task,
        })
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot
    pub async fn changed(&mut self) -> Result<MessageSnapshot> {
        self.rx.changed().await.map_err(|_| Error::ChannelClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<MessageSnapshot> {
        self.rx.clone()
    }

    /// Extend the window by one page. Resolves after the larger snapshot
    /// is published; returns false when there was nothing older to load.
    pub async fn load_older(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WindowCommand::LoadOlder(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.task.is_finished()
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.task.abort();
    }

    /// Wait for the task to wind down after `close`
    pub(crate) async fn join(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct SubscriptionState {
    shared: Arc<Shared>,
    room_id: Uuid,
    viewer: Uuid,
    window: MessageWindow,
    tx: watch::Sender<MessageSnapshot>,
    alive: Arc<AtomicBool>,
}

impl SubscriptionState {
    async fn refresh(&mut self) -> chorus_core::Result<()> {
        let page = {
            let db = self.shared.db.lock().await;
            load_page(&*db, self.room_id, self.viewer, self.window.limit())?
        };
        if !self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let new_tail = self.window.observe(&page.messages, page.has_more);
        let next = MessageSnapshot::from_page(self.room_id, page, &self.window, new_tail);
        self.tx.send_modify(|current| {
            let revision = current.revision + 1;
            *current = next;
            current.revision = revision;
        });
        Ok(())
    }
}

async fn subscription_task(
    mut state: SubscriptionState,
    mut room_events: broadcast::Receiver<RoomEvent>,
    mut user_events: broadcast::Receiver<UserEvent>,
    mut commands: mpsc::Receiver<WindowCommand>,
) {
    let mut user_open = true;
    loop {
        let reload = tokio::select! {
            event = room_events.recv() => match event {
                Ok(RoomEvent::Deleted) | Err(broadcast::error::RecvError::Closed) => {
                    debug!(room_id = %state.room_id, "Room gone, stopping subscription");
                    break;
                }
                Ok(_) => true,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Message subscription lagged");
                    true
                }
            },
            event = user_events.recv(), if user_open => match event {
                Ok(UserEvent::Relations) | Err(broadcast::error::RecvError::Lagged(_)) => true,
                Ok(_) => false,
                Err(broadcast::error::RecvError::Closed) => {
                    user_open = false;
                    false
                }
            },
            command = commands.recv() => match command {
                Some(WindowCommand::LoadOlder(reply)) => {
                    let extended = state.window.request_older();
                    if extended {
                        if let Err(e) = state.refresh().await {
                            warn!(error = %e, "Loading older messages failed");
                        }
                    }
                    let _ = reply.send(extended);
                    false
                }
                None => break,
            },
        };

        if !state.alive.load(Ordering::Acquire) {
            break;
        }
        if reload {
            if let Err(e) = state.refresh().await {
                warn!(room_id = %state.room_id, error = %e, "Message reload failed");
            }
        }
    }
    state.alive.store(false, Ordering::Release);
    debug!(room_id = %state.room_id, viewer = %state.viewer, "Message subscription ended");
}
