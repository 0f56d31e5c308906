//! Room sessions
//!
//! A `RoomSession` is one open room view. It loads the viewer's room
//! preferences once, runs the message, member, and capability
//! subscriptions side by side, fixes the unread marker at entry, marks
//! messages read while the page is visible, and raises alerts for new
//! messages. Closing the session stops every task it started; a task that
//! is mid-flight checks the liveness flag before touching shared state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chorus_core::{
    Capabilities, Error as CoreError, MemberInfo, MembershipRepository, Message, RoomPreferences,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{MessageSnapshot, MessageSubscription};
use crate::error::{Error, Result};
use crate::notify::AlertContext;
use crate::read_state::{entry_position, EntryPosition, MarkRead, ReadStateTracker};
use crate::render::{render, RenderedMessage};
use crate::service::{ChatService, Shared};
use crate::subscription::Subscription;

const ALERT_BUFFER: usize = 32;

/// Composer content. Sending takes the text out; a failed send puts it back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    text: String,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn restore(&mut self, text: String) {
        self.text = text;
    }
}

impl From<&str> for Draft {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

pub struct RoomSession {
    room_id: Uuid,
    viewer: Uuid,
    service: ChatService,
    prefs: RoomPreferences,
    entry: EntryPosition,
    alive: Arc<AtomicBool>,
    messages: MessageSubscription,
    members: Subscription<Vec<MemberInfo>>,
    capabilities: Subscription<Capabilities>,
    alerts: mpsc::Receiver<Message>,
    watcher: JoinHandle<()>,
}

impl RoomSession {
    pub(crate) async fn open(service: ChatService, room_id: Uuid, viewer: Uuid) -> Result<Self> {
        let shared = service.shared.clone();
        let (prefs, last_access) = {
            let db = shared.db.lock().await;
            let me = db
                .find_membership(room_id, viewer)?
                .filter(|m| m.is_active())
                .ok_or_else(|| {
                    CoreError::AuthorizationDenied("you are not a member of this room".into())
                })?;
            let prefs = RoomPreferences::load(&db.preferences(), room_id)?;
            (prefs, me.last_access_time)
        };

        let messages = MessageSubscription::start(shared.clone(), room_id, viewer).await?;
        let members = service.subscribe_members(room_id).await?;
        let capabilities = service.subscribe_capabilities(room_id, viewer).await?;
        // Only mark the viewer present once nothing else can fail
        shared
            .presence
            .enter(&*shared.db.lock().await, room_id, viewer)?;

        let first = messages.snapshot();
        let entry = entry_position(
            &first.messages,
            viewer,
            last_access,
            shared.config.unread_marker_threshold,
        );
        // History already on screen never alerts
        shared.notifier.prime(room_id, viewer, first.latest_id);

        let alive = Arc::new(AtomicBool::new(true));
        let (alert_tx, alerts) = mpsc::channel(ALERT_BUFFER);
        let watcher = tokio::spawn(watch_task(
            WatchState {
                shared: shared.clone(),
                room_id,
                viewer,
                prefs: prefs.clone(),
                alive: alive.clone(),
                alerts: alert_tx,
            },
            messages.receiver(),
            shared.presence.watch_visibility(),
        ));

        Ok(Self {
            room_id,
            viewer,
            service,
            prefs,
            entry,
            alive,
            messages,
            members,
            capabilities,
            alerts,
            watcher,
        })
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    pub fn preferences(&self) -> &RoomPreferences {
        &self.prefs
    }

    /// Unread marker position computed when the room was opened
    pub fn entry(&self) -> EntryPosition {
        self.entry
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn messages(&self) -> &MessageSubscription {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut MessageSubscription {
        &mut self.messages
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        self.messages.snapshot()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.current()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.current()
    }

    /// Display rows for the current snapshot
    pub fn rows(&self) -> Vec<RenderedMessage> {
        render(&self.messages.snapshot(), &self.members.current(), self.entry)
    }

    pub async fn load_older(&self) -> Result<bool> {
        self.ensure_alive()?;
        self.messages.load_older().await
    }

    /// Mark what is loaded as read now, if the page is visible
    pub async fn mark_read(&self) -> Result<MarkRead> {
        self.ensure_alive()?;
        let snapshot = self.messages.snapshot();
        ReadStateTracker::new(self.service.shared.clone())
            .mark_read(self.room_id, self.viewer, &snapshot.messages)
            .await
    }

    pub async fn send(&self, draft: &mut Draft) -> Result<Message> {
        self.ensure_alive()?;
        self.service.send_draft(self.room_id, self.viewer, draft).await
    }

    /// Next message that should raise an alert. `None` once closed.
    pub async fn next_alert(&mut self) -> Option<Message> {
        self.alerts.recv().await
    }

    /// Stop all subscriptions and mark the viewer as out of the room
    pub async fn close(mut self) -> Result<()> {
        self.shutdown();
        let _ = (&mut self.watcher).await;
        self.messages.join().await;
        self.members.join().await;
        self.capabilities.join().await;

        let shared = self.service.shared.clone();
        shared.notifier.reset(self.room_id, self.viewer);
        shared.hub.prune();
        let db = shared.db.lock().await;
        shared.presence.exit(&db, self.room_id, self.viewer)?;
        debug!(room_id = %self.room_id, "Room session closed");
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.watcher.abort();
        self.messages.close();
        self.members.close();
        self.capabilities.close();
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn alert_context<'a>(
    shared: &Shared,
    prefs: &'a RoomPreferences,
    snapshot: &'a MessageSnapshot,
) -> AlertContext<'a> {
    AlertContext {
        prefs,
        filter: &snapshot.filter,
        page_visible: shared.presence.is_visible(),
    }
}

struct WatchState {
    shared: Arc<Shared>,
    room_id: Uuid,
    viewer: Uuid,
    prefs: RoomPreferences,
    alive: Arc<AtomicBool>,
    alerts: mpsc::Sender<Message>,
}

async fn watch_task(
    state: WatchState,
    mut snapshots: watch::Receiver<MessageSnapshot>,
    mut visibility: watch::Receiver<bool>,
) {
    let tracker = ReadStateTracker::new(state.shared.clone());
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if !state.alive.load(Ordering::Acquire) {
            break;
        }

        if let Some(latest) = snapshot.latest() {
            let ctx = alert_context(&state.shared, &state.prefs, &snapshot);
            if state.shared.notifier.observe(latest, ctx)
                && state.alerts.try_send(latest.clone()).is_err()
            {
                debug!(room_id = %state.room_id, "Alert dropped");
            }
        }

        match tracker
            .mark_read(state.room_id, state.viewer, &snapshot.messages)
            .await
        {
            Ok(MarkRead::Applied(receipt)) if receipt.marked > 0 => {
                debug!(marked = receipt.marked, "Marked messages read");
            }
            Ok(_) => {}
            Err(e) => warn!(room_id = %state.room_id, error = %e, "Mark read failed"),
        }

        tokio::select! {
            changed = snapshots.changed() => if changed.is_err() { break },
            changed = visibility.changed() => if changed.is_err() { break },
        }
    }
}
