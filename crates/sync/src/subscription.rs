//! Live, read-only views that reload whenever the hub reports a change

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chorus_core::Database;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hub::{RoomEvent, UserEvent};
use crate::service::Shared;

/// Hub events a reloader can listen to
pub(crate) trait Trigger: Clone + Send + 'static {
    /// The subscribed entity is gone
    fn ends(&self) -> bool;
}

impl Trigger for RoomEvent {
    fn ends(&self) -> bool {
        *self == RoomEvent::Deleted
    }
}

impl Trigger for UserEvent {
    fn ends(&self) -> bool {
        false
    }
}

/// Handle to a live value kept current by a background task.
/// Dropping the handle stops the task.
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: watch::Receiver<T>, alive: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self { rx, alive, task }
    }

    /// Latest value
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next update and return it
    pub async fn changed(&mut self) -> Result<T> {
        self.rx.changed().await.map_err(|_| Error::ChannelClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Raw receiver, for callers that want to `select!` over several views
    pub fn receiver(&self) -> watch::Receiver<T> {
        self.rx.clone()
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

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.task.abort();
    }
}

/// Load `initial` now, then reload after every hub event until the source
/// ends or the handle is dropped.
pub(crate) async fn spawn_reloader<T, E, F>(
    shared: Arc<Shared>,
    events: broadcast::Receiver<E>,
    load: F,
) -> Result<Subscription<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Trigger + std::fmt::Debug,
    F: Fn(&Database) -> chorus_core::Result<T> + Send + 'static,
{
    let initial = {
        let db = shared.db.lock().await;
        load(&*db)?
    };
    let (tx, rx) = watch::channel(initial);
    let alive = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(reload_task(shared, events, tx, alive.clone(), load));
    Ok(Subscription::new(rx, alive, task))
}

async fn reload_task<T, E, F>(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<E>,
    tx: watch::Sender<T>,
    alive: Arc<AtomicBool>,
    load: F,
) where
    T: PartialEq + Send + Sync + 'static,
    E: Trigger + std::fmt::Debug,
    F: Fn(&Database) -> chorus_core::Result<T> + Send + 'static,
{
    loop {
        match events.recv().await {
            Ok(event) if event.ends() => {
                debug!(?event, "Subscription source ended");
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Subscription lagged, reloading");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        let loaded = {
            let db = shared.db.lock().await;
            load(&*db)
        };
        if !alive.load(Ordering::Acquire) {
            break;
        }
        match loaded {
            Ok(value) => {
                tx.send_if_modified(|current| {
                    if *current == value {
                        return false;
                    }
                    *current = value;
                    true
                });
            }
            Err(e) => warn!(error = %e, "Subscription reload failed"),
        }
    }
    alive.store(false, Ordering::Release);
}
