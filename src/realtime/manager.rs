//! Subscription registry. One live channel per resource key, opened
//! unsubscribe-before-subscribe under a per-key lock, each with its own
//! dispatcher task. Health is derived from the registry and published on a
//! watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChannelHandle, ChannelStatus, FeedMessage, FeedReceiver, ResourceKey};
use crate::error::{AppError, AppResult};
use crate::flight::KeyedLocks;
use crate::identity::SessionStore;
use crate::tprintln;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Errored,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub connection_error: Option<String>,
    pub subscription_count: usize,
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Entry {
    id: u64,
    handle: ChannelHandle,
    filter: ChangeFilter,
    state: ConnectionState,
    error: Option<String>,
    /// Open while handlers may run; closed under the lock on teardown.
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    entries: Mutex<HashMap<ResourceKey, Entry>>,
    locks: KeyedLocks<ResourceKey>,
    health: watch::Sender<ConnectionHealth>,
    subscribe_timeout: Duration,
    last_open_error: Mutex<Option<String>>,
    identity_watch: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for (_, e) in self.entries.get_mut().drain() {
            *e.gate.lock() = false;
            e.task.abort();
        }
        if let Some(h) = self.identity_watch.get_mut().take() { h.abort(); }
    }
}

/// Owns every live subscription. Clones share the registry.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, subscribe_timeout: Duration) -> Self {
        let (health, _) = watch::channel(ConnectionHealth::default());
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                entries: Mutex::new(HashMap::new()),
                locks: KeyedLocks::new(),
                health,
                subscribe_timeout,
                last_open_error: Mutex::new(None),
                identity_watch: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a channel for `key`, replacing any existing one, and wait for its
    /// first status. `Ok(Connecting)` means the status did not arrive within the
    /// subscribe timeout; the channel stays registered and may still come up.
    pub async fn subscribe(&self, key: ResourceKey, filter: ChangeFilter, handler: ChangeHandler) -> AppResult<ConnectionState> {
        let _guard = self.inner.locks.acquire(&key).await;

        if let Some(old) = self.take_entry(&key) {
            debug!(target: "realtime", %key, "replacing existing subscription");
            self.close_entry(&key, old).await;
        }

        let (handle, rx) = match self.inner.feed.open_channel(&key, &filter).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(target: "realtime", %key, %filter, "Failed to open channel: {}", e);
                *self.inner.last_open_error.lock() = Some(e.message().to_string());
                self.publish_health();
                return Err(AppError::io("channel_error".to_string(), format!("{}: {}", key, e.message())));
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Mutex::new(true));
        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            key.clone(),
            id,
            rx,
            Arc::clone(&gate),
            handler,
            first_tx,
        ));
        self.inner.entries.lock().insert(
            key.clone(),
            Entry { id, handle, filter, state: ConnectionState::Connecting, error: None, gate, task },
        );
        *self.inner.last_open_error.lock() = None;
        self.publish_health();
        tprintln!("realtime.subscribe key={} id={}", key, id);

        match tokio::time::timeout(self.inner.subscribe_timeout, first_rx).await {
            Ok(Ok(ChannelStatus::Subscribed)) => {
                info!(target: "realtime", %key, "subscribed");
                Ok(ConnectionState::Subscribed)
            }
            Ok(Ok(ChannelStatus::Errored(msg))) => {
                warn!(target: "realtime", %key, "subscription error: {}", msg);
                Err(AppError::io("channel_error".to_string(), format!("{}: {}", key, msg)))
            }
            Ok(Ok(ChannelStatus::Closed)) | Ok(Err(_)) => {
                warn!(target: "realtime", %key, "channel closed before subscribing");
                Err(AppError::io("channel_closed".to_string(), format!("{}: closed before subscribing", key)))
            }
            Err(_) => {
                warn!(target: "realtime", %key, timeout_ms = self.inner.subscribe_timeout.as_millis() as u64, "no channel status before timeout");
                Ok(self.state_of(&key).unwrap_or(ConnectionState::Connecting))
            }
        }
    }

    /// Close the channel for `key`. No handler for `key` runs after this returns.
    pub async fn unsubscribe(&self, key: &ResourceKey) -> bool {
        let removed = {
            let _guard = self.inner.locks.acquire(key).await;
            match self.take_entry(key) {
                Some(entry) => {
                    self.close_entry(key, entry).await;
                    self.publish_health();
                    info!(target: "realtime", %key, "unsubscribed");
                    true
                }
                None => false,
            }
        };
        // Guard released; the key's lock entry can go unless someone else waits on it.
        self.inner.locks.prune();
        removed
    }

    pub async fn unsubscribe_all(&self) {
        for key in self.active_keys() {
            self.unsubscribe(&key).await;
        }
    }

    /// Tear everything down. Callers re-subscribe what they still need.
    pub async fn reconnect(&self) {
        info!(target: "realtime", count = self.subscription_count(), "reconnect requested; closing all channels");
        self.unsubscribe_all().await;
        *self.inner.last_open_error.lock() = None;
        self.publish_health();
    }

    pub fn health(&self) -> ConnectionHealth { self.inner.health.borrow().clone() }
    pub fn watch_health(&self) -> watch::Receiver<ConnectionHealth> { self.inner.health.subscribe() }

    pub fn state_of(&self, key: &ResourceKey) -> Option<ConnectionState> {
        self.inner.entries.lock().get(key).map(|e| e.state)
    }

    pub fn filter_of(&self, key: &ResourceKey) -> Option<ChangeFilter> {
        self.inner.entries.lock().get(key).map(|e| e.filter.clone())
    }

    pub fn active_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.inner.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscription_count(&self) -> usize { self.inner.entries.lock().len() }

    /// Close every channel whenever the session goes from signed in to signed out.
    pub fn close_on_identity_loss(&self, session: &SessionStore) {
        let mut rx = session.watch();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut had_identity = rx.borrow_and_update().authenticated;
            while rx.changed().await.is_ok() {
                let has_identity = rx.borrow_and_update().authenticated;
                if had_identity && !has_identity {
                    let Some(inner) = weak.upgrade() else { break; };
                    info!(target: "realtime", "identity lost; closing all channels");
                    ChannelManager { inner }.unsubscribe_all().await;
                }
                had_identity = has_identity;
            }
        });
        if let Some(old) = self.inner.identity_watch.lock().replace(task) { old.abort(); }
    }

    fn take_entry(&self, key: &ResourceKey) -> Option<Entry> {
        let entry = self.inner.entries.lock().remove(key)?;
        *entry.gate.lock() = false;
        Some(entry)
    }

    async fn close_entry(&self, key: &ResourceKey, entry: Entry) {
        entry.task.abort();
        if let Err(e) = self.inner.feed.close_channel(entry.handle).await {
            debug!(target: "realtime", %key, "close_channel failed: {}", e);
        }
    }

    fn publish_health(&self) {
        publish_health(&self.inner);
    }
}

fn publish_health(inner: &ManagerInner) {
    let next = {
        let entries = inner.entries.lock();
        let mut states: Vec<(&ResourceKey, &Entry)> = entries.iter().collect();
        states.sort_by(|a, b| a.0.cmp(b.0));
        let entry_error = states.iter().find_map(|(_, e)| e.error.clone());
        ConnectionHealth {
            is_connected: states.iter().any(|(_, e)| e.state == ConnectionState::Subscribed),
            is_connecting: states.iter().any(|(_, e)| e.state == ConnectionState::Connecting),
            connection_error: entry_error.or_else(|| inner.last_open_error.lock().clone()),
            subscription_count: states.len(),
        }
    };
    inner.health.send_if_modified(|h| {
        if *h == next { return false; }
        *h = next;
        true
    });
}

/// Record a status for the entry `id` if it is still the registered one.
fn record_status(weak: &Weak<ManagerInner>, key: &ResourceKey, id: u64, status: &ChannelStatus) {
    let Some(inner) = weak.upgrade() else { return; };
    {
        let mut entries = inner.entries.lock();
        let Some(entry) = entries.get_mut(key).filter(|e| e.id == id) else { return; };
        match status {
            ChannelStatus::Subscribed => {
                entry.state = ConnectionState::Subscribed;
                entry.error = None;
            }
            ChannelStatus::Errored(msg) => {
                entry.state = ConnectionState::Errored;
                entry.error = Some(msg.clone());
            }
            ChannelStatus::Closed => entry.state = ConnectionState::Closed,
        }
    }
    publish_health(&inner);
}

async fn dispatch(
    weak: Weak<ManagerInner>,
    key: ResourceKey,
    id: u64,
    mut rx: FeedReceiver,
    gate: Arc<Mutex<bool>>,
    handler: ChangeHandler,
    first_status: oneshot::Sender<ChannelStatus>,
) {
    let mut first_status = Some(first_status);
    while let Some(msg) = rx.recv().await {
        match msg {
            FeedMessage::Status(status) => {
                debug!(target: "realtime", %key, ?status, "channel status");
                if let ChannelStatus::Errored(msg) = &status {
                    warn!(target: "realtime", %key, "Subscription error: {}", msg);
                }
                record_status(&weak, &key, id, &status);
                if let Some(tx) = first_status.take() { let _ = tx.send(status); }
            }
            FeedMessage::Change(ev) => {
                let open = gate.lock();
                if !*open { break; }
                handler(&ev);
            }
        }
    }
    // Feed dropped the channel without a close status.
    if *gate.lock() {
        record_status(&weak, &key, id, &ChannelStatus::Closed);
    }
    if let Some(tx) = first_status.take() { let _ = tx.send(ChannelStatus::Closed); }
}
