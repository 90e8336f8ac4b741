//! Who is looking at what: cursors, active cells and selections.
//!
//! Each table (or view) has one presence document shaped like
//! `{ "users": { <userId>: PresenceEntry } }`. Every client writes only its
//! own entry and reads everyone else's. Stale entries are filtered when read,
//! not evicted.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{ClientEvent, OpEvent, ProtocolClient, Subscription};
use crate::document::doc::apply_confirmed;
use crate::protocol::operation::{get_at, path};
use crate::protocol::{DocKey, Operation, Path};
use crate::{SyncError, SyncResult};

/// Document id used when presence is tracked for a whole table
pub const TABLE_PRESENCE_DOCUMENT: &str = "_table";

const USERS: &str = "users";

const PALETTE: [&str; 10] = [
    "#e8590c", "#1c7ed6", "#2f9e44", "#ae3ec9", "#f08c00", "#0ca678", "#d6336c", "#4263eb",
    "#74b816", "#9c36b5",
];

/// Collection holding presence documents for a table
pub fn presence_collection(table_id: &str) -> String {
    format!("presence_{}", table_id)
}

/// Stable color for a user, picked from a fixed palette
pub fn color_for(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });
    PALETTE[hash as usize % PALETTE.len()]
}

/// A cell, identified by record and field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellRef {
    pub record_id: String,
    pub field_id: String,
}

impl CellRef {
    pub fn new(record_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            field_id: field_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub record_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CellRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_cell: Option<CellRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    /// Milliseconds since the Unix epoch
    pub last_active_time: i64,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for(&user_id).to_string(),
            user_id,
            cursor: None,
            active_cell: None,
            selection: None,
            last_active_time: Utc::now().timestamp_millis(),
        }
    }

    /// True unless the entry was last touched more than `stale_after` before `now_ms`
    pub fn is_active_at(&self, now_ms: i64, stale_after: Duration) -> bool {
        let limit = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_active_time) <= limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
}

impl fmt::Display for PresencePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timing knobs for a [`PresenceTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTiming {
    pub heartbeat: Duration,
    pub stale_after: Duration,
}

impl Default for PresenceTiming {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Publishes this client's presence and reads everyone else's
///
/// Publishing is best-effort: failures are logged and never returned.
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    client: ProtocolClient,
    key: DocKey,
    user_id: String,
    timing: PresenceTiming,
    state: Mutex<TrackerState>,
    wire: Mutex<Option<Subscription>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    publishing: tokio::sync::Mutex<()>,
}

struct TrackerState {
    phase: PresencePhase,
    local: PresenceEntry,
    /// Last value of our entry the server acknowledged
    published: Option<JsonValue>,
    doc: JsonValue,
}

impl PresenceTracker {
    /// Tracker for a table, or for one view of it
    pub fn new(
        client: ProtocolClient,
        table_id: &str,
        view_id: Option<&str>,
        user_id: impl Into<String>,
        timing: PresenceTiming,
    ) -> Self {
        let user_id = user_id.into();
        let key = DocKey::new(
            presence_collection(table_id),
            view_id.unwrap_or(TABLE_PRESENCE_DOCUMENT),
        );

        Self {
            inner: Arc::new(TrackerInner {
                client,
                key,
                timing,
                state: Mutex::new(TrackerState {
                    phase: PresencePhase::Uninitialized,
                    local: PresenceEntry::new(user_id.clone()),
                    published: None,
                    doc: JsonValue::Null,
                }),
                user_id,
                wire: Mutex::new(None),
                heartbeat: Mutex::new(None),
                publishing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.inner.key
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn phase(&self) -> PresencePhase {
        self.inner.state().phase
    }

    /// This client's own entry as last set locally
    pub fn local_entry(&self) -> PresenceEntry {
        self.inner.state().local.clone()
    }

    /// Subscribe to the presence document, publish our entry and start the heartbeat.
    ///
    /// Fails only if the tracker was already initialized or destroyed.
    pub async fn initialize(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state();
            if state.phase != PresencePhase::Uninitialized {
                return Err(SyncError::invalid_state(format!(
                    "presence tracker for {} is {}",
                    self.inner.key, state.phase
                )));
            }
            state.phase = PresencePhase::Initializing;
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.client.subscribe(
            &self.inner.key.collection,
            &self.inner.key.document,
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_remote(event);
                }
            },
        );
        *self.inner.wire() = Some(subscription);

        let events = self.inner.client.events();
        self.inner.reload().await;
        self.inner.touch();
        self.inner.publish().await;

        {
            let mut state = self.inner.state();
            if state.phase != PresencePhase::Initializing {
                debug!("Presence tracker destroyed during initialization");
                return Ok(());
            }
            state.phase = PresencePhase::Ready;
        }

        let task = tokio::spawn(heartbeat(
            Arc::downgrade(&self.inner),
            self.inner.timing.heartbeat,
            events,
        ));
        if let Some(previous) = self.inner.heartbeat_task().replace(task) {
            previous.abort();
        }

        info!("Presence ready for {} as {}", self.inner.key, self.inner.user_id);
        Ok(())
    }

    pub async fn update_cursor(&self, record_id: &str, field_id: &str) {
        let cursor = CellRef::new(record_id, field_id);
        self.inner.mutate(move |entry| entry.cursor = Some(cursor)).await;
    }

    pub async fn update_active_cell(&self, record_id: &str, field_id: &str) {
        let cell = CellRef::new(record_id, field_id);
        self.inner
            .mutate(move |entry| entry.active_cell = Some(cell))
            .await;
    }

    pub async fn update_selection(&self, record_ids: Vec<String>) {
        self.inner
            .mutate(move |entry| entry.selection = Some(Selection { record_ids }))
            .await;
    }

    pub async fn clear_cursor(&self) {
        self.inner.mutate(|entry| entry.cursor = None).await;
    }

    pub async fn clear_active_cell(&self) {
        self.inner.mutate(|entry| entry.active_cell = None).await;
    }

    /// Other users seen within the staleness window
    pub fn get_active_users(&self) -> Vec<PresenceEntry> {
        self.get_active_users_at(Utc::now().timestamp_millis())
    }

    /// Other users active as of `now_ms`, sorted by user id
    pub fn get_active_users_at(&self, now_ms: i64) -> Vec<PresenceEntry> {
        let state = self.inner.state();
        let Some(users) = state.doc.get(USERS).and_then(JsonValue::as_object) else {
            return Vec::new();
        };

        let mut active: Vec<PresenceEntry> = users
            .iter()
            .filter(|(user_id, _)| **user_id != self.inner.user_id)
            .filter_map(|(user_id, value)| {
                match serde_json::from_value::<PresenceEntry>(value.clone()) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!("Ignoring malformed presence for {}: {}", user_id, e);
                        None
                    }
                }
            })
            .filter(|entry| entry.is_active_at(now_ms, self.inner.timing.stale_after))
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Stop the heartbeat, remove our entry (best-effort) and unsubscribe.
    ///
    /// Calling it again does nothing.
    pub async fn destroy(&self) {
        let published = {
            let mut state = self.inner.state();
            if state.phase == PresencePhase::Destroyed {
                return;
            }
            state.phase = PresencePhase::Destroyed;
            state.published.take()
        };

        if let Some(task) = self.inner.heartbeat_task().take() {
            task.abort();
        }

        if let Some(old_value) = published {
            let _publishing = self.inner.publishing.lock().await;
            let op = Operation::delete(self.inner.entry_path(), old_value);
            if let Err(e) = self
                .inner
                .client
                .submit(&self.inner.key.collection, &self.inner.key.document, vec![op])
                .await
            {
                warn!("Could not remove presence for {}: {}", self.inner.user_id, e);
            }
        }

        let subscription = self.inner.wire().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        info!("Presence destroyed for {}", self.inner.key);
    }
}

impl TrackerInner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wire(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn heartbeat_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self) -> Path {
        path([USERS, self.user_id.as_str()])
    }

    fn touch(&self) {
        self.state().local.last_active_time = Utc::now().timestamp_millis();
    }

    /// Replace the cached presence document with the server's snapshot
    async fn reload(&self) {
        match self
            .client
            .get_snapshot(&self.key.collection, &self.key.document)
            .await
        {
            Ok(snapshot) => {
                let mut state = self.state();
                state.published = get_at(&snapshot.data, &self.entry_path()).cloned();
                state.doc = snapshot.data;
            }
            Err(e) => warn!("Could not load presence for {}: {}", self.key, e),
        }
    }

    fn apply_remote(&self, event: &OpEvent) {
        let mut state = self.state();
        for op in &event.ops {
            if let Err(e) = apply_confirmed(&mut state.doc, op) {
                debug!("Skipping presence op on {}: {}", self.key, e);
            }
        }
    }

    async fn mutate<F>(&self, change: F)
    where
        F: FnOnce(&mut PresenceEntry),
    {
        let ready = {
            let mut state = self.state();
            if state.phase == PresencePhase::Destroyed {
                debug!("Ignoring presence change after destroy");
                return;
            }
            change(&mut state.local);
            state.local.last_active_time = Utc::now().timestamp_millis();
            state.phase == PresencePhase::Ready
        };

        if ready {
            self.publish().await;
        }
    }

    /// Send our entry to the server. Returns false if it could not be published.
    async fn publish(&self) -> bool {
        let _publishing = self.publishing.lock().await;

        let (op, value) = {
            let state = self.state();
            let value = match serde_json::to_value(&state.local) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Could not encode presence entry: {}", e);
                    return false;
                }
            };

            let target = self.entry_path();
            let previous = state
                .published
                .clone()
                .or_else(|| get_at(&state.doc, &target).cloned());
            let op = match previous {
                Some(old_value) => Operation::replace(target, value.clone(), old_value),
                None => Operation::insert(target, value.clone()),
            };
            (op, value)
        };

        match self
            .client
            .submit(&self.key.collection, &self.key.document, vec![op])
            .await
        {
            Ok(()) => {
                self.state().published = Some(value);
                true
            }
            Err(e) => {
                warn!("Presence publish for {} failed: {}", self.user_id, e);
                false
            }
        }
    }
}

enum Wake {
    Tick,
    /// `None` when events were dropped and any document may be stale
    Resync(Option<DocKey>),
}

/// Republish our entry every `period`, and reload the document after a
/// reconnect since presence ops may have been missed
async fn heartbeat(
    inner: Weak<TrackerInner>,
    period: Duration,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let wake = tokio::select! {
            _ = ticker.tick() => Wake::Tick,
            event = events.recv() => match event {
                Ok(ClientEvent::ResyncRequired(key)) => Wake::Resync(Some(key)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Presence missed {} client events", skipped);
                    Wake::Resync(None)
                }
                Err(RecvError::Closed) => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.state().phase != PresencePhase::Ready {
            break;
        }
        match wake {
            Wake::Tick => debug!("Presence heartbeat for {}", inner.user_id),
            Wake::Resync(Some(key)) if key != inner.key => continue,
            Wake::Resync(_) => {
                debug!("Reloading presence for {}", inner.key);
                inner.reload().await;
            }
        }
        inner.touch();
        inner.publish().await;
    }
}
