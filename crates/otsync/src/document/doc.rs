use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use super::{DocumentUpdate, EntityKind};
use crate::client::{OpEvent, Subscription};
use crate::error::ApplyError;
use crate::protocol::operation::{dotted, get_at, PathSegment};
use crate::protocol::{DocKey, Operation, Snapshot};
use crate::transform::ConflictResolver;

/// Cached client-side copy of one collaborative document
///
/// Documents are owned by the [`DocumentRegistry`](super::DocumentRegistry).
/// Cached data only changes when the server confirms an operation by echoing
/// it, or when a snapshot is loaded.
pub struct Document {
    key: DocKey,
    kind: Option<EntityKind>,
    state: Mutex<DocState>,
    update_tx: broadcast::Sender<DocumentUpdate>,
    wire: Mutex<Option<Subscription>>,
    subscribers: AtomicUsize,
    next_batch: AtomicU64,
    destroyed: AtomicBool,
}

#[derive(Default)]
struct DocState {
    version: u64,
    data: JsonValue,
    loaded: bool,
    /// Submitted but unacknowledged operations, by batch id
    in_flight: BTreeMap<u64, InFlight>,
}

/// One submitted batch awaiting its `op-response`
#[derive(Default)]
struct InFlight {
    /// Already echoed back by the server, in submit order
    echoed: Vec<Operation>,
    /// Not seen yet; rebased over every remote op
    pending: Vec<Operation>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.echoed.len() + self.pending.len()
    }

    fn into_operations(self) -> Vec<Operation> {
        let mut operations = self.echoed;
        operations.extend(self.pending);
        operations
    }
}

impl Document {
    pub(crate) fn new(key: DocKey) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        let kind = EntityKind::from_collection(&key.collection);

        Self {
            key,
            kind,
            state: Mutex::new(DocState::default()),
            update_tx,
            wire: Mutex::new(None),
            subscribers: AtomicUsize::new(0),
            next_batch: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn collection(&self) -> &str {
        &self.key.collection
    }

    pub fn id(&self) -> &str {
        &self.key.document
    }

    /// Entity kind, when the collection follows the `<kind>_<scope>` naming
    pub fn kind(&self) -> Option<EntityKind> {
        self.kind
    }

    pub fn version(&self) -> u64 {
        self.state().version
    }

    /// Copy of the cached data tree
    pub fn data(&self) -> JsonValue {
        self.state().data.clone()
    }

    /// Cached value at `path`
    pub fn get(&self, path: &[PathSegment]) -> Option<JsonValue> {
        get_at(&self.state().data, path).cloned()
    }

    /// Cached value of one field or option, under the kind's property root
    pub fn property(&self, key: &str) -> Option<JsonValue> {
        let root = self.property_root();
        self.get(&[PathSegment::from(root), PathSegment::from(key)])
    }

    /// True once a snapshot has been loaded
    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Number of local operations still waiting for acknowledgement
    pub fn in_flight_operations(&self) -> usize {
        self.state().in_flight.values().map(InFlight::len).sum()
    }

    pub(crate) fn property_root(&self) -> &'static str {
        self.kind
            .unwrap_or(EntityKind::Record)
            .property_root()
    }

    fn state(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wire(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the wire subscription unless one is already held. Returns true
    /// if `connect` was called.
    pub(crate) fn ensure_attached<F>(&self, connect: F) -> bool
    where
        F: FnOnce() -> Subscription,
    {
        let mut wire = self.wire();
        if wire.is_some() {
            return false;
        }
        *wire = Some(connect());
        true
    }

    /// Drop the wire subscription and mark the document destroyed
    pub(crate) fn close(&self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(subscription) = self.wire().take() {
            subscription.unsubscribe();
        }
        info!("Closed document {}", self.key);
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> DocumentSubscription {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        DocumentSubscription {
            document: Arc::downgrade(self),
            updates: self.update_tx.subscribe(),
        }
    }

    /// Track operations that were just submitted. Returns the batch id.
    pub(crate) fn begin_batch(&self, ops: Vec<Operation>) -> u64 {
        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        self.state().in_flight.insert(
            batch,
            InFlight {
                echoed: Vec::new(),
                pending: ops,
            },
        );
        batch
    }

    /// Stop tracking a batch, returning what is left of it after rebasing
    pub(crate) fn finish_batch(&self, batch: u64) -> Vec<Operation> {
        self.state()
            .in_flight
            .remove(&batch)
            .map(InFlight::into_operations)
            .unwrap_or_default()
    }

    /// Apply operations the server broadcast for this document
    pub(crate) fn apply_remote(&self, event: &OpEvent) {
        let resolver = ConflictResolver::new();

        let update = {
            let mut state = self.state();
            let mut changes = BTreeMap::new();

            for op in &event.ops {
                if take_echo(&mut state.in_flight, op) {
                    debug!("Echo of our own op on {}", self.key);
                } else {
                    for batch in state.in_flight.values_mut() {
                        batch.pending = resolver.resolve(std::mem::take(&mut batch.pending), op);
                    }
                }
                match apply_confirmed(&mut state.data, op) {
                    Ok(applied) => changes.extend(applied),
                    Err(e) => warn!("Skipping op on {}: {}", self.key, e),
                }
            }

            let next = event.version.map_or(state.version + 1, |v| v + 1);
            state.version = next.max(state.version);
            debug!(
                "Applied {} ops to {} at version {}",
                event.ops.len(),
                self.key,
                state.version
            );

            self.update(state.version, changes, false)
        };

        self.emit(update);
    }

    /// Replace the cache with a snapshot. Older snapshots are ignored unless
    /// `resynced` is set, in which case the snapshot always wins.
    pub(crate) fn load_snapshot(&self, snapshot: Snapshot, resynced: bool) -> bool {
        let update = {
            let mut state = self.state();
            if !resynced && state.loaded && snapshot.version < state.version {
                debug!(
                    "Ignoring stale snapshot v{} for {} at v{}",
                    snapshot.version, self.key, state.version
                );
                return false;
            }

            state.version = snapshot.version;
            state.data = snapshot.data;
            state.loaded = true;
            self.update(state.version, flatten(&state.data), resynced)
        };

        self.emit(update);
        true
    }

    fn update(
        &self,
        version: u64,
        changes: BTreeMap<String, JsonValue>,
        resynced: bool,
    ) -> DocumentUpdate {
        DocumentUpdate {
            collection: self.key.collection.clone(),
            id: self.key.document.clone(),
            version,
            changes,
            resynced,
        }
    }

    fn emit(&self, update: DocumentUpdate) {
        // No receivers just means nobody is listening right now.
        let _ = self.update_tx.send(update);
    }
}

/// Mark `op` as echoed if it is the next unseen op of the oldest batch.
///
/// The server applies our submits in order, so only that op can be our own.
fn take_echo(in_flight: &mut BTreeMap<u64, InFlight>, op: &Operation) -> bool {
    let Some(batch) = in_flight.values_mut().find(|batch| !batch.pending.is_empty()) else {
        return false;
    };
    if !is_echo(&batch.pending[0], op) {
        return false;
    }
    let echoed = batch.pending.remove(0);
    batch.echoed.push(echoed);
    true
}

/// A replace may come back with a different `old_value` when the server
/// rebased it; the write itself is what identifies it.
fn is_echo(local: &Operation, remote: &Operation) -> bool {
    match (local, remote) {
        (
            Operation::Replace {
                path: local_path,
                value: local_value,
                ..
            },
            Operation::Replace { path, value, .. },
        ) => local_path == path && local_value == value,
        _ => local == remote,
    }
}

/// Apply a server-confirmed operation to a cache that may be partial.
///
/// The server is authoritative, so a replace of a value the cache never saw
/// is written as an insert and a delete of one is reported as removed.
pub(crate) fn apply_confirmed(
    data: &mut JsonValue,
    op: &Operation,
) -> Result<Vec<(String, JsonValue)>, ApplyError> {
    match (op, op.apply_to(data)) {
        (Operation::Replace { path, value, .. }, Err(ApplyError::NotFound { .. })) => {
            Operation::insert(path.clone(), value.clone()).apply_to(data)
        }
        (Operation::Delete { path, .. }, Err(ApplyError::NotFound { .. })) => {
            Ok(vec![(dotted(path), JsonValue::Null)])
        }
        (_, result) => result,
    }
}

/// Flatten a tree into dotted leaf paths
fn flatten(data: &JsonValue) -> BTreeMap<String, JsonValue> {
    fn walk(prefix: &str, value: &JsonValue, out: &mut BTreeMap<String, JsonValue>) {
        match value {
            JsonValue::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&path, child, out);
                }
            }
            leaf => {
                out.insert(prefix.to_string(), leaf.clone());
            }
        }
    }

    let mut out = BTreeMap::new();
    if !data.is_null() {
        walk("", data, &mut out);
    }
    out
}

/// A thread-safe handle to a registered document
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<Document>,
}

impl DocumentHandle {
    pub(crate) fn new(document: Arc<Document>) -> Self {
        Self { inner: document }
    }

    pub(crate) fn document(&self) -> &Arc<Document> {
        &self.inner
    }

    pub fn key(&self) -> &DocKey {
        self.inner.key()
    }

    pub fn collection(&self) -> &str {
        self.inner.collection()
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn kind(&self) -> Option<EntityKind> {
        self.inner.kind()
    }

    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    pub fn data(&self) -> JsonValue {
        self.inner.data()
    }

    pub fn get(&self, path: &[PathSegment]) -> Option<JsonValue> {
        self.inner.get(path)
    }

    pub fn property(&self, key: &str) -> Option<JsonValue> {
        self.inner.property(key)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn in_flight_operations(&self) -> usize {
        self.inner.in_flight_operations()
    }
}

/// Stream of [`DocumentUpdate`]s for one document.
///
/// Counts toward the document's subscriber count until dropped. Ends once the
/// document has been destroyed and every handle to it released.
pub struct DocumentSubscription {
    document: Weak<Document>,
    updates: broadcast::Receiver<DocumentUpdate>,
}

impl DocumentSubscription {
    /// Wait for the next update
    pub async fn recv(&mut self) -> Option<DocumentUpdate> {
        loop {
            match self.updates.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Document subscriber lagged, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next update if one is already queued
    pub fn try_recv(&mut self) -> Option<DocumentUpdate> {
        loop {
            match self.updates.try_recv() {
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Document subscriber lagged, skipped {} updates", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        if let Some(document) = self.document.upgrade() {
            document.subscribers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::operation::path;
    use serde_json::json;

    fn record() -> Arc<Document> {
        Arc::new(Document::new(DocKey::new("rec_t1", "r1")))
    }

    fn remote(ops: Vec<Operation>, version: Option<u64>) -> OpEvent {
        OpEvent {
            key: DocKey::new("rec_t1", "r1"),
            ops,
            version,
        }
    }

    #[tokio::test]
    async fn test_document_creation() {
        let doc = record();
        assert_eq!(doc.id(), "r1");
        assert_eq!(doc.collection(), "rec_t1");
        assert_eq!(doc.kind(), Some(EntityKind::Record));
        assert_eq!(doc.version(), 0);
        assert!(!doc.is_loaded());
        assert_eq!(doc.data(), JsonValue::Null);
    }

    #[tokio::test]
    async fn test_remote_ops_update_cache_and_notify() {
        let doc = record();
        let mut updates = doc.subscribe();
        assert_eq!(doc.subscriber_count(), 1);

        doc.load_snapshot(
            Snapshot {
                id: "r1".to_string(),
                version: 4,
                doc_type: None,
                data: json!({"fields": {"status": "todo", "owner": "ann"}}),
            },
            false,
        );
        let loaded = updates.try_recv().unwrap();
        assert_eq!(loaded.changes.get("fields.status"), Some(&json!("todo")));
        assert!(!loaded.resynced);

        doc.apply_remote(&remote(
            vec![
                Operation::replace(path(["fields", "status"]), json!("done"), json!("todo")),
                Operation::delete(path(["fields", "owner"]), json!("ann")),
            ],
            Some(4),
        ));

        let update = updates.try_recv().unwrap();
        assert_eq!(update.version, 5);
        assert_eq!(update.changes.get("fields.status"), Some(&json!("done")));
        assert_eq!(update.changes.get("fields.owner"), Some(&JsonValue::Null));
        assert_eq!(doc.property("status"), Some(json!("done")));
        assert_eq!(doc.property("owner"), None);

        drop(updates);
        assert_eq!(doc.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_replace_on_partial_cache_is_written() {
        let doc = record();
        doc.apply_remote(&remote(
            vec![Operation::replace(
                path(["fields", "status"]),
                json!("done"),
                json!("todo"),
            )],
            None,
        ));
        assert_eq!(doc.property("status"), Some(json!("done")));
        assert_eq!(doc.version(), 1);
    }

    #[tokio::test]
    async fn test_failed_remote_move_keeps_cache() {
        let doc = record();
        doc.load_snapshot(
            Snapshot {
                id: "r1".to_string(),
                version: 1,
                doc_type: None,
                data: json!({"a": {"x": 1}, "b": {"y": 2}}),
            },
            false,
        );

        doc.apply_remote(&remote(
            vec![Operation::move_to(path(["a", "x"]), path(["b", "y"]))],
            Some(1),
        ));
        assert_eq!(doc.data(), json!({"a": {"x": 1}, "b": {"y": 2}}));
        assert_eq!(doc.version(), 2);
    }

    #[tokio::test]
    async fn test_remote_ops_rebase_in_flight_batches() {
        let doc = record();
        let batch = doc.begin_batch(vec![
            Operation::insert(path(["fields", "notes", "a"]), json!("x")),
            Operation::replace(path(["fields", "status"]), json!("done"), json!("todo")),
        ]);
        assert_eq!(doc.in_flight_operations(), 2);

        doc.apply_remote(&remote(
            vec![
                Operation::delete(path(["fields", "notes"]), json!({})),
                Operation::replace(path(["fields", "status"]), json!("doing"), json!("todo")),
            ],
            None,
        ));

        assert_eq!(
            doc.finish_batch(batch),
            vec![Operation::replace(
                path(["fields", "status"]),
                json!("done"),
                json!("doing")
            )]
        );
        assert_eq!(doc.in_flight_operations(), 0);
    }

    #[tokio::test]
    async fn test_echo_before_ack_is_not_rebased() {
        let doc = record();
        let replace = Operation::replace(path(["fields", "status"]), json!("done"), json!("todo"));
        let delete = Operation::delete(path(["fields", "owner"]), json!("ann"));
        let batch = doc.begin_batch(vec![replace.clone(), delete.clone()]);

        doc.apply_remote(&remote(vec![replace.clone()], Some(1)));
        doc.apply_remote(&remote(vec![delete.clone()], Some(2)));

        assert_eq!(doc.in_flight_operations(), 2);
        assert_eq!(doc.property("status"), Some(json!("done")));
        assert_eq!(doc.finish_batch(batch), vec![replace, delete]);
    }

    #[tokio::test]
    async fn test_remote_op_matching_later_local_op_is_rebased() {
        let doc = record();
        let first = Operation::insert(path(["fields", "a"]), json!(1));
        let second = Operation::delete(path(["fields", "b"]), json!(2));
        let batch = doc.begin_batch(vec![first.clone(), second.clone()]);

        // not the head of the batch, so it came from someone else
        doc.apply_remote(&remote(vec![second], None));

        assert_eq!(doc.finish_batch(batch), vec![first]);
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored_unless_resyncing() {
        let doc = record();
        let snapshot = |version, status: &str| Snapshot {
            id: "r1".to_string(),
            version,
            doc_type: None,
            data: json!({"fields": {"status": status}}),
        };

        assert!(doc.load_snapshot(snapshot(7, "new"), false));
        assert!(!doc.load_snapshot(snapshot(3, "old"), false));
        assert_eq!(doc.property("status"), Some(json!("new")));

        assert!(doc.load_snapshot(snapshot(3, "old"), true));
        assert_eq!(doc.version(), 3);
    }

    #[test]
    fn test_flatten_reports_leaves() {
        let flat = flatten(&json!({"fields": {"a": 1, "b": {"c": true}}, "empty": {}}));
        assert_eq!(flat.len(), 3);
        assert_eq!(flat["fields.a"], json!(1));
        assert_eq!(flat["fields.b.c"], json!(true));
        assert_eq!(flat["empty"], json!({}));
        assert!(flatten(&JsonValue::Null).is_empty());
    }
}
