use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::{
    Document, DocumentHandle, DocumentSubscription, EntityAccessor, EntityKind, SubmitOutcome,
};
use crate::client::{AckHook, ProtocolClient};
use crate::history::{HistoryEntry, SharedHistory};
use crate::protocol::{DocKey, Operation, PathSegment};
use crate::transform::merge_operations;
use crate::{SyncError, SyncResult};

/// Owns every cached document and routes edits through the protocol client
///
/// The registry is the entry point for document access. There is at most one
/// [`Document`] per `(collection, id)`; callers only ever hold handles.
pub struct DocumentRegistry {
    documents: DashMap<DocKey, Arc<Document>>,
    client: ProtocolClient,
    history: Option<SharedHistory>,
    user_id: Option<String>,
}

impl DocumentRegistry {
    pub fn new(client: ProtocolClient) -> Self {
        Self {
            documents: DashMap::new(),
            client,
            history: None,
            user_id: None,
        }
    }

    /// Record acknowledged edits in `history`, attributed to `user_id`
    pub fn with_history(mut self, history: SharedHistory, user_id: Option<String>) -> Self {
        self.history = Some(history);
        self.user_id = user_id;
        self
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn records(&self, table_id: &str) -> EntityAccessor<'_> {
        EntityAccessor::new(self, EntityKind::Record, table_id)
    }

    pub fn fields(&self, table_id: &str) -> EntityAccessor<'_> {
        EntityAccessor::new(self, EntityKind::Field, table_id)
    }

    pub fn views(&self, table_id: &str) -> EntityAccessor<'_> {
        EntityAccessor::new(self, EntityKind::View, table_id)
    }

    pub fn tables(&self, base_id: &str) -> EntityAccessor<'_> {
        EntityAccessor::new(self, EntityKind::Table, base_id)
    }

    /// Get the document for `(collection, id)`, creating it on first access
    pub fn get(&self, collection: &str, id: &str) -> DocumentHandle {
        let key = DocKey::new(collection, id);
        let document = self
            .documents
            .entry(key.clone())
            .or_insert_with(|| {
                info!("Creating document {}", key);
                Arc::new(Document::new(key.clone()))
            })
            .clone();

        DocumentHandle::new(document)
    }

    /// Get an existing document without creating it
    pub fn find(&self, collection: &str, id: &str) -> Option<DocumentHandle> {
        self.documents
            .get(&DocKey::new(collection, id))
            .map(|entry| DocumentHandle::new(entry.value().clone()))
    }

    /// Keys of all registered documents, sorted
    pub fn list_documents(&self) -> Vec<DocKey> {
        let mut keys: Vec<DocKey> = self
            .documents
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Receive updates for a document.
    ///
    /// The first subscriber opens the server subscription, which then stays
    /// open until the document is destroyed.
    pub fn subscribe(&self, handle: &DocumentHandle) -> DocumentSubscription {
        let document = handle.document();
        if document.is_destroyed() {
            warn!("Subscribing to destroyed document {}", document.key());
        } else if document.ensure_attached(|| self.open_wire(document)) {
            debug!("Opened server subscription for {}", document.key());
        }
        document.subscribe()
    }

    fn open_wire(&self, document: &Arc<Document>) -> crate::client::Subscription {
        let weak = Arc::downgrade(document);
        self.client
            .subscribe(document.collection(), document.id(), move |event| {
                if let Some(document) = weak.upgrade() {
                    document.apply_remote(event);
                }
            })
    }

    /// Load the server's snapshot into the cache. Returns the cached version.
    pub async fn fetch(&self, handle: &DocumentHandle) -> SyncResult<u64> {
        let snapshot = self
            .client
            .get_snapshot(handle.collection(), handle.id())
            .await?;
        handle.document().load_snapshot(snapshot, false);
        Ok(handle.version())
    }

    /// Reload a document after ops may have been missed.
    ///
    /// Returns false if the document is not registered here.
    pub async fn resync(&self, key: &DocKey) -> SyncResult<bool> {
        let Some(handle) = self.find(&key.collection, &key.document) else {
            return Ok(false);
        };

        let snapshot = self
            .client
            .get_snapshot(&key.collection, &key.document)
            .await?;
        info!("Resynced {} at version {}", key, snapshot.version);
        handle.document().load_snapshot(snapshot, true);
        Ok(true)
    }

    /// Submit operations against a document and wait for the server.
    ///
    /// Consecutive replaces of one path are merged first. The cache is not
    /// touched here; it changes when the server echoes the operations back.
    pub async fn submit(
        &self,
        handle: &DocumentHandle,
        ops: Vec<Operation>,
    ) -> SyncResult<SubmitOutcome> {
        let document = handle.document().clone();
        if document.is_destroyed() {
            return Err(SyncError::invalid_state(format!(
                "document {} was destroyed",
                document.key()
            )));
        }

        let ops = merge_operations(ops);
        if ops.is_empty() {
            return Ok(SubmitOutcome::NoOp);
        }

        let batch = document.begin_batch(ops.clone());
        let _in_flight = BatchGuard {
            document: document.clone(),
            batch,
        };
        let acked: Arc<Mutex<Option<Vec<Operation>>>> = Arc::default();
        let hook: AckHook = {
            let document = document.clone();
            let acked = acked.clone();
            Box::new(move || {
                let remaining = document.finish_batch(batch);
                *acked.lock().unwrap_or_else(PoisonError::into_inner) = Some(remaining);
            })
        };

        self.client
            .submit_with_hook(document.collection(), document.id(), ops, Some(hook))
            .await?;

        let operations = acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| document.finish_batch(batch));

        if operations.is_empty() {
            info!(
                "Submit on {} became a no-op after concurrent edits",
                document.key()
            );
            return Ok(SubmitOutcome::NoOp);
        }

        self.record_history(&document, &operations);
        Ok(SubmitOutcome::Acknowledged { operations })
    }

    fn record_history(&self, document: &Document, operations: &[Operation]) {
        let Some(history) = &self.history else {
            return;
        };

        let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
        for op in operations {
            let mut entry = HistoryEntry::new(op.clone(), describe(op));
            entry.user_id = self.user_id.clone();
            match document.kind() {
                Some(EntityKind::Record) => {
                    entry.record_id = Some(document.id().to_string());
                    entry.field_id = match op.path().as_slice() {
                        [PathSegment::Key(root), field, ..] if root == "fields" => {
                            Some(field.to_string())
                        }
                        _ => None,
                    };
                }
                Some(EntityKind::Field) => entry.field_id = Some(document.id().to_string()),
                _ => {}
            }
            history.push(entry);
        }
    }

    /// Unsubscribe and forget a document.
    ///
    /// Returns false if it was not registered, which makes repeated calls harmless.
    pub fn destroy(&self, collection: &str, id: &str) -> bool {
        match self.documents.remove(&DocKey::new(collection, id)) {
            Some((_, document)) => {
                document.close();
                true
            }
            None => {
                debug!("Attempted to destroy unknown document {}/{}", collection, id);
                false
            }
        }
    }
}

/// Stops tracking a batch however the submit ends, including when the
/// caller drops the future
struct BatchGuard {
    document: Arc<Document>,
    batch: u64,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.document.finish_batch(self.batch);
    }
}

fn describe(op: &Operation) -> String {
    let key = op
        .path()
        .last()
        .map(ToString::to_string)
        .unwrap_or_default();
    match op {
        Operation::Insert { .. } | Operation::Replace { .. } => format!("Set {}", key),
        Operation::Delete { .. } => format!("Delete {}", key),
        Operation::Move { from, .. } => {
            let from = from.last().map(ToString::to_string).unwrap_or_default();
            format!("Move {} to {}", from, key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::OperationHistory;
    use crate::protocol::operation::path;
    use crate::protocol::{Codec, Envelope, Message, OpPayload, Snapshot, SnapshotPayload};
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Server {
        transport: Arc<MemoryTransport>,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl Server {
        async fn recv(&mut self) -> Message {
            let frame = timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .expect("client should send a frame")
                .unwrap();
            Codec::default().decode(&frame).unwrap().message
        }

        fn send(&self, message: Message) {
            let frame = Codec::default().encode(&Envelope::new(message)).unwrap();
            self.transport.deliver(frame);
        }

        fn op(&self, ops: Vec<Operation>) {
            self.send(Message::Op {
                collection: "rec_t1".to_string(),
                document: "r1".to_string(),
                data: OpPayload { op: ops, v: None },
            });
        }
    }

    async fn setup() -> (Arc<DocumentRegistry>, SharedHistory, Server) {
        let transport = Arc::new(MemoryTransport::new());
        let outbound = transport.take_outbound().unwrap();
        let client =
            ProtocolClient::new(transport.clone(), Codec::default(), Duration::from_secs(10))
                .unwrap();
        transport.connect("memory://test");
        client.wait_ready(Duration::from_secs(1)).await.unwrap();

        let history = OperationHistory::shared(100);
        let registry = Arc::new(
            DocumentRegistry::new(client).with_history(history.clone(), Some("u1".to_string())),
        );
        (
            registry,
            history,
            Server {
                transport,
                outbound,
            },
        )
    }

    #[tokio::test]
    async fn test_get_returns_one_document_per_key() {
        let (registry, _, _server) = setup().await;

        let a = registry.get("rec_t1", "r1");
        let b = registry.get("rec_t1", "r1");
        registry.get("rec_t1", "r2");

        assert!(Arc::ptr_eq(a.document(), b.document()));
        assert_eq!(registry.document_count(), 2);
        assert_eq!(
            registry.list_documents(),
            vec![DocKey::new("rec_t1", "r1"), DocKey::new("rec_t1", "r2")]
        );
        assert!(registry.find("rec_t1", "r3").is_none());
    }

    #[tokio::test]
    async fn test_subscribers_share_one_server_subscription() {
        let (registry, _, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");

        let _first = registry.subscribe(&handle);
        let second = registry.subscribe(&handle);
        assert!(matches!(server.recv().await, Message::Subscribe { .. }));
        assert_eq!(handle.subscriber_count(), 2);

        drop(second);
        assert_eq!(handle.subscriber_count(), 1);
        assert!(server.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submit_applies_on_echo_and_records_history() {
        let (registry, history, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");
        let mut updates = registry.subscribe(&handle);
        server.recv().await;

        let op = Operation::replace(path(["fields", "status"]), json!("done"), json!("todo"));
        let submit = {
            let registry = registry.clone();
            let handle = handle.clone();
            let op = op.clone();
            tokio::spawn(async move { registry.submit(&handle, vec![op]).await })
        };

        let id = server.recv().await.request_id().unwrap().to_string();
        assert_eq!(handle.property("status"), None);
        server.send(Message::OpResponse { id, error: None });
        server.op(vec![op.clone()]);

        let outcome = submit.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Acknowledged {
                operations: vec![op]
            }
        );

        let update = timeout(Duration::from_secs(1), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.changes.get("fields.status"), Some(&json!("done")));
        assert_eq!(handle.property("status"), Some(json!("done")));

        let history = history.lock().unwrap();
        assert_eq!(history.len(), 1);
        let entry = &history.entries()[0];
        assert_eq!(entry.description, "Set status");
        assert_eq!(entry.record_id.as_deref(), Some("r1"));
        assert_eq!(entry.field_id.as_deref(), Some("status"));
        assert_eq!(entry.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_echo_arriving_before_ack_keeps_submitted_ops() {
        let (registry, history, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");
        let _updates = registry.subscribe(&handle);
        server.recv().await;

        let replace = Operation::replace(path(["fields", "status"]), json!("done"), json!("todo"));
        let delete = Operation::delete(path(["fields", "owner"]), json!("ann"));
        let submit = {
            let registry = registry.clone();
            let handle = handle.clone();
            let ops = vec![replace.clone(), delete.clone()];
            tokio::spawn(async move { registry.submit(&handle, ops).await })
        };

        let id = server.recv().await.request_id().unwrap().to_string();
        server.op(vec![replace.clone(), delete.clone()]);
        server.send(Message::OpResponse { id, error: None });

        assert_eq!(
            submit.await.unwrap().unwrap(),
            SubmitOutcome::Acknowledged {
                operations: vec![replace, delete]
            }
        );
        assert_eq!(handle.property("status"), Some(json!("done")));

        let history = history.lock().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.entries()[0].inverse(),
            Operation::replace(path(["fields", "status"]), json!("todo"), json!("done"))
        );
        assert_eq!(history.entries()[1].description, "Delete owner");
    }

    #[tokio::test]
    async fn test_cancelled_submit_is_a_noop() {
        let (registry, history, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");
        let _updates = registry.subscribe(&handle);
        server.recv().await;

        let submit = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                registry
                    .submit(
                        &handle,
                        vec![Operation::insert(path(["fields", "tags", "a"]), json!(1))],
                    )
                    .await
            })
        };
        let id = server.recv().await.request_id().unwrap().to_string();

        // Another client removed the parent before our op was acknowledged.
        server.op(vec![Operation::delete(path(["fields", "tags"]), json!({}))]);
        server.send(Message::OpResponse { id, error: None });

        assert_eq!(submit.await.unwrap().unwrap(), SubmitOutcome::NoOp);
        assert!(history.lock().unwrap().is_empty());
        assert_eq!(handle.in_flight_operations(), 0);
    }

    #[tokio::test]
    async fn test_rejected_submit_clears_in_flight() {
        let (registry, _, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");

        let submit = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                registry
                    .submit(
                        &handle,
                        vec![Operation::insert(path(["fields", "a"]), json!(1))],
                    )
                    .await
            })
        };
        let id = server.recv().await.request_id().unwrap().to_string();
        assert_eq!(handle.in_flight_operations(), 1);

        server.send(Message::OpResponse {
            id,
            error: Some("forbidden".to_string()),
        });
        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::ServerRejected { .. }));
        assert_eq!(handle.in_flight_operations(), 0);
    }

    #[tokio::test]
    async fn test_fetch_and_resync() {
        let (registry, _, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");
        let mut updates = registry.subscribe(&handle);
        server.recv().await;

        let snapshot_reply = |id: String, version: u64, status: &str| Message::SnapshotResponse {
            id,
            collection: "rec_t1".to_string(),
            document: "r1".to_string(),
            data: Some(SnapshotPayload {
                snapshot: Snapshot {
                    id: "r1".to_string(),
                    version,
                    doc_type: Some("json0".to_string()),
                    data: json!({"fields": {"status": status}}),
                },
            }),
            error: None,
        };

        let fetch = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move { registry.fetch(&handle).await })
        };
        let id = server.recv().await.request_id().unwrap().to_string();
        server.send(snapshot_reply(id, 2, "todo"));
        assert_eq!(fetch.await.unwrap().unwrap(), 2);
        assert!(!updates.recv().await.unwrap().resynced);

        let resync = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resync(&DocKey::new("rec_t1", "r1")).await })
        };
        let id = server.recv().await.request_id().unwrap().to_string();
        server.send(snapshot_reply(id, 9, "done"));
        assert!(resync.await.unwrap().unwrap());

        let update = updates.recv().await.unwrap();
        assert!(update.resynced);
        assert_eq!(update.version, 9);
        assert_eq!(update.changes.get("fields.status"), Some(&json!("done")));

        assert!(!registry
            .resync(&DocKey::new("rec_t1", "unknown"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (registry, _, mut server) = setup().await;
        let handle = registry.get("rec_t1", "r1");
        let _updates = registry.subscribe(&handle);
        server.recv().await;

        assert!(registry.destroy("rec_t1", "r1"));
        assert!(matches!(server.recv().await, Message::Unsubscribe { .. }));
        assert!(handle.is_destroyed());
        assert_eq!(registry.document_count(), 0);

        assert!(!registry.destroy("rec_t1", "r1"));
        assert!(server.outbound.try_recv().is_err());

        let err = registry.submit(&handle, vec![]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
    }

    #[test]
    fn test_describe_uses_last_segment() {
        assert_eq!(
            describe(&Operation::replace(path(["fields", "status"]), json!(1), json!(0))),
            "Set status"
        );
        assert_eq!(
            describe(&Operation::delete(path(["options", "width"]), json!(3))),
            "Delete width"
        );
        assert_eq!(
            describe(&Operation::move_to(path(["a"]), path(["b"]))),
            "Move a to b"
        );
    }
}
