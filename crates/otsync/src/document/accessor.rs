use serde_json::Value as JsonValue;

use super::{DocumentHandle, DocumentRegistry, DocumentSubscription, EntityKind, SubmitOutcome};
use crate::protocol::operation::path;
use crate::protocol::Operation;
use crate::{SyncError, SyncResult};

/// Typed entry point for one kind of entity within a table or base
pub struct EntityAccessor<'a> {
    registry: &'a DocumentRegistry,
    kind: EntityKind,
    collection: String,
}

impl<'a> EntityAccessor<'a> {
    pub(crate) fn new(registry: &'a DocumentRegistry, kind: EntityKind, scope_id: &str) -> Self {
        Self {
            registry,
            kind,
            collection: kind.collection(scope_id),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn get(&self, id: &str) -> DocumentHandle {
        self.registry.get(&self.collection, id)
    }

    pub fn subscribe(&self, id: &str) -> DocumentSubscription {
        self.registry.subscribe(&self.get(id))
    }

    /// Get the document and load its current snapshot
    pub async fn fetch(&self, id: &str) -> SyncResult<DocumentHandle> {
        let handle = self.get(id);
        self.registry.fetch(&handle).await?;
        Ok(handle)
    }

    /// Set a record's value for one field
    pub async fn update_field(
        &self,
        id: &str,
        field_id: &str,
        value: JsonValue,
    ) -> SyncResult<SubmitOutcome> {
        if self.kind != EntityKind::Record {
            return Err(SyncError::invalid_state(format!(
                "{} documents have no fields; use update_property",
                self.kind
            )));
        }
        self.update_property(id, field_id, value).await
    }

    /// Set one value under the entity's property root
    pub async fn update_property(
        &self,
        id: &str,
        key: &str,
        value: JsonValue,
    ) -> SyncResult<SubmitOutcome> {
        let handle = self.get(id);
        let op = self.set_op(&handle, key, value);
        self.registry.submit(&handle, vec![op]).await
    }

    /// Set several values in one submit
    pub async fn batch_update<I, K>(&self, id: &str, values: I) -> SyncResult<SubmitOutcome>
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: AsRef<str>,
    {
        let handle = self.get(id);
        let ops: Vec<Operation> = values
            .into_iter()
            .map(|(key, value)| self.set_op(&handle, key.as_ref(), value))
            .collect();

        if ops.is_empty() {
            return Ok(SubmitOutcome::NoOp);
        }
        self.registry.submit(&handle, ops).await
    }

    /// Remove one value under the entity's property root
    pub async fn delete_field(&self, id: &str, key: &str) -> SyncResult<SubmitOutcome> {
        let handle = self.get(id);
        let old_value = handle.property(key).unwrap_or(JsonValue::Null);
        let op = Operation::delete(path([self.kind.property_root(), key]), old_value);
        self.registry.submit(&handle, vec![op]).await
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.registry.destroy(&self.collection, id)
    }

    /// Replace when the cache holds a value, insert otherwise
    fn set_op(&self, handle: &DocumentHandle, key: &str, value: JsonValue) -> Operation {
        let target = path([self.kind.property_root(), key]);
        match handle.get(&target) {
            Some(old_value) => Operation::replace(target, value, old_value),
            None => Operation::insert(target, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProtocolClient;
    use crate::protocol::{Codec, Message, PathSegment};
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn setup() -> (
        Arc<DocumentRegistry>,
        Arc<MemoryTransport>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let transport = Arc::new(MemoryTransport::new());
        let outbound = transport.take_outbound().unwrap();
        let client =
            ProtocolClient::new(transport.clone(), Codec::default(), Duration::from_secs(10))
                .unwrap();
        transport.connect("memory://test");
        client.wait_ready(Duration::from_secs(1)).await.unwrap();
        (Arc::new(DocumentRegistry::new(client)), transport, outbound)
    }

    async fn next_submit(outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Operation> {
        let frame = timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        match Codec::default().decode(&frame).unwrap().message {
            Message::Submit { data, .. } => data.op,
            other => panic!("Expected submit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accessors_map_to_collections() {
        let (registry, _, _) = setup().await;

        assert_eq!(registry.records("t1").collection(), "rec_t1");
        assert_eq!(registry.fields("t1").collection(), "fld_t1");
        assert_eq!(registry.views("t1").collection(), "viw_t1");
        assert_eq!(registry.tables("b1").collection(), "tbl_b1");

        let handle = registry.views("t1").get("v1");
        assert_eq!(handle.kind(), Some(EntityKind::View));
        assert_eq!(handle.key().collection, "viw_t1");
    }

    #[tokio::test]
    async fn test_update_field_inserts_then_replaces() {
        let (registry, _transport, mut outbound) = setup().await;

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .records("t1")
                    .update_field("r1", "status", json!("todo"))
                    .await
            })
        };
        assert_eq!(
            next_submit(&mut outbound).await,
            vec![Operation::insert(path(["fields", "status"]), json!("todo"))]
        );
        first.abort();

        let handle = registry.records("t1").get("r1");
        handle.document().load_snapshot(
            crate::protocol::Snapshot {
                id: "r1".to_string(),
                version: 1,
                doc_type: None,
                data: json!({"fields": {"status": "todo"}}),
            },
            false,
        );

        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .records("t1")
                    .update_field("r1", "status", json!("done"))
                    .await
            })
        };
        assert_eq!(
            next_submit(&mut outbound).await,
            vec![Operation::replace(
                path(["fields", "status"]),
                json!("done"),
                json!("todo")
            )]
        );
        second.abort();
    }

    #[tokio::test]
    async fn test_batch_update_is_one_submit() {
        let (registry, _transport, mut outbound) = setup().await;

        let batch = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .views("t1")
                    .batch_update("v1", [("width", json!(120)), ("frozen", json!(true))])
                    .await
            })
        };

        let ops = next_submit(&mut outbound).await;
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.path()[0] == PathSegment::from("options")));
        assert!(outbound.try_recv().is_err());
        batch.abort();
    }

    #[tokio::test]
    async fn test_update_field_requires_records() {
        let (registry, _, _) = setup().await;
        let err = registry
            .views("t1")
            .update_field("v1", "width", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_delete_field_uses_cached_old_value() {
        let (registry, _transport, mut outbound) = setup().await;
        registry.fields("t1").get("f1").document().load_snapshot(
            crate::protocol::Snapshot {
                id: "f1".to_string(),
                version: 1,
                doc_type: None,
                data: json!({"options": {"precision": 2}}),
            },
            false,
        );

        let delete = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.fields("t1").delete_field("f1", "precision").await })
        };
        assert_eq!(
            next_submit(&mut outbound).await,
            vec![Operation::delete(path(["options", "precision"]), json!(2))]
        );
        delete.abort();
    }
}
