#![allow(dead_code)]

use otsync::protocol::{OpPayload, SnapshotPayload};
use otsync::{
    Codec, EngineConfig, Envelope, MemoryTransport, Message, Operation, Snapshot, SyncEngine,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Plays the server side of a [`MemoryTransport`]
pub struct TestServer {
    pub transport: Arc<MemoryTransport>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TestServer {
    pub fn new() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let outbound = transport.take_outbound().unwrap();
        Self {
            transport,
            outbound,
        }
    }

    /// Next message the client sent
    pub async fn recv(&mut self) -> Message {
        let frame = timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("client should send a frame")
            .expect("outbound stream open");
        Codec::default().decode(&frame).unwrap().message
    }

    /// Skip messages until one matches `pred`
    pub async fn recv_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    pub fn send(&self, message: Message) {
        let frame = Codec::default().encode(&Envelope::new(message)).unwrap();
        self.transport.deliver(frame);
    }

    pub fn ack(&self, id: &str) {
        self.send(Message::OpResponse {
            id: id.to_string(),
            error: None,
        });
    }

    pub fn op(&self, collection: &str, document: &str, ops: Vec<Operation>, version: Option<u64>) {
        self.send(Message::Op {
            collection: collection.to_string(),
            document: document.to_string(),
            data: OpPayload { op: ops, v: version },
        });
    }

    pub fn snapshot(&self, id: &str, collection: &str, document: &str, version: u64, data: JsonValue) {
        self.send(Message::SnapshotResponse {
            id: id.to_string(),
            collection: collection.to_string(),
            document: document.to_string(),
            data: Some(SnapshotPayload {
                snapshot: Snapshot {
                    id: document.to_string(),
                    version,
                    doc_type: None,
                    data,
                },
            }),
            error: None,
        });
    }

    /// Engine for user `u1` wired to this server, already connected
    pub async fn engine(&self) -> SyncEngine {
        let config = EngineConfig {
            user_id: Some("u1".to_string()),
            ..EngineConfig::new("memory://integration")
        };
        let engine = SyncEngine::with_transport(config, self.transport.clone()).unwrap();
        engine.wait_ready(Duration::from_secs(2)).await.unwrap();
        engine
    }
}
