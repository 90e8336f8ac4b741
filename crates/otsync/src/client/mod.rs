//! Protocol client: frames messages, correlates requests with responses,
//! and multiplexes per-document subscriptions over one transport.

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{
    Codec, DocKey, Envelope, Message, OpPayload, Operation, QueryPayload, QueryResults, Snapshot,
};
use crate::transport::{Transport, TransportEvent};
use crate::{SyncError, SyncResult};

mod pending;

pub(crate) use pending::AckHook;
use pending::{PendingRequest, RequestKind, Response};

/// Operations the server streamed for one subscribed document
#[derive(Debug, Clone, PartialEq)]
pub struct OpEvent {
    pub key: DocKey,
    pub ops: Vec<Operation>,
    pub version: Option<u64>,
}

/// Callback invoked on the read path for every `op` message of a document.
///
/// Runs inline with message delivery for all documents, so it must not block.
pub type OpCallback = Arc<dyn Fn(&OpEvent) + Send + Sync>;

/// Connection-level notifications for higher layers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connected and every active subscription has been (re)issued
    Ready,
    /// The transport dropped; pending requests were rejected
    Disconnected,
    /// Ops for this document may have been missed while disconnected
    ResyncRequired(DocKey),
}

#[derive(Default)]
struct Subscriptions {
    by_doc: HashMap<DocKey, BTreeMap<u64, OpCallback>>,
    connected_once: bool,
}

/// Client for the document sync protocol.
///
/// Cheap to clone; all clones share one pending-request map and one set of
/// subscriptions.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    codec: Codec,
    request_timeout: Duration,
    pending: DashMap<String, PendingRequest>,
    subscriptions: Mutex<Subscriptions>,
    next_subscription: AtomicU64,
    ready: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
}

impl ProtocolClient {
    /// Create a client that owns the transport's event stream.
    ///
    /// Must be called inside a Tokio runtime; the read path runs on a spawned task.
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Codec,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let events_rx = transport
            .take_events()
            .ok_or_else(|| SyncError::invalid_state("transport events already taken"))?;
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(ClientInner {
            transport,
            codec,
            request_timeout,
            pending: DashMap::new(),
            subscriptions: Mutex::new(Subscriptions::default()),
            next_subscription: AtomicU64::new(1),
            ready,
            events,
        });

        tokio::spawn(read_loop(Arc::downgrade(&inner), events_rx));
        Ok(Self { inner })
    }

    /// Subscribe to a document's op stream.
    ///
    /// Only the first callback for a document sends `subscribe`; later ones
    /// share the wire subscription. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, collection: &str, document: &str, on_op: F) -> Subscription
    where
        F: Fn(&OpEvent) + Send + Sync + 'static,
    {
        let key = DocKey::new(collection, document);
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);

        let mut subscriptions = self.inner.subscriptions();
        let callbacks = subscriptions.by_doc.entry(key.clone()).or_default();
        let first = callbacks.is_empty();
        callbacks.insert(id, Arc::new(on_op));

        if first && *self.inner.ready.borrow() {
            self.inner.send_or_log(Message::Subscribe {
                collection: key.collection.clone(),
                document: key.document.clone(),
            });
        }
        drop(subscriptions);

        debug!("Subscription {} registered for {}", id, key);
        Subscription {
            id,
            key,
            client: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Submit operations and wait for the server's acknowledgement
    pub async fn submit(
        &self,
        collection: &str,
        document: &str,
        ops: Vec<Operation>,
    ) -> SyncResult<()> {
        self.submit_with_hook(collection, document, ops, None).await
    }

    pub(crate) async fn submit_with_hook(
        &self,
        collection: &str,
        document: &str,
        ops: Vec<Operation>,
        on_ack: Option<AckHook>,
    ) -> SyncResult<()> {
        let message = |id| Message::Submit {
            id,
            collection: collection.to_string(),
            document: document.to_string(),
            data: OpPayload { op: ops, v: None },
        };

        match self.inner.request(RequestKind::Submit, message, on_ack).await? {
            Response::Ack => Ok(()),
            other => Err(SyncError::protocol(format!(
                "unexpected response to submit: {:?}",
                other
            ))),
        }
    }

    /// Fetch the current snapshot of a document
    pub async fn get_snapshot(&self, collection: &str, document: &str) -> SyncResult<Snapshot> {
        let message = |id| Message::GetSnapshot {
            id,
            collection: collection.to_string(),
            document: document.to_string(),
        };

        match self.inner.request(RequestKind::GetSnapshot, message, None).await? {
            Response::Snapshot(snapshot) => Ok(snapshot),
            other => Err(SyncError::protocol(format!(
                "unexpected response to get-snapshot: {:?}",
                other
            ))),
        }
    }

    /// Run a query against a collection
    pub async fn query(
        &self,
        collection: &str,
        query: JsonValue,
        options: JsonValue,
    ) -> SyncResult<QueryResults> {
        let message = |id| Message::Query {
            id,
            collection: collection.to_string(),
            data: QueryPayload { query, options },
        };

        match self.inner.request(RequestKind::Query, message, None).await? {
            Response::Query(results) => Ok(results),
            other => Err(SyncError::protocol(format!(
                "unexpected response to query: {:?}",
                other
            ))),
        }
    }

    /// Receive connection-level events
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// True once connected and all subscriptions have been re-issued
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the client is ready, up to `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> SyncResult<()> {
        self.inner
            .wait_ready(Instant::now() + timeout, "ready")
            .await
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Documents with at least one active callback
    pub fn subscribed_documents(&self) -> Vec<DocKey> {
        let mut keys: Vec<DocKey> = self.inner.subscriptions().by_doc.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of callbacks registered for a document
    pub fn subscriber_count(&self, key: &DocKey) -> usize {
        self.inner
            .subscriptions()
            .by_doc
            .get(key)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

/// Handle to one registered op callback
///
/// The callback stays registered until [`Subscription::unsubscribe`] is called
/// or the handle is dropped.
pub struct Subscription {
    id: u64,
    key: DocKey,
    client: Weak<ClientInner>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Remove the callback, sending `unsubscribe` if it was the last one
    pub fn unsubscribe(self) {
        self.release();
    }

    fn release(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            inner.unsubscribe(self.id, &self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl ClientInner {
    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: Message) -> SyncResult<()> {
        debug!("Sending {} message", message.type_name());
        let frame = self.codec.encode(&Envelope::new(message))?;
        self.transport.send(frame);
        Ok(())
    }

    fn send_or_log(&self, message: Message) {
        let type_name = message.type_name();
        if let Err(e) = self.send(message) {
            error!("Failed to encode {} message: {}", type_name, e);
        }
    }

    async fn wait_ready(&self, deadline: Instant, request_id: &str) -> SyncResult<()> {
        let mut ready = self.ready.subscribe();
        let waited = tokio::time::timeout_at(deadline, ready.wait_for(|ready| *ready))
            .await
            .map(|changed| changed.map(drop));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::ConnectionLost),
            Err(_) => Err(SyncError::RequestTimeout {
                request_id: request_id.to_string(),
                timeout: self.request_timeout,
            }),
        }
    }

    /// Add a pending request unless the connection already dropped.
    ///
    /// Holds the subscriptions lock so `on_disconnected` either sees the
    /// entry or has already cleared `ready`.
    fn register(&self, id: &str, request: PendingRequest) -> SyncResult<()> {
        let _subscriptions = self.subscriptions();
        if !*self.ready.borrow() {
            debug!("Not sending request {}: connection lost", id);
            return Err(SyncError::ConnectionLost);
        }
        self.pending.insert(id.to_string(), request);
        Ok(())
    }

    async fn request<F>(
        &self,
        kind: RequestKind,
        build: F,
        on_ack: Option<AckHook>,
    ) -> SyncResult<Response>
    where
        F: FnOnce(String) -> Message,
    {
        let id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.request_timeout;

        // Resubscription completes before any request goes out.
        self.wait_ready(deadline, &id).await?;

        let (request, rx) = PendingRequest::new(kind, deadline, on_ack);
        self.register(&id, request)?;
        let _pending = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        self.send(build(id.clone()))?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ConnectionLost),
            Err(_) => {
                warn!("{:?} request {} timed out", kind, id);
                Err(SyncError::RequestTimeout {
                    request_id: id.clone(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    fn unsubscribe(&self, id: u64, key: &DocKey) {
        let mut subscriptions = self.subscriptions();
        let Some(callbacks) = subscriptions.by_doc.get_mut(key) else {
            return;
        };
        callbacks.remove(&id);

        if callbacks.is_empty() {
            subscriptions.by_doc.remove(key);
            if *self.ready.borrow() {
                self.send_or_log(Message::Unsubscribe {
                    collection: key.collection.clone(),
                    document: key.document.clone(),
                });
            }
            debug!("Last subscription for {} removed", key);
        }
    }

    fn on_connected(&self) {
        let mut subscriptions = self.subscriptions();
        let reconnect = subscriptions.connected_once;
        subscriptions.connected_once = true;

        let mut keys: Vec<DocKey> = subscriptions.by_doc.keys().cloned().collect();
        keys.sort();
        for key in &keys {
            self.send_or_log(Message::Subscribe {
                collection: key.collection.clone(),
                document: key.document.clone(),
            });
        }
        self.ready.send_replace(true);
        drop(subscriptions);

        info!("Connected; issued {} subscriptions", keys.len());
        if reconnect {
            for key in keys {
                self.emit(ClientEvent::ResyncRequired(key));
            }
        }
        self.emit(ClientEvent::Ready);
    }

    fn on_disconnected(&self) {
        {
            let _subscriptions = self.subscriptions();
            self.ready.send_replace(false);
        }

        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let rejected = ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .map(|(_, request)| request.complete(Err(SyncError::ConnectionLost)))
            .count();

        warn!("Connection lost; rejected {} pending requests", rejected);
        self.emit(ClientEvent::Disconnected);
    }

    fn on_frame(&self, frame: &[u8]) {
        match self.codec.decode(frame) {
            Ok(envelope) => self.dispatch(envelope.message),
            Err(e @ SyncError::UnknownMessageType { .. }) => warn!("Ignoring frame: {}", e),
            Err(e) => error!("Failed to decode frame: {}", e),
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Op {
                collection,
                document,
                data,
            } => {
                let key = DocKey::new(collection, document);
                let callbacks: Vec<OpCallback> = self
                    .subscriptions()
                    .by_doc
                    .get(&key)
                    .map(|callbacks| callbacks.values().cloned().collect())
                    .unwrap_or_default();

                if callbacks.is_empty() {
                    let err = SyncError::UnknownDocument {
                        collection: key.collection,
                        document: key.document,
                    };
                    warn!("Dropping op: {}", err);
                    return;
                }

                let event = OpEvent {
                    key,
                    ops: data.op,
                    version: data.v,
                };
                for callback in callbacks {
                    callback(&event);
                }
            }
            Message::OpResponse { id, error } => {
                let result = match error {
                    Some(message) => Err(SyncError::ServerRejected { message }),
                    None => Ok(Response::Ack),
                };
                self.complete(&id, result);
            }
            Message::SnapshotResponse {
                id, data, error, ..
            } => {
                let result = match (error, data) {
                    (Some(message), _) => Err(SyncError::ServerRejected { message }),
                    (None, Some(payload)) => Ok(Response::Snapshot(payload.snapshot)),
                    (None, None) => Err(SyncError::protocol("snapshot response without snapshot")),
                };
                self.complete(&id, result);
            }
            Message::QueryResponse {
                id, data, error, ..
            } => {
                let result = match error {
                    Some(message) => Err(SyncError::ServerRejected { message }),
                    None => Ok(Response::Query(data.unwrap_or_default())),
                };
                self.complete(&id, result);
            }
            Message::Error {
                id: Some(id),
                error,
            } => self.complete(&id, Err(SyncError::ServerRejected { message: error })),
            Message::Error { id: None, error } => error!("Server error: {}", error),
            other => warn!("Unexpected {} message from server", other.type_name()),
        }
    }

    fn complete(&self, id: &str, result: SyncResult<Response>) {
        match self.pending.remove(id) {
            Some((_, request)) => {
                debug!(
                    "Completing {:?} request {} with {:?} to spare",
                    request.kind,
                    id,
                    request.deadline.saturating_duration_since(Instant::now())
                );
                if !request.complete(result) {
                    debug!("Caller for request {} stopped waiting", id);
                }
            }
            None => debug!("Ignoring response for unknown or expired request {}", id),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is normal before anyone listens.
        let _ = self.events.send(event);
    }
}

/// Removes a request from the pending map however `request` ends,
/// including when the caller drops the future
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(self.id).is_some() {
            debug!("Request {} abandoned before its response", self.id);
        }
    }
}

async fn read_loop(inner: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Connected => inner.on_connected(),
            TransportEvent::Disconnected => inner.on_disconnected(),
            TransportEvent::Error(message) => warn!("Transport error: {}", message),
            TransportEvent::Message(frame) => inner.on_frame(&frame),
        }
    }
    debug!("Protocol client read loop ended");
}
