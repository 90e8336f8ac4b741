use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientEvent, ProtocolClient};
use crate::config::EngineConfig;
use crate::document::{DocumentRegistry, EntityAccessor};
use crate::history::{HistoryStore, OperationHistory, SharedHistory};
use crate::presence::{PresenceTiming, PresenceTracker};
use crate::protocol::{Codec, DocKey};
use crate::transport::{ConnectionState, Transport, WsTransport};
use crate::{SyncError, SyncResult};

/// One connection to a sync server and everything layered on it
///
/// Owns the transport, the protocol client, the document registry and the
/// shared operation history. Create one per connection and hand out
/// references.
pub struct SyncEngine {
    config: EngineConfig,
    user_id: String,
    transport: Arc<dyn Transport>,
    client: ProtocolClient,
    registry: Arc<DocumentRegistry>,
    history: SharedHistory,
    resync_task: JoinHandle<()>,
}

impl SyncEngine {
    /// Connect to `config.url` over WebSocket.
    ///
    /// Returns immediately; use [`SyncEngine::wait_ready`] to wait for the
    /// connection. Must be called inside a Tokio runtime.
    pub fn connect(config: EngineConfig) -> SyncResult<Self> {
        if config.url.is_empty() {
            return Err(SyncError::invalid_state("no server url configured"));
        }
        let transport = Arc::new(WsTransport::new(
            config.reconnect.clone(),
            config.wire_format,
        ));
        Self::with_transport(config, transport)
    }

    /// Build the engine over any transport and connect it to `config.url`
    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        let client = ProtocolClient::new(
            transport.clone(),
            Codec::new(config.wire_format),
            config.request_timeout(),
        )?;

        let user_id = config
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let history = OperationHistory::shared(config.history_max_size);
        let registry = Arc::new(
            DocumentRegistry::new(client.clone())
                .with_history(history.clone(), Some(user_id.clone())),
        );

        let resync_task = tokio::spawn(resync_on_reconnect(
            Arc::downgrade(&registry),
            client.events(),
        ));

        transport.connect(&config.url);
        info!("Sync engine for {} started as {}", config.url, user_id);

        Ok(Self {
            config,
            user_id,
            transport,
            client,
            registry,
            history,
            resync_task,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn history(&self) -> SharedHistory {
        self.history.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Wait until connected and resubscribed
    pub async fn wait_ready(&self, timeout: Duration) -> SyncResult<()> {
        self.client.wait_ready(timeout).await
    }

    pub fn records(&self, table_id: &str) -> EntityAccessor<'_> {
        self.registry.records(table_id)
    }

    pub fn fields(&self, table_id: &str) -> EntityAccessor<'_> {
        self.registry.fields(table_id)
    }

    pub fn views(&self, table_id: &str) -> EntityAccessor<'_> {
        self.registry.views(table_id)
    }

    pub fn tables(&self, base_id: &str) -> EntityAccessor<'_> {
        self.registry.tables(base_id)
    }

    /// Presence tracker for a table or one of its views; call `initialize` to start it
    pub fn presence(&self, table_id: &str, view_id: Option<&str>) -> PresenceTracker {
        PresenceTracker::new(
            self.client.clone(),
            table_id,
            view_id,
            self.user_id.clone(),
            PresenceTiming {
                heartbeat: self.config.presence_heartbeat(),
                stale_after: self.config.presence_stale_after(),
            },
        )
    }

    /// Save the shared history to `store`
    pub async fn persist_history<S: HistoryStore>(&self, store: &S) -> SyncResult<()> {
        let snapshot = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        store.save(&snapshot).await
    }

    /// Replace the shared history with what `store` holds. Returns false if it was empty.
    pub async fn restore_history<S: HistoryStore>(&self, store: &S) -> SyncResult<bool> {
        let Some(snapshot) = store.load().await? else {
            return Ok(false);
        };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load(snapshot);
        Ok(true)
    }

    /// Disconnect the transport and stop background work
    pub fn shutdown(&self) {
        self.resync_task.abort();
        self.transport.disconnect();
        info!("Sync engine for {} shut down", self.config.url);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.resync_task.abort();
    }
}

/// Reload every document the client flags after a reconnect
async fn resync_on_reconnect(
    registry: Weak<DocumentRegistry>,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        let keys: Vec<DocKey> = match events.recv().await {
            Ok(ClientEvent::ResyncRequired(key)) => vec![key],
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} client events; resyncing everything", skipped);
                match registry.upgrade() {
                    Some(registry) => registry.list_documents(),
                    None => break,
                }
            }
            Err(RecvError::Closed) => break,
        };

        let Some(registry) = registry.upgrade() else {
            break;
        };
        for key in keys {
            match registry.resync(&key).await {
                Ok(true) => debug!("Resync of {} complete", key),
                Ok(false) => {}
                Err(e) => warn!("Resync of {} failed: {}", key, e),
            }
        }
    }
    debug!("Resync task ended");
}
