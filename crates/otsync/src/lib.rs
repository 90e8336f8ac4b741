//! # otsync - Operational-transform document sync
//!
//! Client-side engine for keeping records, fields, views and tables in sync
//! with a sharing server over a single multiplexed WebSocket.
//!
//! Local edits are sent as JSON operations and applied to the cached document
//! once the server confirms them. Remote operations are rebased over any edits
//! still in flight. On top of that sit table presence (cursors, active cells,
//! selections) and a bounded undo/redo history of acknowledged operations.

pub mod client;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod history;
pub mod presence;
pub mod protocol;
pub mod transform;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientEvent, OpEvent, ProtocolClient, Subscription};
pub use config::{EngineConfig, ReconnectPolicy, WireFormat};
pub use document::{
    DocumentHandle, DocumentRegistry, DocumentSubscription, DocumentUpdate, EntityAccessor,
    EntityKind, SubmitOutcome,
};
pub use engine::SyncEngine;
pub use error::{ApplyError, SyncError, SyncResult};
pub use history::{
    HistoryEntry, HistoryPlayer, HistoryStore, MemoryHistoryStore, OperationHistory,
    PlayerControl, SharedHistory,
};
pub use presence::{PresenceEntry, PresenceTracker};
pub use protocol::{Codec, DocKey, Envelope, Message, Operation, Path, PathSegment, Snapshot};
pub use transform::{merge_operations, transform, ConflictResolver, Transformed};
pub use transport::{ConnectionState, MemoryTransport, Transport, TransportEvent, WsTransport};

#[cfg(feature = "persistence")]
pub use history::JsonFileHistoryStore;
