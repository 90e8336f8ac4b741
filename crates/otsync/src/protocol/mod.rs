use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::config::WireFormat;
use crate::{SyncError, SyncResult};

pub mod operation;

pub use operation::{Operation, Path, PathSegment};

/// Identifies one collaborative document on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: String,
    pub document: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: document.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.document)
    }
}

/// Payload of `submit` and `op` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpPayload {
    pub op: Vec<Operation>,
    /// Version the operations apply on top of, when the server reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
}

/// Point-in-time read of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(alias = "v")]
    pub version: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub query: JsonValue,
    #[serde(default)]
    pub options: JsonValue,
}

/// Result of a `query` request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResults {
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub extra: JsonValue,
}

/// Every message type the protocol speaks, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Subscribe {
        collection: String,
        document: String,
    },
    Unsubscribe {
        collection: String,
        document: String,
    },
    Submit {
        id: String,
        collection: String,
        document: String,
        data: OpPayload,
    },
    Op {
        collection: String,
        document: String,
        data: OpPayload,
    },
    OpResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetSnapshot {
        id: String,
        collection: String,
        document: String,
    },
    SnapshotResponse {
        id: String,
        collection: String,
        document: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<SnapshotPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Query {
        id: String,
        collection: String,
        data: QueryPayload,
    },
    QueryResponse {
        id: String,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<QueryResults>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
    },
}

const MESSAGE_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "submit",
    "op",
    "op-response",
    "get-snapshot",
    "snapshot-response",
    "query",
    "query-response",
    "error",
];

impl Message {
    /// The request id this message correlates to, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::Submit { id, .. }
            | Message::OpResponse { id, .. }
            | Message::GetSnapshot { id, .. }
            | Message::SnapshotResponse { id, .. }
            | Message::Query { id, .. }
            | Message::QueryResponse { id, .. } => Some(id),
            Message::Error { id, .. } => id.as_deref(),
            Message::Subscribe { .. } | Message::Unsubscribe { .. } | Message::Op { .. } => None,
        }
    }

    /// The wire name of this message's `type`
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Submit { .. } => "submit",
            Message::Op { .. } => "op",
            Message::OpResponse { .. } => "op-response",
            Message::GetSnapshot { .. } => "get-snapshot",
            Message::SnapshotResponse { .. } => "snapshot-response",
            Message::Query { .. } => "query",
            Message::QueryResponse { .. } => "query-response",
            Message::Error { .. } => "error",
        }
    }
}

/// One framed protocol message: the tagged body plus its timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    /// RFC 3339 send time
    pub timestamp: String,
}

impl Envelope {
    /// Wrap a message, stamping it with the current UTC time
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Envelope::new(message)
    }
}

/// Turns envelopes into socket frames and back
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: WireFormat,
}

impl Codec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode an envelope into a frame payload
    pub fn encode(&self, envelope: &Envelope) -> SyncResult<Vec<u8>> {
        let json = serde_json::to_string(envelope)?;
        match self.format {
            WireFormat::Json => Ok(json.into_bytes()),
            WireFormat::Lib0 => {
                let mut encoder = Vec::new();
                lib0::encoding::Write::write_string(&mut encoder, &json);
                Ok(encoder)
            }
        }
    }

    /// Decode a frame payload.
    ///
    /// A well-formed message with a `type` this protocol does not know is
    /// reported as [`SyncError::UnknownMessageType`].
    pub fn decode(&self, data: &[u8]) -> SyncResult<Envelope> {
        let value: JsonValue = match self.format {
            WireFormat::Json => serde_json::from_slice(data)?,
            WireFormat::Lib0 => {
                let mut decoder = lib0::decoding::Cursor::new(data);
                let json = lib0::decoding::Read::read_string(&mut decoder).map_err(|e| {
                    SyncError::protocol(format!("Failed to decode lib0 string: {}", e))
                })?;
                serde_json::from_str(json)?
            }
        };

        let message_type = value
            .get("type")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SyncError::protocol("message has no type"))?;
        if !MESSAGE_TYPES.contains(&message_type) {
            return Err(SyncError::UnknownMessageType {
                message_type: message_type.to_string(),
            });
        }

        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::operation::path;
    use super::*;
    use serde_json::json;

    fn submit() -> Envelope {
        Envelope::new(Message::Submit {
            id: "req-1".to_string(),
            collection: "rec_tbl1".to_string(),
            document: "r1".to_string(),
            data: OpPayload {
                op: vec![Operation::replace(
                    path(["fields", "status"]),
                    json!("done"),
                    json!("todo"),
                )],
                v: None,
            },
        })
    }

    #[test]
    fn test_envelope_is_flat_json() {
        let bytes = Codec::default().encode(&submit()).unwrap();
        let value: JsonValue = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "submit");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["collection"], "rec_tbl1");
        assert_eq!(value["document"], "r1");
        assert_eq!(value["data"]["op"][0]["type"], "replace");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_decode_server_messages() {
        let codec = Codec::default();
        let raw = json!({
            "type": "snapshot-response",
            "id": "req-2",
            "collection": "rec_tbl1",
            "document": "r1",
            "data": {"snapshot": {"id": "r1", "v": 4, "type": "json0", "data": {"fields": {}}}},
            "timestamp": "2024-01-01T00:00:00.000Z"
        });
        let envelope = codec.decode(raw.to_string().as_bytes()).unwrap();

        match envelope.message {
            Message::SnapshotResponse { id, data, error, .. } => {
                assert_eq!(id, "req-2");
                assert!(error.is_none());
                let snapshot = data.unwrap().snapshot;
                assert_eq!(snapshot.version, 4);
                assert_eq!(snapshot.doc_type.as_deref(), Some("json0"));
            }
            other => panic!("Expected snapshot response, got {:?}", other),
        }

        let raw = json!({"type": "op-response", "id": "req-3", "error": "denied", "timestamp": "t"});
        let envelope = codec.decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.message.request_id(), Some("req-3"));
        assert_eq!(envelope.message.type_name(), "op-response");
    }

    #[test]
    fn test_unknown_type_is_distinct() {
        let raw = json!({"type": "presence-ping", "timestamp": "t"});
        let err = Codec::default().decode(raw.to_string().as_bytes()).unwrap_err();
        assert!(
            matches!(err, SyncError::UnknownMessageType { ref message_type } if message_type == "presence-ping")
        );

        let err = Codec::default().decode(b"{\"id\": 1}").unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));

        let err = Codec::default().decode(b"not json").unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[test]
    fn test_timestamp_is_required() {
        let raw = json!({"type": "subscribe", "collection": "c", "document": "d"});
        assert!(Codec::default().decode(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_lib0_framing() {
        let codec = Codec::new(WireFormat::Lib0);
        let envelope = submit();
        let bytes = codec.encode(&envelope).unwrap();

        // var-string length prefix, not a bare JSON object
        assert_ne!(bytes.first(), Some(&b'{'));
        assert_eq!(codec.decode(&bytes).unwrap(), envelope);
        assert!(Codec::default().decode(&bytes).is_err());
    }
}
