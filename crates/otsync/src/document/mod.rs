pub mod accessor;
pub mod doc;
pub mod store;

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::Operation;

pub use accessor::EntityAccessor;
pub use doc::{Document, DocumentHandle, DocumentSubscription};
pub use store::DocumentRegistry;

/// Kinds of entity that live in their own collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Record,
    Field,
    View,
    Table,
}

impl EntityKind {
    const ALL: [EntityKind; 4] = [
        EntityKind::Record,
        EntityKind::Field,
        EntityKind::View,
        EntityKind::Table,
    ];

    fn prefix(self) -> &'static str {
        match self {
            EntityKind::Record => "rec",
            EntityKind::Field => "fld",
            EntityKind::View => "viw",
            EntityKind::Table => "tbl",
        }
    }

    /// Collection holding this kind of entity for a table (or a base, for tables)
    pub fn collection(self, scope_id: &str) -> String {
        format!("{}_{}", self.prefix(), scope_id)
    }

    /// Recover the kind from a collection name like `rec_tbl123`
    pub fn from_collection(collection: &str) -> Option<Self> {
        let (prefix, scope) = collection.split_once('_')?;
        if scope.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Top-level key under which an entity keeps its editable values
    pub fn property_root(self) -> &'static str {
        match self {
            EntityKind::Record => "fields",
            EntityKind::Field | EntityKind::View | EntityKind::Table => "options",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Record => "record",
            EntityKind::Field => "field",
            EntityKind::View => "view",
            EntityKind::Table => "table",
        };
        f.write_str(name)
    }
}

/// Change notification sent to document subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpdate {
    pub collection: String,
    pub id: String,
    pub version: u64,
    /// Dotted path to new value; removals are `null`
    pub changes: BTreeMap<String, JsonValue>,
    /// Set when the whole document was reloaded after a reconnect
    pub resynced: bool,
}

/// Result of submitting local operations
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The server accepted the operations, as rebased over concurrent edits
    Acknowledged { operations: Vec<Operation> },
    /// Concurrent remote edits cancelled every operation
    NoOp,
}

impl SubmitOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, SubmitOutcome::NoOp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_round_trip() {
        assert_eq!(EntityKind::Record.collection("t1"), "rec_t1");
        assert_eq!(EntityKind::Field.collection("t1"), "fld_t1");
        assert_eq!(EntityKind::View.collection("t1"), "viw_t1");
        assert_eq!(EntityKind::Table.collection("b1"), "tbl_b1");

        assert_eq!(EntityKind::from_collection("viw_t1"), Some(EntityKind::View));
        assert_eq!(EntityKind::from_collection("presence_t1"), None);
        assert_eq!(EntityKind::from_collection("rec_"), None);
        assert_eq!(EntityKind::from_collection("rec"), None);
    }

    #[test]
    fn test_property_roots() {
        assert_eq!(EntityKind::Record.property_root(), "fields");
        assert_eq!(EntityKind::View.property_root(), "options");
    }
}
