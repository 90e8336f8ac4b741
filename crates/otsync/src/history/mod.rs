//! Local undo/redo log of acknowledged operations.
//!
//! The log is bounded; pushing past `max_size` evicts the oldest entries. A
//! cursor marks how many entries are currently applied. Undo and redo move
//! the cursor and hand back the entry, but never submit anything themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::Operation;
use crate::SyncResult;

mod player;
mod store;

pub use player::{HistoryPlayer, PlayState, PlayerControl};
#[cfg(feature = "persistence")]
pub use store::JsonFileHistoryStore;
pub use store::{HistorySnapshot, HistoryStore, MemoryHistoryStore};

/// History shared between the registry (which appends) and the application
pub type SharedHistory = Arc<Mutex<OperationHistory>>;

pub const DEFAULT_MAX_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
}

impl HistoryEntry {
    pub fn new(operation: Operation, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            timestamp: Utc::now(),
            user_id: None,
            description: description.into(),
            record_id: None,
            field_id: None,
        }
    }

    /// The operation that reverts this entry
    pub fn inverse(&self) -> Operation {
        self.operation.inverse()
    }
}

#[derive(Debug, Clone)]
pub struct OperationHistory {
    entries: VecDeque<HistoryEntry>,
    max_size: usize,
    /// Number of entries currently applied
    cursor: usize,
}

impl OperationHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
            cursor: 0,
        }
    }

    pub fn shared(max_size: usize) -> SharedHistory {
        Arc::new(Mutex::new(Self::new(max_size)))
    }

    /// Append an entry, discarding anything that was undone
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.cursor < self.entries.len() {
            debug!(
                "Discarding {} redo entries",
                self.entries.len() - self.cursor
            );
            self.entries.truncate(self.cursor);
        }

        self.entries.push_back(entry);
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len();
    }

    /// Step back one entry, returning the entry to revert
    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Step forward one entry, returning the entry to reapply
    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry)
    }

    /// Move the cursor so that `index` is the last applied entry.
    ///
    /// Returns that entry, or `None` (leaving the cursor alone) if out of range.
    pub fn jump_to(&mut self, index: usize) -> Option<&HistoryEntry> {
        let entry = self.entries.get(index)?;
        self.cursor = index + 1;
        Some(entry)
    }

    /// Move the cursor before the first entry
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Index of the last applied entry
    pub fn current_index(&self) -> Option<usize> {
        self.cursor.checked_sub(1)
    }

    pub fn entries(&self) -> &VecDeque<HistoryEntry> {
        &self.entries
    }

    /// Entries from `start` (inclusive) to `end` (exclusive), clamped to the log
    pub fn slice(&self, start: usize, end: usize) -> Vec<HistoryEntry> {
        let end = end.min(self.entries.len());
        self.entries
            .range(start.min(end)..end)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            entries: self.entries.iter().cloned().collect(),
            cursor: self.cursor,
        }
    }

    /// Replace the log with a snapshot, keeping the newest `max_size` entries
    pub fn load(&mut self, snapshot: HistorySnapshot) {
        let HistorySnapshot {
            entries,
            mut cursor,
        } = snapshot;
        let overflow = entries.len().saturating_sub(self.max_size);

        self.entries = entries.into_iter().skip(overflow).collect();
        cursor = cursor.saturating_sub(overflow);
        self.cursor = cursor.min(self.entries.len());
    }

    /// Save the log to `store`
    pub async fn persist<S: HistoryStore>(&self, store: &S) -> SyncResult<()> {
        let snapshot = self.snapshot();
        store.save(&snapshot).await?;
        debug!("Persisted {} history entries", snapshot.entries.len());
        Ok(())
    }

    /// Load the log from `store`. Returns false if the store was empty.
    pub async fn restore<S: HistoryStore>(&mut self, store: &S) -> SyncResult<bool> {
        match store.load().await? {
            Some(snapshot) => {
                self.load(snapshot);
                info!("Restored {} history entries", self.entries.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for OperationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::operation::path;
    use serde_json::json;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry::new(
            Operation::replace(path(["fields", "n"]), json!(n), json!(n - 1)),
            format!("Set n to {}", n),
        )
    }

    fn history_with(max_size: usize, count: usize) -> OperationHistory {
        let mut history = OperationHistory::new(max_size);
        for n in 1..=count {
            history.push(entry(n));
        }
        history
    }

    fn descriptions(history: &OperationHistory) -> Vec<String> {
        history
            .entries()
            .iter()
            .map(|entry| entry.description.clone())
            .collect()
    }

    #[test]
    fn test_push_past_bound_evicts_oldest() {
        let history = history_with(3, 4);
        assert_eq!(history.len(), 3);
        assert_eq!(
            descriptions(&history),
            vec!["Set n to 2", "Set n to 3", "Set n to 4"]
        );
        assert_eq!(history.current_index(), Some(2));
    }

    #[test]
    fn test_undo_redo_moves_cursor() {
        let mut history = history_with(10, 3);
        assert!(!history.can_redo());

        assert_eq!(history.undo().unwrap().description, "Set n to 3");
        assert_eq!(history.undo().unwrap().description, "Set n to 2");
        assert_eq!(history.current_index(), Some(0));
        assert!(history.can_redo());

        assert_eq!(history.redo().unwrap().description, "Set n to 2");
        assert_eq!(history.len(), 3);

        history.rewind();
        assert!(!history.can_undo());
        assert!(history.undo().is_none());
        assert_eq!(history.current_index(), None);
    }

    #[test]
    fn test_push_after_undo_truncates_redo() {
        let mut history = history_with(10, 3);
        history.undo();
        history.undo();

        history.push(entry(9));
        assert_eq!(descriptions(&history), vec!["Set n to 1", "Set n to 9"]);
        assert!(!history.can_redo());
        assert!(history.redo().is_none());
    }

    #[test]
    fn test_jump_to() {
        let mut history = history_with(10, 5);
        assert_eq!(history.jump_to(1).unwrap().description, "Set n to 2");
        assert_eq!(history.current_index(), Some(1));
        assert!(history.jump_to(5).is_none());
        assert_eq!(history.current_index(), Some(1));
    }

    #[test]
    fn test_inverse_swaps_values() {
        let entry = entry(2);
        assert_eq!(
            entry.inverse(),
            Operation::replace(path(["fields", "n"]), json!(1), json!(2))
        );
    }

    #[test]
    fn test_load_keeps_newest_entries() {
        let source = history_with(10, 6);
        let mut target = OperationHistory::new(4);
        target.load(source.snapshot());

        assert_eq!(target.len(), 4);
        assert_eq!(target.entries()[0].description, "Set n to 3");
        assert_eq!(target.current_index(), Some(3));
    }

    #[test]
    fn test_slice_is_clamped() {
        let history = history_with(10, 3);
        assert_eq!(history.slice(1, 10).len(), 2);
        assert!(history.slice(5, 10).is_empty());
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let mut entry = entry(1);
        entry.record_id = Some("r1".to_string());
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["recordId"], json!("r1"));
        assert!(value.get("userId").is_none());
        assert_eq!(value["operation"]["type"], json!("replace"));
    }
}
