use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;

use super::HistoryEntry;
use crate::{SyncError, SyncResult};

/// Serializable state of an [`OperationHistory`](super::OperationHistory)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub entries: Vec<HistoryEntry>,
    /// Number of applied entries
    pub cursor: usize,
}

/// Where history is kept between sessions
pub trait HistoryStore: Send + Sync {
    /// The saved history, or `None` if nothing was saved yet
    fn load(&self) -> impl Future<Output = SyncResult<Option<HistorySnapshot>>> + Send;

    fn save(&self, snapshot: &HistorySnapshot) -> impl Future<Output = SyncResult<()>> + Send;

    fn clear(&self) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Keeps history in memory, for tests and short-lived sessions
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    saved: Mutex<Option<HistorySnapshot>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> SyncResult<Option<HistorySnapshot>> {
        let saved = self
            .saved
            .lock()
            .map_err(|_| SyncError::Persistence("history store lock poisoned".to_string()))?;
        Ok(saved.clone())
    }

    async fn save(&self, snapshot: &HistorySnapshot) -> SyncResult<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| SyncError::Persistence("history store lock poisoned".to_string()))?;
        *saved = Some(snapshot.clone());
        Ok(())
    }

    async fn clear(&self) -> SyncResult<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| SyncError::Persistence("history store lock poisoned".to_string()))?;
        *saved = None;
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub use file::JsonFileHistoryStore;

#[cfg(feature = "persistence")]
mod file {
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};

    use super::{HistorySnapshot, HistoryStore};
    use crate::SyncResult;

    /// Stores history as pretty-printed JSON in a single file
    #[derive(Debug, Clone)]
    pub struct JsonFileHistoryStore {
        path: PathBuf,
    }

    impl JsonFileHistoryStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl HistoryStore for JsonFileHistoryStore {
        async fn load(&self) -> SyncResult<Option<HistorySnapshot>> {
            let json_data = match tokio::fs::read_to_string(&self.path).await {
                Ok(json_data) => json_data,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("No saved history at {:?}", self.path);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            let snapshot: HistorySnapshot = serde_json::from_str(&json_data)?;
            info!(
                "Loaded {} history entries from {:?}",
                snapshot.entries.len(),
                self.path
            );
            Ok(Some(snapshot))
        }

        async fn save(&self, snapshot: &HistorySnapshot) -> SyncResult<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }

            let json_data = serde_json::to_string_pretty(snapshot)?;
            tokio::fs::write(&self.path, json_data).await?;
            debug!("Saved history to {:?}", self.path);
            Ok(())
        }

        async fn clear(&self) -> SyncResult<()> {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}
