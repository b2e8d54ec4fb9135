//! Dead-letter persistence.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_protocols::WorkItem;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;

/// A work item that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The failed item, with its final retry count.
    pub item: WorkItem,
    /// Error from the last attempt.
    pub last_error: String,
    /// When the item was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(item: WorkItem, last_error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            item,
            last_error: last_error.into(),
            dead_lettered_at: at,
        }
    }

    /// Entry ID (the item ID).
    pub fn id(&self) -> Uuid {
        self.item.id
    }
}

/// Dead-letter store trait.
///
/// Entries are retained until replayed or purged.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Save an entry.
    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError>;

    /// Load an entry by ID.
    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError>;

    /// All entries, oldest first.
    async fn list(&self) -> Result<Vec<DeadLetterEntry>, DispatchError>;

    /// Remove and return an entry.
    async fn remove(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError>;

    /// Remove every entry. Returns how many were removed.
    async fn purge(&self) -> Result<usize, DispatchError>;
}

/// In-memory dead-letter store.
pub struct MemoryDeadLetterStore {
    entries: tokio::sync::RwLock<HashMap<Uuid, DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryDeadLetterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.entries.write().await.insert(entry.id(), entry.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    async fn remove(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        Ok(self.entries.write().await.remove(id))
    }

    async fn purge(&self) -> Result<usize, DispatchError> {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}

/// File system based dead-letter store.
///
/// One JSON file per entry:
/// ```text
/// {storage_path}/
/// └── {item_uuid}.json
/// ```
pub struct FileDeadLetterStore {
    storage_path: PathBuf,
}

impl FileDeadLetterStore {
    /// Create the store, creating `storage_path` if needed.
    pub async fn new(storage_path: impl Into<PathBuf>) -> Result<Self, DispatchError> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to create dead-letter directory: {}", e))
        })?;

        debug!("FileDeadLetterStore initialized at {:?}", storage_path);
        Ok(Self { storage_path })
    }

    fn entry_path(&self, id: &Uuid) -> PathBuf {
        self.storage_path.join(format!("{}.json", id))
    }

    async fn read_entry(path: &std::path::Path) -> Result<DeadLetterEntry, DispatchError> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to read dead-letter file: {}", e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DispatchError::Storage(format!("Failed to deserialize dead-letter entry: {}", e))
        })
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn save(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        let path = self.entry_path(&entry.id());
        let content = serde_json::to_string_pretty(entry).map_err(|e| {
            DispatchError::Storage(format!("Failed to serialize dead-letter entry: {}", e))
        })?;

        // Write-then-rename so a crash never leaves a torn entry.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to write dead-letter file: {}", e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to commit dead-letter file: {}", e))
        })?;

        debug!("Saved dead-letter entry '{}' to {:?}", entry.id(), path);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        let path = self.entry_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_entry(&path).await.map(Some)
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.storage_path).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to read dead-letter directory: {}", e))
        })?;

        while let Some(file) = dir.next_entry().await.map_err(|e| {
            DispatchError::Storage(format!("Failed to read directory entry: {}", e))
        })? {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::read_entry(&path).await {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Skipping unreadable dead-letter file {:?}: {}", path, e),
                }
            }
        }

        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    async fn remove(&self, id: &Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        let Some(entry) = self.get(id).await? else {
            return Ok(None);
        };
        fs::remove_file(self.entry_path(id)).await.map_err(|e| {
            DispatchError::Storage(format!("Failed to delete dead-letter file: {}", e))
        })?;
        debug!("Removed dead-letter entry '{}'", id);
        Ok(Some(entry))
    }

    async fn purge(&self) -> Result<usize, DispatchError> {
        let entries = self.list().await?;
        for entry in &entries {
            fs::remove_file(self.entry_path(&entry.id())).await.map_err(|e| {
                DispatchError::Storage(format!("Failed to delete dead-letter file: {}", e))
            })?;
        }
        Ok(entries.len())
    }
}
