//! Checkpoint sinks for whole-activity snapshots.

use std::path::PathBuf;

use async_trait::async_trait;
use conveyor_protocols::{ActivityCheckpoint, CheckpointSink, OwnerRef, ProtocolError};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// In-memory checkpoint sink.
#[derive(Default)]
pub struct MemoryCheckpointSink {
    checkpoints: RwLock<Vec<ActivityCheckpoint>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoints saved for an activity, oldest first.
    pub async fn checkpoints(&self, activity_id: &str) -> Vec<ActivityCheckpoint> {
        self.checkpoints
            .read()
            .await
            .iter()
            .filter(|c| c.activity_id == activity_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn save_checkpoint(&self, checkpoint: ActivityCheckpoint) -> Result<(), ProtocolError> {
        self.checkpoints.write().await.push(checkpoint);
        Ok(())
    }
}

/// File-based checkpoint sink.
///
/// Layout: `{root}/{run}/{activity}/{created_at_ms}_{id}.json`, so a
/// directory listing sorts oldest first.
pub struct FileCheckpointSink {
    root: PathBuf,
}

impl FileCheckpointSink {
    /// Create a sink rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ProtocolError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| ProtocolError::Storage(format!("{}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn activity_dir(&self, owner: &OwnerRef, activity_id: &str) -> PathBuf {
        let run = owner.run_id.as_deref().unwrap_or("unowned");
        self.root
            .join(sanitize_segment(run))
            .join(sanitize_segment(activity_id))
    }

    /// Checkpoints saved for an activity, oldest first. Unreadable files
    /// are skipped.
    pub async fn list(
        &self,
        owner: &OwnerRef,
        activity_id: &str,
    ) -> Result<Vec<ActivityCheckpoint>, ProtocolError> {
        let dir = self.activity_dir(owner, activity_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut checkpoints = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<ActivityCheckpoint>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(checkpoints)
    }

    /// Most recent checkpoint for an activity.
    pub async fn latest(
        &self,
        owner: &OwnerRef,
        activity_id: &str,
    ) -> Result<Option<ActivityCheckpoint>, ProtocolError> {
        Ok(self.list(owner, activity_id).await?.pop())
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn save_checkpoint(&self, checkpoint: ActivityCheckpoint) -> Result<(), ProtocolError> {
        let dir = self.activity_dir(&checkpoint.owner, &checkpoint.activity_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;

        let file_name = format!(
            "{:013}_{}.json",
            checkpoint.created_at.timestamp_millis().max(0),
            checkpoint.id
        );
        let path = dir.join(file_name);
        let content = serde_json::to_string_pretty(&checkpoint)?;
        fs::write(&path, content)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;

        debug!(
            "Saved checkpoint {} for activity '{}'",
            checkpoint.id, checkpoint.activity_id
        );
        Ok(())
    }
}

/// Keep alphanumerics, `-` and `_`; replace everything else.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn checkpoint(owner: &OwnerRef, activity_id: &str, offset_secs: i64) -> ActivityCheckpoint {
        ActivityCheckpoint::new(
            owner.clone(),
            activity_id,
            serde_json::json!({"chunk_index": offset_secs}),
            Utc::now() + Duration::seconds(offset_secs),
            "test",
        )
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("run-1_ok"), "run-1_ok");
        assert_eq!(sanitize_segment("../etc/passwd"), "___etc_passwd");
    }

    #[tokio::test]
    async fn test_file_sink_lists_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileCheckpointSink::new(temp_dir.path()).await.unwrap();
        let owner = OwnerRef::run("run/1");

        let second = checkpoint(&owner, "index", 10);
        let first = checkpoint(&owner, "index", 0);
        sink.save_checkpoint(second.clone()).await.unwrap();
        sink.save_checkpoint(first.clone()).await.unwrap();
        sink.save_checkpoint(checkpoint(&owner, "other", 5))
            .await
            .unwrap();

        let listed = sink.list(&owner, "index").await.unwrap();
        assert_eq!(listed, vec![first, second.clone()]);
        assert_eq!(sink.latest(&owner, "index").await.unwrap(), Some(second));
        assert!(temp_dir.path().join("run_1").join("index").is_dir());
    }

    #[tokio::test]
    async fn test_file_sink_skips_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileCheckpointSink::new(temp_dir.path()).await.unwrap();
        let owner = OwnerRef::default();
        let good = checkpoint(&owner, "scan", 0);
        sink.save_checkpoint(good.clone()).await.unwrap();

        let dir = temp_dir.path().join("unowned").join("scan");
        std::fs::write(dir.join("9999999999999_bad.json"), "{not json").unwrap();

        assert_eq!(sink.list(&owner, "scan").await.unwrap(), vec![good]);
        assert!(sink.list(&owner, "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_activity() {
        let sink = MemoryCheckpointSink::new();
        let owner = OwnerRef::run("r");
        sink.save_checkpoint(checkpoint(&owner, "a", 0)).await.unwrap();
        sink.save_checkpoint(checkpoint(&owner, "b", 0)).await.unwrap();
        assert_eq!(sink.checkpoints("a").await.len(), 1);
    }
}
