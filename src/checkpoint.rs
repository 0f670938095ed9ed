//! Checkpoint persistence and recovery
//!
//! A checkpoint records, per partition, the last batch whose effects fully
//! reached every sink, together with the watermark and source offset at that
//! point. It is always written after fan-out succeeds, so a crash between
//! fan-out and commit replays the batch, and idempotent sinks absorb the
//! replay.
//!
//! The file store writes atomically: serialize to a temp file in the same
//! directory, then rename over the live checkpoint. A crash mid-write leaves
//! the previous checkpoint intact.

use crate::error::{CheckpointError, CheckpointResult};
use crate::watermark::Watermark;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable per-partition progress marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: u32,
    /// Highest batch id whose effects reached all sinks
    pub last_committed_batch_id: u64,
    /// Watermark at commit time
    pub watermark: Watermark,
    /// Source offset to resume polling from
    pub source_offset: i64,
    /// When this checkpoint was written
    pub committed_at: DateTime<Utc>,
    /// Checkpoint format version
    pub version: u32,
}

impl Checkpoint {
    pub fn new(
        partition_id: u32,
        last_committed_batch_id: u64,
        watermark: Watermark,
        source_offset: i64,
    ) -> Self {
        Self {
            partition_id,
            last_committed_batch_id,
            watermark,
            source_offset,
            committed_at: Utc::now(),
            version: 1,
        }
    }
}

/// Storage backend for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a checkpoint, replacing any previous one for the partition
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Loads the latest checkpoint for a partition, None if none exists
    async fn load(&self, partition_id: u32) -> CheckpointResult<Option<Checkpoint>>;
}

/// File-backed checkpoint store with atomic replacement
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, partition_id: u32) -> PathBuf {
        self.dir.join(format!("partition-{partition_id}.ckpt"))
    }

    fn tmp_path_for(&self, partition_id: u32) -> PathBuf {
        self.dir.join(format!("partition-{partition_id}.ckpt.tmp"))
    }

    async fn ensure_dir(&self, partition_id: u32) -> CheckpointResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::PersistFailed {
                partition_id,
                reason: format!("failed to create checkpoint directory: {e}"),
            })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let partition_id = checkpoint.partition_id;
        self.ensure_dir(partition_id).await?;

        let serialized =
            bincode::serialize(checkpoint).map_err(|e| CheckpointError::PersistFailed {
                partition_id,
                reason: format!("serialization failed: {e}"),
            })?;

        let tmp = self.tmp_path_for(partition_id);
        let live = self.path_for(partition_id);

        tokio::fs::write(&tmp, &serialized)
            .await
            .map_err(|e| CheckpointError::PersistFailed {
                partition_id,
                reason: format!("failed to write {}: {e}", tmp.display()),
            })?;

        // Rename within the same directory is atomic on POSIX filesystems
        tokio::fs::rename(&tmp, &live)
            .await
            .map_err(|e| CheckpointError::PersistFailed {
                partition_id,
                reason: format!("failed to rename into place: {e}"),
            })?;

        debug!(
            partition_id,
            batch_id = checkpoint.last_committed_batch_id,
            watermark = %checkpoint.watermark,
            path = %live.display(),
            "persisted checkpoint"
        );
        Ok(())
    }

    async fn load(&self, partition_id: u32) -> CheckpointResult<Option<Checkpoint>> {
        let path = self.path_for(partition_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::LoadFailed {
                    partition_id,
                    reason: format!("failed to read {}: {e}", path.display()),
                })
            }
        };

        let checkpoint: Checkpoint =
            bincode::deserialize(&data).map_err(|e| CheckpointError::Corrupt {
                partition_id,
                reason: e.to_string(),
            })?;

        if checkpoint.partition_id != partition_id {
            return Err(CheckpointError::Corrupt {
                partition_id,
                reason: format!(
                    "checkpoint file carries partition {}",
                    checkpoint.partition_id
                ),
            });
        }

        info!(
            partition_id,
            batch_id = checkpoint.last_committed_batch_id,
            watermark = %checkpoint.watermark,
            "loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }
}

/// In-memory checkpoint store for tests and single-process runs
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<u32, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.checkpoints
            .lock()
            .await
            .insert(checkpoint.partition_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, partition_id: u32) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().await.get(&partition_id).cloned())
    }
}

/// Lists checkpoint files present in a directory, for operational tooling
pub async fn list_checkpoint_partitions(dir: impl AsRef<Path>) -> CheckpointResult<Vec<u32>> {
    let dir = dir.as_ref();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CheckpointError::LoadFailed {
                partition_id: 0,
                reason: format!("failed to read {}: {e}", dir.display()),
            })
        }
    };

    let mut partitions = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return Err(CheckpointError::LoadFailed {
                    partition_id: 0,
                    reason: e.to_string(),
                })
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name
            .strip_prefix("partition-")
            .and_then(|rest| rest.strip_suffix(".ckpt"))
        {
            if let Ok(id) = stem.parse::<u32>() {
                partitions.push(id);
            }
        }
    }
    partitions.sort_unstable();
    Ok(partitions)
}
