// src/storage/checkpoint.rs

//! Durable checkpoint persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::Checkpoint;

/// Load/save of the single progress record.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Most recently saved checkpoint, if any.
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Replace the stored checkpoint. The previous one stays readable until
    /// the new one is fully written.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// JSON checkpoint file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Io(e)),
        };
        let checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::storage(format!(
                "checkpoint {} is unreadable: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        log::debug!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }
}
