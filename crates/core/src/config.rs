//! Persisted checkpoint-level metadata
//!
//! Each checkpoint directory carries a `metadata.json` recording which
//! backend and format version wrote the sharded and common parts. Load
//! strategies consult it for compatibility checks before trusting a
//! checkpoint. Writing it is the commit point of a save.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};

/// File name of the checkpoint-level metadata within a checkpoint directory
pub const CHECKPOINT_METADATA_FILE: &str = "metadata.json";

/// Backend and format-version information persisted with every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointingConfig {
    /// Backend that wrote the sharded part
    pub sharded_backend: String,

    /// Format version of the sharded part
    pub sharded_backend_version: u32,

    /// Backend that wrote the common part
    pub common_backend: String,

    /// Format version of the common part
    pub common_backend_version: u32,

    /// Timestamp when the checkpoint was committed
    pub created_at: DateTime<Utc>,
}

impl CheckpointingConfig {
    /// Create a config for a checkpoint written entirely by one backend
    pub fn uniform(backend: impl Into<String>, version: u32) -> Self {
        let backend = backend.into();
        Self {
            sharded_backend: backend.clone(),
            sharded_backend_version: version,
            common_backend: backend,
            common_backend_version: version,
            created_at: Utc::now(),
        }
    }
}

/// Persist the config as `metadata.json` inside `checkpoint_dir`.
///
/// Written atomically (temp file, then rename) so a reader never observes a
/// partially written commit marker.
pub async fn save_config(config: &CheckpointingConfig, checkpoint_dir: &Path) -> Result<()> {
    let path = checkpoint_dir.join(CHECKPOINT_METADATA_FILE);
    let temp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_vec_pretty(config)?;

    fs::create_dir_all(checkpoint_dir)
        .await
        .map_err(|e| Error::Storage {
            message: format!(
                "Failed to create checkpoint directory {:?}: {}",
                checkpoint_dir, e
            ),
        })?;
    fs::write(&temp_path, &payload)
        .await
        .map_err(|e| Error::Storage {
            message: format!("Failed to write {:?}: {}", temp_path, e),
        })?;
    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| Error::Storage {
            message: format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e),
        })?;

    debug!(?path, "Checkpoint metadata written");
    Ok(())
}

/// Blocking variant of [`save_config`] for use inside async-request
/// finalization, which runs as a plain callable on the caller's context.
pub fn save_config_blocking(config: &CheckpointingConfig, checkpoint_dir: &Path) -> Result<()> {
    let path = checkpoint_dir.join(CHECKPOINT_METADATA_FILE);
    let temp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_vec_pretty(config)?;

    std::fs::create_dir_all(checkpoint_dir).map_err(|e| Error::Storage {
        message: format!(
            "Failed to create checkpoint directory {:?}: {}",
            checkpoint_dir, e
        ),
    })?;
    std::fs::write(&temp_path, &payload).map_err(|e| Error::Storage {
        message: format!("Failed to write {:?}: {}", temp_path, e),
    })?;
    std::fs::rename(&temp_path, &path).map_err(|e| Error::Storage {
        message: format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e),
    })?;

    debug!(?path, "Checkpoint metadata written");
    Ok(())
}

/// Load the config from `checkpoint_dir` if present.
///
/// A missing `metadata.json` returns `None` (the directory may predate this
/// metadata or belong to a foreign tool); a present but unreadable one is an
/// error.
pub async fn maybe_load_config(checkpoint_dir: &Path) -> Result<Option<CheckpointingConfig>> {
    let path = checkpoint_dir.join(CHECKPOINT_METADATA_FILE);
    let raw = match fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Storage {
                message: format!("Failed to read {:?}: {}", path, e),
            })
        }
    };
    let config = serde_json::from_slice(&raw)?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = CheckpointingConfig::uniform("bincode", 1);

        save_config(&config, dir.path()).await.unwrap();
        let loaded = maybe_load_config(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_missing_config_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(maybe_load_config(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_config_is_error() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join(CHECKPOINT_METADATA_FILE), b"not json")
            .await
            .unwrap();
        assert!(maybe_load_config(dir.path()).await.is_err());
    }
}
