//! On-disk layout of the bincode backend
//!
//! A checkpoint directory holds `common.json` (the replicated part), one
//! self-describing `.distcp` file per tensor slice, one JSON envelope per
//! object shard, and `metadata.json` as the commit marker. Shard files start
//! with a magic, a framing version and a bincode header, followed by the raw
//! payload, so metadata can be read without touching the payload.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

use checkpoint_core::{Dtype, Error, Result, ShardedObject, ShardedTensor};

/// File holding the replicated part of the checkpoint
pub const COMMON_STATE_FILE: &str = "common.json";

/// Extension of tensor shard files
pub const SHARD_FILE_EXT: &str = "distcp";

const SHARD_FILE_PREFIX: &str = "shard__";
const OBJECT_FILE_PREFIX: &str = "obj__";

/// Magic bytes opening every shard file
pub const SHARD_MAGIC: [u8; 4] = *b"SHRD";

/// Framing version of the shard file container
pub const SHARD_FORMAT_VERSION: u32 = 1;

/// Metadata header stored in front of each shard payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardFileHeader {
    /// Storage key of the logical tensor
    pub key: String,

    /// Element type
    pub dtype: Dtype,

    /// Shape of the full logical tensor
    pub global_shape: Vec<u64>,

    /// Offset of this slice within the global tensor
    pub global_offset: Vec<u64>,

    /// Shape of this slice
    pub local_shape: Vec<u64>,

    /// Replica index of this slice
    pub replica_id: u64,

    /// Payload length in bytes
    pub data_len: u64,
}

impl ShardFileHeader {
    fn for_tensor(tensor: &ShardedTensor, data_len: u64) -> Self {
        Self {
            key: tensor.key.clone(),
            dtype: tensor.dtype,
            global_shape: tensor.global_shape.clone(),
            global_offset: tensor.global_offset.clone(),
            local_shape: tensor.local_shape.clone(),
            replica_id: tensor.replica_id,
            data_len,
        }
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn offsets_suffix(offsets: &[u64]) -> String {
    offsets
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

/// File name for a tensor slice, derived from its key and offset
pub fn shard_file_name(tensor: &ShardedTensor) -> String {
    format!(
        "{}{}__{}.{}",
        SHARD_FILE_PREFIX,
        sanitize_key(&tensor.key),
        offsets_suffix(&tensor.global_offset),
        SHARD_FILE_EXT
    )
}

/// File name for an object shard, derived from its key and grid position
pub fn object_file_name(object: &ShardedObject) -> String {
    format!(
        "{}{}__{}.json",
        OBJECT_FILE_PREFIX,
        sanitize_key(&object.key),
        offsets_suffix(&object.global_offset)
    )
}

fn temp_path(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    );
    path.with_file_name(temp_name)
}

/// Atomic write: temp file with a unique name, sync, then rename
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp = temp_path(path);
    fs::write(&temp, data).await.map_err(|e| Error::Storage {
        message: format!("Failed to write {:?}: {}", temp, e),
    })?;
    fs::rename(&temp, path).await.map_err(|e| Error::Storage {
        message: format!("Failed to rename {:?} to {:?}: {}", temp, path, e),
    })?;
    Ok(())
}

/// Write one tensor slice to its shard file. Blocking; designed to run on
/// the async-save worker thread.
pub fn write_shard_file_blocking(checkpoint_dir: &Path, tensor: &ShardedTensor) -> Result<()> {
    use std::io::Write;

    let data = tensor.data.as_ref().ok_or_else(|| Error::InvalidStateDict {
        key: tensor.key.clone(),
        reason: "cannot save a sharded tensor without a payload".to_string(),
    })?;

    let header = ShardFileHeader::for_tensor(tensor, data.len() as u64);
    let header_bytes = bincode::serialize(&header)?;

    let path = checkpoint_dir.join(shard_file_name(tensor));
    let temp = temp_path(&path);

    let mut file = std::fs::File::create(&temp).map_err(|e| Error::Storage {
        message: format!("Failed to create {:?}: {}", temp, e),
    })?;
    file.write_all(&SHARD_MAGIC)?;
    file.write_all(&SHARD_FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    file.write_all(&header_bytes)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp, &path).map_err(|e| Error::Storage {
        message: format!("Failed to rename {:?} to {:?}: {}", temp, path, e),
    })?;

    debug!(key = %tensor.key, path = %path.display(), size = data.len(), "Shard written");
    Ok(())
}

/// Write one object shard as a JSON envelope. Blocking; designed to run on
/// the async-save worker thread.
pub fn write_object_file_blocking(checkpoint_dir: &Path, object: &ShardedObject) -> Result<()> {
    if object.value.is_none() {
        return Err(Error::InvalidStateDict {
            key: object.key.clone(),
            reason: "cannot save a sharded object without a value".to_string(),
        });
    }
    let payload = serde_json::to_vec_pretty(object)?;
    let path = checkpoint_dir.join(object_file_name(object));
    let temp = temp_path(&path);

    std::fs::write(&temp, &payload).map_err(|e| Error::Storage {
        message: format!("Failed to write {:?}: {}", temp, e),
    })?;
    std::fs::rename(&temp, &path).map_err(|e| Error::Storage {
        message: format!("Failed to rename {:?} to {:?}: {}", temp, path, e),
    })?;

    debug!(key = %object.key, path = %path.display(), "Object shard written");
    Ok(())
}

/// Async variant of [`write_object_file_blocking`] for the common-save path
pub async fn write_object_file(checkpoint_dir: &Path, object: &ShardedObject) -> Result<()> {
    if object.value.is_none() {
        return Err(Error::InvalidStateDict {
            key: object.key.clone(),
            reason: "cannot save a sharded object without a value".to_string(),
        });
    }
    let payload = serde_json::to_vec_pretty(object)?;
    write_atomic(&checkpoint_dir.join(object_file_name(object)), &payload).await
}

async fn open_shard_file(path: &Path) -> Result<fs::File> {
    match fs::File::open(path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
            path: path.display().to_string(),
        }),
        Err(e) => Err(Error::Storage {
            message: format!("Failed to open {:?}: {}", path, e),
        }),
    }
}

async fn read_shard_framing(file: &mut fs::File, path: &Path) -> Result<ShardFileHeader> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).await?;
    if magic != SHARD_MAGIC {
        return Err(Error::Storage {
            message: format!("{:?} is not a shard file (bad magic)", path),
        });
    }

    let format_version = file.read_u32_le().await?;
    if format_version != SHARD_FORMAT_VERSION {
        return Err(Error::Storage {
            message: format!(
                "{:?} uses shard framing version {}, expected {}",
                path, format_version, SHARD_FORMAT_VERSION
            ),
        });
    }

    let header_len = file.read_u32_le().await?;
    let mut header_bytes = vec![0u8; header_len as usize];
    file.read_exact(&mut header_bytes).await?;
    Ok(bincode::deserialize(&header_bytes)?)
}

/// Read only the header of a shard file, leaving the payload untouched
pub async fn read_shard_header(path: &Path) -> Result<ShardFileHeader> {
    let mut file = open_shard_file(path).await?;
    read_shard_framing(&mut file, path).await
}

/// Read a shard file completely: header plus payload
pub async fn read_shard_file(path: &Path) -> Result<(ShardFileHeader, Bytes)> {
    let mut file = open_shard_file(path).await?;
    let header = read_shard_framing(&mut file, path).await?;

    let mut data = vec![0u8; header.data_len as usize];
    file.read_exact(&mut data).await?;
    Ok((header, Bytes::from(data)))
}

/// Read one object shard envelope
pub async fn read_object_file(path: &Path) -> Result<ShardedObject> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::StoragePathNotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => {
            return Err(Error::Storage {
                message: format!("Failed to read {:?}: {}", path, e),
            })
        }
    };
    Ok(serde_json::from_slice(&raw)?)
}

async fn list_with_prefix(
    checkpoint_dir: &Path,
    prefix: &str,
    extension: &str,
) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(checkpoint_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::StoragePathNotFound {
                path: checkpoint_dir.display().to_string(),
            })
        }
        Err(e) => {
            return Err(Error::Storage {
                message: format!("Failed to list {:?}: {}", checkpoint_dir, e),
            })
        }
    };

    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(extension) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// All tensor shard files in the checkpoint directory, sorted
pub async fn list_shard_files(checkpoint_dir: &Path) -> Result<Vec<PathBuf>> {
    list_with_prefix(checkpoint_dir, SHARD_FILE_PREFIX, SHARD_FILE_EXT).await
}

/// All object shard envelopes in the checkpoint directory, sorted
pub async fn list_object_files(checkpoint_dir: &Path) -> Result<Vec<PathBuf>> {
    list_with_prefix(checkpoint_dir, OBJECT_FILE_PREFIX, ".json").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_tensor() -> ShardedTensor {
        ShardedTensor::new(
            "model.layers.0/weight",
            Dtype::F32,
            vec![8, 4],
            vec![4, 0],
            vec![4, 4],
            Bytes::from(vec![7u8; 64]),
        )
    }

    #[test]
    fn test_shard_file_name_is_path_safe() {
        let name = shard_file_name(&sample_tensor());
        assert_eq!(name, "shard__model_layers_0_weight__4_0.distcp");
    }

    #[tokio::test]
    async fn test_shard_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let tensor = sample_tensor();

        write_shard_file_blocking(dir.path(), &tensor).unwrap();

        let path = dir.path().join(shard_file_name(&tensor));
        let (header, data) = read_shard_file(&path).await.unwrap();
        assert_eq!(header.key, tensor.key);
        assert_eq!(header.dtype, Dtype::F32);
        assert_eq!(header.global_shape, vec![8, 4]);
        assert_eq!(data, tensor.data.unwrap());
    }

    #[tokio::test]
    async fn test_header_only_read() {
        let dir = TempDir::new().unwrap();
        let tensor = sample_tensor();
        write_shard_file_blocking(dir.path(), &tensor).unwrap();

        let header = read_shard_header(&dir.path().join(shard_file_name(&tensor)))
            .await
            .unwrap();
        assert_eq!(header.data_len, 64);
        assert_eq!(header.local_shape, vec![4, 4]);
    }

    #[tokio::test]
    async fn test_bad_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard__junk__0.distcp");
        fs::write(&path, b"JUNKJUNKJUNK").await.unwrap();

        let err = read_shard_header(&path).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[tokio::test]
    async fn test_missing_shard_is_path_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_shard_header(&dir.path().join("shard__absent__0.distcp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoragePathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_object_file_round_trip_and_listing() {
        let dir = TempDir::new().unwrap();
        let object = ShardedObject::new("rng_state", vec![2], vec![1], json!({"seed": 3}));

        write_object_file(dir.path(), &object).await.unwrap();
        let tensor = sample_tensor();
        write_shard_file_blocking(dir.path(), &tensor).unwrap();

        let objects = list_object_files(dir.path()).await.unwrap();
        assert_eq!(objects.len(), 1);
        let loaded = read_object_file(&objects[0]).await.unwrap();
        assert_eq!(loaded, object);

        let shards = list_shard_files(dir.path()).await.unwrap();
        assert_eq!(shards.len(), 1);
    }

    #[test]
    fn test_tensor_without_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tensor = sample_tensor().without_data();
        let err = write_shard_file_blocking(dir.path(), &tensor).unwrap_err();
        assert!(matches!(err, Error::InvalidStateDict { .. }));
    }
}
