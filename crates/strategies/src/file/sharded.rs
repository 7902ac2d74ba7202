//! Sharded-part strategies of the bincode backend

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};

use checkpoint_core::{
    save_config_blocking, CheckpointingConfig, Error, Result, ShardedObject, ShardedStateDict,
    ShardedStateEntry, ShardedTensor, StateDict, StateEntry, Tensor,
};

use crate::async_queue::{default_queue, AsyncRequest};
use crate::base::{
    AsyncSaveShardedStrategy, LoadShardedStrategy, LoadStrategy, SaveShardedStrategy,
    SaveStrategy,
};
use crate::file::layout::{
    list_shard_files, read_shard_file, read_shard_header, shard_file_name,
    write_object_file_blocking, write_shard_file_blocking,
};
use crate::file::{
    check_bincode_backend, check_bincode_version, BINCODE_BACKEND, BINCODE_BACKEND_VERSION,
};

/// Loads tensor slices written by [`BincodeShardedSaveStrategy`].
///
/// Slices are resolved by exact (key, offset, local shape) match: loading
/// with a different partitioning than the save is the resharding
/// collaborator's job, not this backend's.
#[derive(Debug, Default)]
pub struct BincodeShardedLoadStrategy;

impl BincodeShardedLoadStrategy {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadStrategy for BincodeShardedLoadStrategy {
    fn check_backend_compatibility(&self, loaded_backend: &str) -> Result<()> {
        check_bincode_backend(&self.description(), loaded_backend)
    }

    fn check_version_compatibility(&self, loaded_version: u32) -> Result<()> {
        check_bincode_version(&self.description(), loaded_version)
    }

    fn description(&self) -> String {
        format!(
            "BincodeShardedLoadStrategy({}, {})",
            BINCODE_BACKEND, BINCODE_BACKEND_VERSION
        )
    }
}

#[async_trait]
impl LoadShardedStrategy for BincodeShardedLoadStrategy {
    #[instrument(skip(self, sharded_state_dict), fields(backend = BINCODE_BACKEND))]
    async fn load(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<StateDict> {
        sharded_state_dict.validate()?;

        let mut loaded: HashMap<(String, Vec<u64>), Tensor> = HashMap::new();
        for (_, tensor) in sharded_state_dict.sharded_tensors() {
            let path = checkpoint_dir.join(shard_file_name(tensor));
            let (header, data) = read_shard_file(&path).await?;
            if header.key != tensor.key {
                return Err(Error::Storage {
                    message: format!(
                        "Shard file {:?} holds key `{}`, expected `{}`",
                        path, header.key, tensor.key
                    ),
                });
            }
            if header.dtype != tensor.dtype
                || header.global_shape != tensor.global_shape
                || header.local_shape != tensor.local_shape
            {
                return Err(Error::IncompatibleCheckpoint {
                    strategy: self.description(),
                    reason: format!(
                        "stored shard `{}` has dtype {:?} global shape {:?} local shape {:?}, \
                         requested dtype {:?} global shape {:?} local shape {:?}",
                        tensor.key,
                        header.dtype,
                        header.global_shape,
                        header.local_shape,
                        tensor.dtype,
                        tensor.global_shape,
                        tensor.local_shape
                    ),
                });
            }
            loaded.insert(
                (tensor.key.clone(), tensor.global_offset.clone()),
                Tensor::new(header.dtype, header.local_shape, data),
            );
        }

        resolve_tensors(sharded_state_dict, &loaded, &self.description())
    }

    #[instrument(skip(self), fields(backend = BINCODE_BACKEND))]
    async fn load_tensors_metadata(&self, checkpoint_dir: &Path) -> Result<ShardedStateDict> {
        let mut per_key: BTreeMap<String, ShardedTensor> = BTreeMap::new();
        for path in list_shard_files(checkpoint_dir).await? {
            let header = read_shard_header(&path).await?;
            match per_key.get(&header.key) {
                Some(existing) => {
                    if existing.dtype != header.dtype || existing.global_shape != header.global_shape
                    {
                        return Err(Error::Storage {
                            message: format!(
                                "Inconsistent shards for key `{}`: {:?}/{:?} vs {:?}/{:?}",
                                header.key,
                                existing.dtype,
                                existing.global_shape,
                                header.dtype,
                                header.global_shape
                            ),
                        });
                    }
                }
                None => {
                    per_key.insert(
                        header.key.clone(),
                        ShardedTensor::metadata(header.key.clone(), header.dtype, header.global_shape),
                    );
                }
            }
        }

        let mut metadata = ShardedStateDict::new();
        for (key, tensor) in per_key {
            metadata.0.insert(key, ShardedStateEntry::Tensor(tensor));
        }
        Ok(metadata)
    }

    #[instrument(skip(self), fields(backend = BINCODE_BACKEND))]
    async fn remove_sharded_tensors(&self, checkpoint_dir: &Path, key_prefix: &str) -> Result<()> {
        let mut removed = 0usize;
        for path in list_shard_files(checkpoint_dir).await? {
            let header = read_shard_header(&path).await?;
            if header.key.starts_with(key_prefix) {
                fs::remove_file(&path).await.map_err(|e| Error::Storage {
                    message: format!("Failed to delete {:?}: {}", path, e),
                })?;
                removed += 1;
            }
        }
        debug!(key_prefix, removed, "Removed sharded tensors");
        Ok(())
    }
}

fn resolve_tensors(
    skeleton: &ShardedStateDict,
    loaded: &HashMap<(String, Vec<u64>), Tensor>,
    strategy: &str,
) -> Result<StateDict> {
    let mut result = StateDict::new();
    for (key, entry) in &skeleton.0 {
        match entry {
            ShardedStateEntry::Tensor(tensor) => {
                let slot = (tensor.key.clone(), tensor.global_offset.clone());
                let concrete = loaded.get(&slot).ok_or_else(|| Error::Internal {
                    message: format!("Shard `{}` was not loaded", tensor.key),
                })?;
                result.insert(key.clone(), StateEntry::Tensor(concrete.clone()));
            }
            ShardedStateEntry::Object(object) => {
                return Err(Error::UnsupportedOperation {
                    strategy: strategy.to_string(),
                    operation: format!(
                        "loading ShardedObject `{}` (extract object leaves first)",
                        object.key
                    ),
                });
            }
            ShardedStateEntry::Dict(nested) => {
                result.insert(key.clone(), resolve_tensors(nested, loaded, strategy)?);
            }
            ShardedStateEntry::Value(value) => {
                result.insert(key.clone(), StateEntry::Value(value.clone()));
            }
        }
    }
    Ok(result)
}

/// Writes tensor slices and object shards; async-capable.
///
/// `async_save` validates and captures the payloads synchronously and defers
/// only the file writes; finalization commits the checkpoint by writing
/// `metadata.json`.
#[derive(Debug, Default)]
pub struct BincodeShardedSaveStrategy;

impl BincodeShardedSaveStrategy {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

impl SaveStrategy for BincodeShardedSaveStrategy {
    fn backend(&self) -> &str {
        BINCODE_BACKEND
    }

    fn version(&self) -> u32 {
        BINCODE_BACKEND_VERSION
    }

    fn can_handle_sharded_objects(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!(
            "BincodeShardedSaveStrategy({}, {})",
            self.backend(),
            self.version()
        )
    }
}

#[async_trait]
impl SaveShardedStrategy for BincodeShardedSaveStrategy {
    async fn save(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<()> {
        self.save_blocking(sharded_state_dict, checkpoint_dir, default_queue())
            .await
    }
}

#[async_trait]
impl AsyncSaveShardedStrategy for BincodeShardedSaveStrategy {
    #[instrument(skip(self, sharded_state_dict), fields(backend = BINCODE_BACKEND))]
    async fn async_save(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<AsyncRequest> {
        sharded_state_dict.validate()?;

        // Everything tied to the calling context happens here: validation,
        // payload capture and directory creation. The returned request only
        // carries plain file I/O.
        let mut tensors: Vec<ShardedTensor> = Vec::new();
        for (_, tensor) in sharded_state_dict.sharded_tensors() {
            if tensor.data.is_none() {
                return Err(Error::InvalidStateDict {
                    key: tensor.key.clone(),
                    reason: "cannot save a sharded tensor without a payload".to_string(),
                });
            }
            tensors.push(tensor.clone());
        }
        let mut objects: Vec<ShardedObject> = Vec::new();
        for (_, object) in sharded_state_dict.sharded_objects() {
            if object.value.is_none() {
                return Err(Error::InvalidStateDict {
                    key: object.key.clone(),
                    reason: "cannot save a sharded object without a value".to_string(),
                });
            }
            objects.push(object.clone());
        }

        fs::create_dir_all(checkpoint_dir)
            .await
            .map_err(|e| Error::Storage {
                message: format!(
                    "Failed to create checkpoint directory {:?}: {}",
                    checkpoint_dir, e
                ),
            })?;

        let execute_dir = checkpoint_dir.to_path_buf();
        let finalize_dir = checkpoint_dir.to_path_buf();

        let execute = move || {
            for tensor in &tensors {
                write_shard_file_blocking(&execute_dir, tensor)?;
            }
            for object in &objects {
                write_object_file_blocking(&execute_dir, object)?;
            }
            debug!(
                tensors = tensors.len(),
                objects = objects.len(),
                dir = %execute_dir.display(),
                "Sharded state written"
            );
            Ok(())
        };

        let finalize = move || {
            let config = CheckpointingConfig::uniform(BINCODE_BACKEND, BINCODE_BACKEND_VERSION);
            save_config_blocking(&config, &finalize_dir)?;
            debug!(dir = %finalize_dir.display(), "Checkpoint committed");
            Ok(())
        };

        Ok(AsyncRequest::new(execute, finalize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_queue::AsyncCallsQueue;
    use bytes::Bytes;
    use checkpoint_core::{maybe_load_config, Dtype};
    use serde_json::json;
    use tempfile::TempDir;

    fn worker_dict() -> ShardedStateDict {
        let mut model = ShardedStateDict::new();
        model.insert(
            "weight",
            ShardedTensor::new(
                "model.weight",
                Dtype::F32,
                vec![8, 4],
                vec![4, 0],
                vec![4, 4],
                Bytes::from((0u8..64).collect::<Vec<_>>()),
            ),
        );
        model.insert(
            "bias",
            ShardedTensor::new(
                "model.bias",
                Dtype::F32,
                vec![8],
                vec![0],
                vec![8],
                Bytes::from(vec![3u8; 32]),
            ),
        );

        let mut dict = ShardedStateDict::new();
        dict.insert("model", model);
        dict.insert("iteration", json!(100));
        dict
    }

    #[tokio::test]
    async fn test_async_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let save = BincodeShardedSaveStrategy::new();
        let load = BincodeShardedLoadStrategy::new();
        let queue = AsyncCallsQueue::new();

        let dict = worker_dict();
        let request = save.async_save(&dict, dir.path()).await.unwrap();
        queue.schedule_async_request(request);
        assert!(queue.maybe_finalize_async_calls(true).await.unwrap());

        // Finalization committed the checkpoint metadata.
        let config = maybe_load_config(dir.path()).await.unwrap().unwrap();
        assert_eq!(config.sharded_backend, BINCODE_BACKEND);

        let loaded = load.load(&dict, dir.path()).await.unwrap();
        match loaded.get("model") {
            Some(StateEntry::Dict(model)) => match model.get("weight") {
                Some(StateEntry::Tensor(tensor)) => {
                    assert_eq!(tensor.shape, vec![4, 4]);
                    assert_eq!(tensor.dtype, Dtype::F32);
                    assert_eq!(tensor.data, Bytes::from((0u8..64).collect::<Vec<_>>()));
                }
                other => panic!("expected tensor, got {:?}", other),
            },
            other => panic!("expected dict, got {:?}", other),
        }
        // Non-sharded leaves pass through unchanged.
        assert_eq!(loaded.get("iteration"), Some(&StateEntry::Value(json!(100))));
    }

    #[tokio::test]
    async fn test_metadata_is_not_written_before_finalize() {
        let dir = TempDir::new().unwrap();
        let save = BincodeShardedSaveStrategy::new();
        let queue = AsyncCallsQueue::new();

        let request = save.async_save(&worker_dict(), dir.path()).await.unwrap();
        queue.schedule_async_request(request);

        // Execution may finish, but the commit marker only appears once the
        // caller finalizes.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(maybe_load_config(dir.path()).await.unwrap().is_none());

        queue.maybe_finalize_async_calls(true).await.unwrap();
        assert!(maybe_load_config(dir.path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_tensors_metadata_has_shapes_and_no_data() {
        let dir = TempDir::new().unwrap();
        let save = BincodeShardedSaveStrategy::new();
        let load = BincodeShardedLoadStrategy::new();
        let queue = AsyncCallsQueue::new();

        let request = save.async_save(&worker_dict(), dir.path()).await.unwrap();
        queue.schedule_async_request(request);
        queue.maybe_finalize_async_calls(true).await.unwrap();

        let metadata = load.load_tensors_metadata(dir.path()).await.unwrap();
        assert_eq!(metadata.len(), 2);
        match metadata.get("model.weight") {
            Some(ShardedStateEntry::Tensor(tensor)) => {
                assert_eq!(tensor.global_shape, vec![8, 4]);
                assert_eq!(tensor.dtype, Dtype::F32);
                assert!(tensor.data.is_none());
                // No sharding decision: the metadata covers the full tensor.
                assert_eq!(tensor.local_shape, tensor.global_shape);
                assert_eq!(tensor.global_offset, vec![0, 0]);
            }
            other => panic!("expected tensor metadata, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dtype_mismatch_is_incompatible_checkpoint() {
        let dir = TempDir::new().unwrap();
        let save = BincodeShardedSaveStrategy::new();
        let load = BincodeShardedLoadStrategy::new();
        let queue = AsyncCallsQueue::new();

        let dict = worker_dict();
        let request = save.async_save(&dict, dir.path()).await.unwrap();
        queue.schedule_async_request(request);
        queue.maybe_finalize_async_calls(true).await.unwrap();

        let mut requested = ShardedStateDict::new();
        requested.insert(
            "bias",
            ShardedTensor::new(
                "model.bias",
                Dtype::F64,
                vec![8],
                vec![0],
                vec![8],
                Bytes::from(vec![0u8; 64]),
            ),
        );
        let err = load.load(&requested, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::IncompatibleCheckpoint { .. }));
    }

    #[tokio::test]
    async fn test_missing_shard_is_path_not_found() {
        let dir = TempDir::new().unwrap();
        let load = BincodeShardedLoadStrategy::new();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();

        let mut requested = ShardedStateDict::new();
        requested.insert(
            "weight",
            ShardedTensor::new(
                "model.weight",
                Dtype::F32,
                vec![4],
                vec![0],
                vec![4],
                Bytes::from(vec![0u8; 16]),
            ),
        );
        let err = load.load(&requested, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::StoragePathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_sharded_tensors_by_prefix() {
        let dir = TempDir::new().unwrap();
        let save = BincodeShardedSaveStrategy::new();
        let load = BincodeShardedLoadStrategy::new();
        let queue = AsyncCallsQueue::new();

        let request = save.async_save(&worker_dict(), dir.path()).await.unwrap();
        queue.schedule_async_request(request);
        queue.maybe_finalize_async_calls(true).await.unwrap();

        load.remove_sharded_tensors(dir.path(), "model.bias")
            .await
            .unwrap();

        let metadata = load.load_tensors_metadata(dir.path()).await.unwrap();
        assert_eq!(metadata.len(), 1);
        assert!(metadata.get("model.weight").is_some());
        assert!(metadata.get("model.bias").is_none());
    }

    #[tokio::test]
    async fn test_object_leaf_rejected_by_sharded_load() {
        let dir = TempDir::new().unwrap();
        let load = BincodeShardedLoadStrategy::new();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();

        let mut requested = ShardedStateDict::new();
        requested.insert(
            "rng",
            checkpoint_core::ShardedObject::new("rng_state", vec![1], vec![0], json!(1)),
        );
        let err = load.load(&requested, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
    }
}
