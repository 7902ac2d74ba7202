//! Common-part strategies of the bincode backend

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, instrument};

use checkpoint_core::{
    Error, Result, ShardedStateDict, ShardedStateEntry, StateDict, StateEntry,
};

use crate::base::{LoadCommonStrategy, LoadStrategy, SaveCommonStrategy, SaveStrategy};
use crate::file::layout::{
    list_object_files, object_file_name, read_object_file, write_atomic, write_object_file,
    COMMON_STATE_FILE,
};
use crate::file::{
    check_bincode_backend, check_bincode_version, BINCODE_BACKEND, BINCODE_BACKEND_VERSION,
};

/// Saves the replicated part as `common.json` and object shards as JSON
/// envelopes
#[derive(Debug, Default)]
pub struct BincodeCommonSaveStrategy;

impl BincodeCommonSaveStrategy {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

impl SaveStrategy for BincodeCommonSaveStrategy {
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
            "BincodeCommonSaveStrategy({}, {})",
            self.backend(),
            self.version()
        )
    }
}

#[async_trait]
impl SaveCommonStrategy for BincodeCommonSaveStrategy {
    #[instrument(skip(self, common_state_dict), fields(backend = BINCODE_BACKEND))]
    async fn save_common(
        &self,
        common_state_dict: &StateDict,
        checkpoint_dir: &Path,
    ) -> Result<()> {
        fs::create_dir_all(checkpoint_dir)
            .await
            .map_err(|e| Error::Storage {
                message: format!(
                    "Failed to create checkpoint directory {:?}: {}",
                    checkpoint_dir, e
                ),
            })?;
        let payload = serde_json::to_vec_pretty(common_state_dict)?;
        write_atomic(&checkpoint_dir.join(COMMON_STATE_FILE), &payload).await?;
        debug!(size = payload.len(), "Common state written");
        Ok(())
    }

    #[instrument(skip(self, sharded_objects_state_dict), fields(backend = BINCODE_BACKEND))]
    async fn save_sharded_objects(
        &self,
        sharded_objects_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<()> {
        sharded_objects_state_dict.validate()?;
        fs::create_dir_all(checkpoint_dir)
            .await
            .map_err(|e| Error::Storage {
                message: format!(
                    "Failed to create checkpoint directory {:?}: {}",
                    checkpoint_dir, e
                ),
            })?;

        let objects = sharded_objects_state_dict.sharded_objects();
        for (_, object) in &objects {
            write_object_file(checkpoint_dir, object).await?;
        }
        debug!(count = objects.len(), "Object shards written");
        Ok(())
    }
}

/// Loads the replicated part and object shards written by
/// [`BincodeCommonSaveStrategy`]
#[derive(Debug, Default)]
pub struct BincodeCommonLoadStrategy;

impl BincodeCommonLoadStrategy {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadStrategy for BincodeCommonLoadStrategy {
    fn check_backend_compatibility(&self, loaded_backend: &str) -> Result<()> {
        check_bincode_backend(&self.description(), loaded_backend)
    }

    fn check_version_compatibility(&self, loaded_version: u32) -> Result<()> {
        check_bincode_version(&self.description(), loaded_version)
    }

    fn can_handle_sharded_objects(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!(
            "BincodeCommonLoadStrategy({}, {})",
            BINCODE_BACKEND, BINCODE_BACKEND_VERSION
        )
    }
}

#[async_trait]
impl LoadCommonStrategy for BincodeCommonLoadStrategy {
    #[instrument(skip(self), fields(backend = BINCODE_BACKEND))]
    async fn load_common(&self, checkpoint_dir: &Path) -> Result<StateDict> {
        let path = checkpoint_dir.join(COMMON_STATE_FILE);
        let raw = match fs::read(&path).await {
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

    #[instrument(skip(self, sharded_objects_state_dict), fields(backend = BINCODE_BACKEND))]
    async fn load_sharded_objects(
        &self,
        sharded_objects_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<StateDict> {
        // I/O first, flat over the skeleton's object leaves; the nested
        // result is then rebuilt structurally so key paths never need
        // parsing.
        let mut loaded: HashMap<String, Value> = HashMap::new();
        for (_, object) in sharded_objects_state_dict.sharded_objects() {
            let path = checkpoint_dir.join(object_file_name(object));
            let stored = read_object_file(&path).await?;
            if stored.key != object.key {
                return Err(Error::Storage {
                    message: format!(
                        "Object shard {:?} holds key `{}`, expected `{}`",
                        path, stored.key, object.key
                    ),
                });
            }
            let value = stored.value.ok_or_else(|| Error::Storage {
                message: format!("Object shard {:?} has no value", path),
            })?;
            loaded.insert(object.key.clone(), value);
        }
        resolve_objects(sharded_objects_state_dict, &loaded)
    }

    #[instrument(skip(self), fields(backend = BINCODE_BACKEND))]
    async fn load_sharded_metadata(&self, checkpoint_dir: &Path) -> Result<ShardedStateDict> {
        let mut metadata = ShardedStateDict::new();
        for path in list_object_files(checkpoint_dir).await? {
            let object = read_object_file(&path).await?;
            metadata
                .0
                .insert(object.key.clone(), ShardedStateEntry::Object(object.without_value()));
        }
        Ok(metadata)
    }
}

fn resolve_objects(
    skeleton: &ShardedStateDict,
    loaded: &HashMap<String, Value>,
) -> Result<StateDict> {
    let mut result = StateDict::new();
    for (key, entry) in &skeleton.0 {
        match entry {
            ShardedStateEntry::Object(object) => {
                let value = loaded.get(&object.key).ok_or_else(|| Error::Internal {
                    message: format!("Object `{}` was not loaded", object.key),
                })?;
                result.insert(key.clone(), StateEntry::Value(value.clone()));
            }
            ShardedStateEntry::Dict(nested) => {
                result.insert(key.clone(), resolve_objects(nested, loaded)?);
            }
            // Only ShardedObject leaves of the skeleton are resolved here.
            _ => {}
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::ShardedObject;
    use serde_json::json;
    use tempfile::TempDir;

    fn common_dict() -> StateDict {
        let mut schedule = StateDict::new();
        schedule.insert("lr", json!(0.0005));
        schedule.insert("warmup_steps", json!(2000));

        let mut dict = StateDict::new();
        dict.insert("iteration", json!(12000));
        dict.insert("schedule", schedule);
        dict
    }

    #[tokio::test]
    async fn test_common_round_trip() {
        let dir = TempDir::new().unwrap();
        let save = BincodeCommonSaveStrategy::new();
        let load = BincodeCommonLoadStrategy::new();

        save.save_common(&common_dict(), dir.path()).await.unwrap();
        let loaded = load.load_common(dir.path()).await.unwrap();
        assert_eq!(loaded, common_dict());
    }

    #[tokio::test]
    async fn test_load_common_missing_is_path_not_found() {
        let dir = TempDir::new().unwrap();
        let load = BincodeCommonLoadStrategy::new();
        let err = load.load_common(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::StoragePathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_sharded_objects_round_trip_preserves_nesting() {
        let dir = TempDir::new().unwrap();
        let save = BincodeCommonSaveStrategy::new();
        let load = BincodeCommonLoadStrategy::new();

        let mut dataloader = ShardedStateDict::new();
        dataloader.insert(
            "sampler",
            ShardedObject::new("dataloader.sampler", vec![2], vec![0], json!([5, 6, 7])),
        );
        let mut skeleton = ShardedStateDict::new();
        skeleton.insert("dataloader", dataloader);
        skeleton.insert(
            "rng",
            ShardedObject::new("rng_state", vec![2], vec![0], json!({"seed": 11})),
        );

        save.save_sharded_objects(&skeleton, dir.path())
            .await
            .unwrap();
        let resolved = load
            .load_sharded_objects(&skeleton, dir.path())
            .await
            .unwrap();

        assert_eq!(
            resolved.get("rng"),
            Some(&StateEntry::Value(json!({"seed": 11})))
        );
        match resolved.get("dataloader") {
            Some(StateEntry::Dict(nested)) => {
                assert_eq!(
                    nested.get("sampler"),
                    Some(&StateEntry::Value(json!([5, 6, 7])))
                );
            }
            other => panic!("expected nested dict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sharded_metadata_lists_objects_without_values() {
        let dir = TempDir::new().unwrap();
        let save = BincodeCommonSaveStrategy::new();
        let load = BincodeCommonLoadStrategy::new();

        let mut skeleton = ShardedStateDict::new();
        skeleton.insert(
            "rng",
            ShardedObject::new("rng_state", vec![2], vec![1], json!({"seed": 1})),
        );
        save.save_sharded_objects(&skeleton, dir.path())
            .await
            .unwrap();

        let metadata = load.load_sharded_metadata(dir.path()).await.unwrap();
        assert_eq!(metadata.len(), 1);
        match metadata.get("rng_state") {
            Some(ShardedStateEntry::Object(object)) => {
                assert!(object.value.is_none());
                assert_eq!(object.global_offset, vec![1]);
            }
            other => panic!("expected object metadata, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compatibility_checks() {
        let load = BincodeCommonLoadStrategy::new();
        load.check_backend_compatibility(BINCODE_BACKEND).unwrap();
        assert!(load.check_backend_compatibility("zarr").is_err());
        load.check_version_compatibility(1).unwrap();
        assert!(load.check_version_compatibility(2).is_err());
    }
}
