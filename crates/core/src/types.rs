//! Core type definitions for the distributed checkpointing system

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Specifies save vs load and sharded vs common action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAction {
    /// Load the replicated (common) part of a checkpoint
    LoadCommon,

    /// Load the per-worker (sharded) part of a checkpoint
    LoadSharded,

    /// Save the replicated (common) part of a checkpoint
    SaveCommon,

    /// Save the per-worker (sharded) part of a checkpoint
    SaveSharded,
}

impl StrategyAction {
    /// Stable lowercase name used in identities and log messages
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyAction::LoadCommon => "load_common",
            StrategyAction::LoadSharded => "load_sharded",
            StrategyAction::SaveCommon => "save_common",
            StrategyAction::SaveSharded => "save_sharded",
        }
    }
}

impl fmt::Display for StrategyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoint identity: the (action, backend, version) triple used as the
/// sole key for strategy registration and lookup. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrategyId {
    /// Save/load and sharded/common action
    pub action: StrategyAction,

    /// Opaque backend name ("bincode", "zarr", ...)
    pub backend: String,

    /// Serialization format revision
    pub version: u32,
}

impl StrategyId {
    /// Create a new strategy identity
    pub fn new(action: StrategyAction, backend: impl Into<String>, version: u32) -> Self {
        Self {
            action,
            backend: backend.into(),
            version,
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/v{}", self.action, self.backend, self.version)
    }
}

/// Tensor element type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    F64,
    F32,
    F16,
    Bf16,
    I64,
    I32,
    I8,
    U8,
    Bool,
}

impl Dtype {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F16 | Dtype::Bf16 => 2,
            Dtype::I8 | Dtype::U8 | Dtype::Bool => 1,
        }
    }
}

/// A concrete, fully assembled tensor (dtype, shape and raw payload)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tensor {
    /// Element type
    pub dtype: Dtype,

    /// Tensor shape
    pub shape: Vec<u64>,

    /// Raw element data, little-endian, row-major
    pub data: Bytes,
}

impl Tensor {
    /// Create a new tensor
    pub fn new(dtype: Dtype, shape: Vec<u64>, data: Bytes) -> Self {
        Self { dtype, shape, data }
    }

    /// Number of elements
    pub fn numel(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Expected payload length for this dtype and shape
    pub fn expected_data_len(&self) -> usize {
        self.numel() as usize * self.dtype.size_bytes()
    }
}

/// One worker's slice of a logical tensor, plus the global shape and the
/// slice position within it. The partitioning itself is produced by an
/// external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardedTensor {
    /// Storage key identifying the logical tensor
    pub key: String,

    /// Element type
    pub dtype: Dtype,

    /// Shape of the full logical tensor
    pub global_shape: Vec<u64>,

    /// Offset of this slice within the global tensor, per dimension
    pub global_offset: Vec<u64>,

    /// Shape of this worker's slice
    pub local_shape: Vec<u64>,

    /// Replica index for redundantly held slices
    pub replica_id: u64,

    /// Slice payload; `None` for metadata-only tensors
    pub data: Option<Bytes>,
}

impl ShardedTensor {
    /// Create a sharded tensor carrying data
    pub fn new(
        key: impl Into<String>,
        dtype: Dtype,
        global_shape: Vec<u64>,
        global_offset: Vec<u64>,
        local_shape: Vec<u64>,
        data: Bytes,
    ) -> Self {
        Self {
            key: key.into(),
            dtype,
            global_shape,
            global_offset,
            local_shape,
            replica_id: 0,
            data: Some(data),
        }
    }

    /// Metadata-only form: full global shape, no partitioning, no payload.
    /// This is the shape returned by `load_tensors_metadata`.
    pub fn metadata(key: impl Into<String>, dtype: Dtype, global_shape: Vec<u64>) -> Self {
        let rank = global_shape.len();
        Self {
            key: key.into(),
            dtype,
            local_shape: global_shape.clone(),
            global_shape,
            global_offset: vec![0; rank],
            replica_id: 0,
            data: None,
        }
    }

    /// Number of elements in this slice
    pub fn local_numel(&self) -> u64 {
        self.local_shape.iter().product()
    }

    /// Expected payload length for this slice
    pub fn expected_data_len(&self) -> usize {
        self.local_numel() as usize * self.dtype.size_bytes()
    }

    /// Copy with the payload stripped
    pub fn without_data(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }

    /// Check rank agreement, slice bounds and payload length
    pub fn validate(&self) -> Result<()> {
        let rank = self.global_shape.len();
        if self.global_offset.len() != rank || self.local_shape.len() != rank {
            return Err(Error::InvalidStateDict {
                key: self.key.clone(),
                reason: format!(
                    "rank mismatch: global_shape has {} dims, global_offset {}, local_shape {}",
                    rank,
                    self.global_offset.len(),
                    self.local_shape.len()
                ),
            });
        }
        for (dim, ((&offset, &local), &global)) in self
            .global_offset
            .iter()
            .zip(&self.local_shape)
            .zip(&self.global_shape)
            .enumerate()
        {
            if offset + local > global {
                return Err(Error::InvalidStateDict {
                    key: self.key.clone(),
                    reason: format!(
                        "slice out of bounds in dim {}: offset {} + extent {} > global {}",
                        dim, offset, local, global
                    ),
                });
            }
        }
        if let Some(data) = &self.data {
            let expected = self.expected_data_len();
            if data.len() != expected {
                return Err(Error::InvalidStateDict {
                    key: self.key.clone(),
                    reason: format!(
                        "payload length {} does not match {} elements of {:?}",
                        data.len(),
                        self.local_numel(),
                        self.dtype
                    ),
                });
            }
        }
        Ok(())
    }
}

/// An arbitrary serializable value with sharding metadata but no numeric
/// partitioning semantics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardedObject {
    /// Storage key identifying the logical object
    pub key: String,

    /// Shape of the shard grid this object belongs to
    pub global_shape: Vec<u64>,

    /// Position of this shard within the grid
    pub global_offset: Vec<u64>,

    /// Replica index for redundantly held shards
    pub replica_id: u64,

    /// Object payload; `None` for metadata-only entries
    pub value: Option<Value>,
}

impl ShardedObject {
    /// Create a sharded object carrying a value
    pub fn new(
        key: impl Into<String>,
        global_shape: Vec<u64>,
        global_offset: Vec<u64>,
        value: Value,
    ) -> Self {
        Self {
            key: key.into(),
            global_shape,
            global_offset,
            replica_id: 0,
            value: Some(value),
        }
    }

    /// Copy with the payload stripped
    pub fn without_value(&self) -> Self {
        Self {
            value: None,
            ..self.clone()
        }
    }

    /// Check grid rank agreement and shard position bounds
    pub fn validate(&self) -> Result<()> {
        if self.global_offset.len() != self.global_shape.len() {
            return Err(Error::InvalidStateDict {
                key: self.key.clone(),
                reason: format!(
                    "grid rank mismatch: global_shape has {} dims, global_offset {}",
                    self.global_shape.len(),
                    self.global_offset.len()
                ),
            });
        }
        for (dim, (&offset, &extent)) in
            self.global_offset.iter().zip(&self.global_shape).enumerate()
        {
            if offset >= extent {
                return Err(Error::InvalidStateDict {
                    key: self.key.clone(),
                    reason: format!(
                        "shard position out of bounds in dim {}: offset {} >= extent {}",
                        dim, offset, extent
                    ),
                });
            }
        }
        Ok(())
    }
}
