//! Checkpoint Core - Foundation for the distributed checkpointing system
//!
//! Provides the checkpoint data model (state dictionaries with sharded and
//! common leaves), strategy identity types, error handling and the persisted
//! checkpoint-level metadata.

pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use config::{
    maybe_load_config, save_config, save_config_blocking, CheckpointingConfig,
    CHECKPOINT_METADATA_FILE,
};
pub use error::{Error, Result};
pub use state::{ShardedStateDict, ShardedStateEntry, StateDict, StateEntry};
pub use types::{Dtype, ShardedObject, ShardedTensor, StrategyAction, StrategyId, Tensor};
