//! Checkpoint Strategies - pluggable persistence for distributed checkpoints
//!
//! A strategy implements one load/save capability for one (backend, version)
//! pair. Strategies are resolved through a registry keyed by the checkpoint
//! identity triple (action, backend, version); backends self-register lazily
//! on first lookup. Sharded saves can run asynchronously: `async_save`
//! returns an execute/finalize pair that the caller schedules on the async
//! calls queue and finalizes at a point of its choosing.

pub mod async_queue;
pub mod base;
pub mod file;

pub use async_queue::{default_queue, AsyncCallsQueue, AsyncRequest};
pub use base::{
    default_registry, get_default_strategy, register_default_strategy, AsyncSaveShardedStrategy,
    LoadCommonStrategy, LoadShardedStrategy, LoadStrategy, RegisteredStrategy,
    SaveCommonStrategy, SaveShardedRegistration, SaveShardedStrategy, SaveStrategy,
    StrategyRegistry,
};
pub use file::{
    register_bincode_strategies, BincodeCommonLoadStrategy, BincodeCommonSaveStrategy,
    BincodeShardedLoadStrategy, BincodeShardedSaveStrategy, BINCODE_BACKEND,
    BINCODE_BACKEND_VERSION,
};
