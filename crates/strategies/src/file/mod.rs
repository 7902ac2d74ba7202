//! Built-in "bincode" backend: filesystem checkpoints with bincode-framed
//! tensor shards and JSON envelopes for everything else
//!
//! Registered lazily under backend name [`BINCODE_BACKEND`], version
//! [`BINCODE_BACKEND_VERSION`], for all four actions.

pub mod common;
pub mod layout;
pub mod sharded;

use std::sync::Arc;

use checkpoint_core::{Error, Result};

use crate::base::{RegisteredStrategy, SaveShardedRegistration, StrategyRegistry};

pub use common::{BincodeCommonLoadStrategy, BincodeCommonSaveStrategy};
pub use sharded::{BincodeShardedLoadStrategy, BincodeShardedSaveStrategy};

/// Backend name of the built-in filesystem backend
pub const BINCODE_BACKEND: &str = "bincode";

/// Format version currently written by the built-in backend
pub const BINCODE_BACKEND_VERSION: u32 = 1;

/// Self-registration routine of the bincode backend: registers the default
/// strategy for every action. Idempotent; later calls overwrite with fresh
/// equivalent instances.
pub fn register_bincode_strategies(registry: &StrategyRegistry) -> Result<()> {
    registry.register(
        BINCODE_BACKEND,
        BINCODE_BACKEND_VERSION,
        RegisteredStrategy::LoadCommon(Arc::new(BincodeCommonLoadStrategy::new())),
    );
    registry.register(
        BINCODE_BACKEND,
        BINCODE_BACKEND_VERSION,
        RegisteredStrategy::LoadSharded(Arc::new(BincodeShardedLoadStrategy::new())),
    );
    registry.register(
        BINCODE_BACKEND,
        BINCODE_BACKEND_VERSION,
        RegisteredStrategy::SaveCommon(Arc::new(BincodeCommonSaveStrategy::new())),
    );
    registry.register(
        BINCODE_BACKEND,
        BINCODE_BACKEND_VERSION,
        RegisteredStrategy::SaveSharded(SaveShardedRegistration::Async(Arc::new(
            BincodeShardedSaveStrategy::new(),
        ))),
    );
    Ok(())
}

pub(crate) fn check_bincode_backend(strategy: &str, loaded_backend: &str) -> Result<()> {
    if loaded_backend == BINCODE_BACKEND {
        return Ok(());
    }
    Err(Error::IncompatibleCheckpoint {
        strategy: strategy.to_string(),
        reason: format!(
            "checkpoint was written by backend `{}`, this strategy reads `{}`",
            loaded_backend, BINCODE_BACKEND
        ),
    })
}

pub(crate) fn check_bincode_version(strategy: &str, loaded_version: u32) -> Result<()> {
    if loaded_version <= BINCODE_BACKEND_VERSION {
        return Ok(());
    }
    Err(Error::IncompatibleCheckpoint {
        strategy: strategy.to_string(),
        reason: format!(
            "checkpoint format version {} is newer than the supported {}",
            loaded_version, BINCODE_BACKEND_VERSION
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::StrategyAction;

    #[test]
    fn test_lazy_activation_registers_all_actions() {
        let registry = StrategyRegistry::with_default_backends();

        for action in [
            StrategyAction::LoadCommon,
            StrategyAction::LoadSharded,
            StrategyAction::SaveCommon,
            StrategyAction::SaveSharded,
        ] {
            let resolved = registry
                .resolve(action, BINCODE_BACKEND, BINCODE_BACKEND_VERSION)
                .unwrap();
            assert_eq!(resolved.action(), action);
        }
    }

    #[test]
    fn test_save_sharded_registration_is_async_capable() {
        let registry = StrategyRegistry::with_default_backends();
        let save = registry
            .get_save_sharded(BINCODE_BACKEND, BINCODE_BACKEND_VERSION)
            .unwrap();
        assert!(save.supports_async());
        assert!(save.can_handle_sharded_objects());
    }

    #[test]
    fn test_unknown_version_not_registered() {
        let registry = StrategyRegistry::with_default_backends();
        let err = registry.get_save_sharded(BINCODE_BACKEND, 99).unwrap_err();
        assert!(matches!(err, Error::StrategyNotFound { .. }));
    }
}
