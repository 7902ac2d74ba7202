//! Strategy interfaces and the default-strategy registry
//!
//! Four capability families (load-common, load-sharded, save-common,
//! save-sharded) are expressed as traits a backend implements; async save is
//! a fifth capability extending save-sharded. The registry maps a checkpoint
//! identity (action, backend, version) to a registered strategy instance and
//! triggers a backend's self-registration routine on first lookup.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use checkpoint_core::{
    Error, Result, ShardedStateDict, StateDict, StrategyAction, StrategyId,
};

use crate::async_queue::{AsyncCallsQueue, AsyncRequest};
use crate::file::register_bincode_strategies;

/// Base capability of every load strategy: compatibility checks run by the
/// caller before trusting the strategy to read a checkpoint whose stored
/// metadata names a possibly different backend or version.
pub trait LoadStrategy: Send + Sync {
    /// Verify this strategy can read a checkpoint written by `loaded_backend`
    fn check_backend_compatibility(&self, loaded_backend: &str) -> Result<()>;

    /// Verify this strategy can read format revision `loaded_version`
    fn check_version_compatibility(&self, loaded_version: u32) -> Result<()>;

    /// Whether this strategy understands `ShardedObject` leaves
    fn can_handle_sharded_objects(&self) -> bool {
        false
    }

    /// Human-readable identity for logs and error messages
    fn description(&self) -> String;
}

/// Load strategy for the common (replicated) part of a checkpoint
#[async_trait]
pub trait LoadCommonStrategy: LoadStrategy {
    /// Load the replicated part of the checkpoint
    async fn load_common(&self, checkpoint_dir: &Path) -> Result<StateDict>;

    /// Resolve only the `ShardedObject` leaves of the provided skeleton
    async fn load_sharded_objects(
        &self,
        sharded_objects_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<StateDict>;

    /// Load sharded-object metadata from the checkpoint.
    ///
    /// The default returns an empty mapping when the strategy cannot handle
    /// sharded objects at all; this is a documented no-op, not an error.
    async fn load_sharded_metadata(&self, _checkpoint_dir: &Path) -> Result<ShardedStateDict> {
        if !self.can_handle_sharded_objects() {
            return Ok(ShardedStateDict::new());
        }
        Err(Error::UnsupportedOperation {
            strategy: self.description(),
            operation: "load_sharded_metadata".to_string(),
        })
    }
}

/// Load strategy for the sharded part of a checkpoint
#[async_trait]
pub trait LoadShardedStrategy: LoadStrategy {
    /// Load this worker's slices: each sharded leaf of the skeleton receives
    /// back the data for the slice it describes
    async fn load(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<StateDict>;

    /// Load tensor metadata only.
    ///
    /// Keys of the returned dict are raw per-tensor storage keys, not the
    /// caller's state-dict key paths; the two key spaces need not coincide.
    /// Entries carry the real global shape and dtype but no data and no
    /// sharding decision.
    async fn load_tensors_metadata(&self, checkpoint_dir: &Path) -> Result<ShardedStateDict>;

    /// Load metadata for both sharded tensors and sharded objects.
    ///
    /// Defaults to tensor metadata alone for strategies that cannot handle
    /// sharded objects; object-capable strategies must override.
    async fn load_sharded_metadata(&self, checkpoint_dir: &Path) -> Result<ShardedStateDict> {
        if !self.can_handle_sharded_objects() {
            return self.load_tensors_metadata(checkpoint_dir).await;
        }
        Err(Error::UnsupportedOperation {
            strategy: self.description(),
            operation: "load_sharded_metadata".to_string(),
        })
    }

    /// Remove all stored tensors whose storage key starts with `key_prefix`.
    /// Optional; backends without deletion support keep the default.
    async fn remove_sharded_tensors(
        &self,
        _checkpoint_dir: &Path,
        _key_prefix: &str,
    ) -> Result<()> {
        Err(Error::UnsupportedOperation {
            strategy: self.description(),
            operation: "remove_sharded_tensors".to_string(),
        })
    }
}

impl std::fmt::Debug for dyn LoadShardedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LoadShardedStrategy")
            .field(&self.description())
            .finish()
    }
}

/// Base capability of every save strategy: bound to one (backend, version)
/// pair at construction.
pub trait SaveStrategy: Send + Sync {
    /// Backend this strategy writes
    fn backend(&self) -> &str;

    /// Format version this strategy writes
    fn version(&self) -> u32;

    /// Whether this strategy understands `ShardedObject` leaves
    fn can_handle_sharded_objects(&self) -> bool {
        false
    }

    /// Human-readable identity combining type, backend and version
    fn description(&self) -> String;
}

/// Save strategy for the common (replicated) part of a checkpoint.
///
/// Every worker calling `save_common` for the same logical checkpoint must
/// either all perform the write or the caller must elect exactly one writer;
/// this layer does not deduplicate writers.
#[async_trait]
pub trait SaveCommonStrategy: SaveStrategy {
    /// Save the replicated part of the state dict
    async fn save_common(
        &self,
        common_state_dict: &StateDict,
        checkpoint_dir: &Path,
    ) -> Result<()>;

    /// Save the `ShardedObject` leaves of the state dict. Optional.
    async fn save_sharded_objects(
        &self,
        _sharded_objects_state_dict: &ShardedStateDict,
        _checkpoint_dir: &Path,
    ) -> Result<()> {
        Err(Error::UnsupportedOperation {
            strategy: self.description(),
            operation: "save_sharded_objects".to_string(),
        })
    }
}

/// Save strategy for the sharded part of a checkpoint
#[async_trait]
pub trait SaveShardedStrategy: SaveStrategy {
    /// Save this worker's slices of the sharded state dict
    async fn save(&self, sharded_state_dict: &ShardedStateDict, checkpoint_dir: &Path)
        -> Result<()>;
}

/// Save strategy suitable for async save.
///
/// `async_save` must perform everything that is unsafe to run outside the
/// calling context (validation, payload capture, planning) before returning,
/// packaging only the safely deferrable I/O into the returned request.
#[async_trait]
pub trait AsyncSaveShardedStrategy: SaveShardedStrategy {
    /// Prepare the save and return the request for the caller to schedule
    async fn async_save(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<AsyncRequest>;

    /// Synchronous facade over the async primitive: schedule the request and
    /// immediately finalize in blocking mode. Every async strategy is
    /// trivially usable as a sync strategy through this method, at the cost
    /// of forfeiting the async benefit.
    async fn save_blocking(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
        queue: &AsyncCallsQueue,
    ) -> Result<()> {
        let request = self.async_save(sharded_state_dict, checkpoint_dir).await?;
        queue.schedule_async_request(request);
        queue.maybe_finalize_async_calls(true).await?;
        Ok(())
    }
}

/// A registered save-sharded strategy; the variant declares whether the
/// async capability is available.
#[derive(Clone)]
pub enum SaveShardedRegistration {
    /// Synchronous-only strategy
    Sync(Arc<dyn SaveShardedStrategy>),

    /// Async-capable strategy, also usable synchronously
    Async(Arc<dyn AsyncSaveShardedStrategy>),
}

impl SaveShardedRegistration {
    /// Save this worker's slices, blocking until complete
    pub async fn save(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<()> {
        match self {
            SaveShardedRegistration::Sync(s) => s.save(sharded_state_dict, checkpoint_dir).await,
            SaveShardedRegistration::Async(s) => s.save(sharded_state_dict, checkpoint_dir).await,
        }
    }

    /// Obtain an async request; `UnsupportedOperation` for sync-only
    /// strategies
    pub async fn async_save(
        &self,
        sharded_state_dict: &ShardedStateDict,
        checkpoint_dir: &Path,
    ) -> Result<AsyncRequest> {
        match self {
            SaveShardedRegistration::Sync(s) => Err(Error::UnsupportedOperation {
                strategy: s.description(),
                operation: "async_save".to_string(),
            }),
            SaveShardedRegistration::Async(s) => {
                s.async_save(sharded_state_dict, checkpoint_dir).await
            }
        }
    }

    /// Whether the async capability is available
    pub fn supports_async(&self) -> bool {
        matches!(self, SaveShardedRegistration::Async(_))
    }

    /// Whether the strategy understands `ShardedObject` leaves
    pub fn can_handle_sharded_objects(&self) -> bool {
        match self {
            SaveShardedRegistration::Sync(s) => s.can_handle_sharded_objects(),
            SaveShardedRegistration::Async(s) => s.can_handle_sharded_objects(),
        }
    }

    /// Human-readable identity of the underlying strategy
    pub fn description(&self) -> String {
        match self {
            SaveShardedRegistration::Sync(s) => s.description(),
            SaveShardedRegistration::Async(s) => s.description(),
        }
    }
}

impl std::fmt::Debug for SaveShardedRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SaveShardedRegistration")
            .field(&self.description())
            .finish()
    }
}

/// A strategy instance registered under a checkpoint identity. The variant
/// carries the action, so a mismatch between the registered action and the
/// strategy's capability cannot be expressed.
#[derive(Clone)]
pub enum RegisteredStrategy {
    LoadCommon(Arc<dyn LoadCommonStrategy>),
    LoadSharded(Arc<dyn LoadShardedStrategy>),
    SaveCommon(Arc<dyn SaveCommonStrategy>),
    SaveSharded(SaveShardedRegistration),
}

impl RegisteredStrategy {
    /// Action this strategy serves
    pub fn action(&self) -> StrategyAction {
        match self {
            RegisteredStrategy::LoadCommon(_) => StrategyAction::LoadCommon,
            RegisteredStrategy::LoadSharded(_) => StrategyAction::LoadSharded,
            RegisteredStrategy::SaveCommon(_) => StrategyAction::SaveCommon,
            RegisteredStrategy::SaveSharded(_) => StrategyAction::SaveSharded,
        }
    }

    /// Human-readable identity of the underlying strategy
    pub fn description(&self) -> String {
        match self {
            RegisteredStrategy::LoadCommon(s) => s.description(),
            RegisteredStrategy::LoadSharded(s) => s.description(),
            RegisteredStrategy::SaveCommon(s) => s.description(),
            RegisteredStrategy::SaveSharded(s) => s.description(),
        }
    }

    /// The load-common strategy, if that is what was registered
    pub fn as_load_common(&self) -> Option<&Arc<dyn LoadCommonStrategy>> {
        match self {
            RegisteredStrategy::LoadCommon(s) => Some(s),
            _ => None,
        }
    }

    /// The load-sharded strategy, if that is what was registered
    pub fn as_load_sharded(&self) -> Option<&Arc<dyn LoadShardedStrategy>> {
        match self {
            RegisteredStrategy::LoadSharded(s) => Some(s),
            _ => None,
        }
    }

    /// The save-common strategy, if that is what was registered
    pub fn as_save_common(&self) -> Option<&Arc<dyn SaveCommonStrategy>> {
        match self {
            RegisteredStrategy::SaveCommon(s) => Some(s),
            _ => None,
        }
    }

    /// The save-sharded registration, if that is what was registered
    pub fn as_save_sharded(&self) -> Option<&SaveShardedRegistration> {
        match self {
            RegisteredStrategy::SaveSharded(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RegisteredStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStrategy")
            .field("action", &self.action())
            .field("description", &self.description())
            .finish()
    }
}

type ActivateFn = Box<dyn Fn(&StrategyRegistry) -> Result<()> + Send + Sync>;

struct BackendRegistration {
    hint: String,
    activate: ActivateFn,
    activated: AtomicBool,
}

/// Registry of default strategies, keyed by checkpoint identity.
///
/// Backends self-register lazily: the first lookup for a backend with no
/// registered strategies triggers its activation routine. Registration is
/// last-write-wins to allow test and benchmark overrides. Activation
/// routines must be idempotent and must only call [`StrategyRegistry::register`].
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: DashMap<StrategyId, RegisteredStrategy>,
    backends: DashMap<String, BackendRegistration>,
}

impl StrategyRegistry {
    /// Create an empty registry with no known backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in backends wired for lazy
    /// activation
    pub fn with_default_backends() -> Self {
        let registry = Self::new();
        registry.register_backend(
            crate::file::BINCODE_BACKEND,
            "The bincode backend is built in; activation failure indicates a bug",
            register_bincode_strategies,
        );
        registry
    }

    /// Make a backend known for lazy activation. `activate` is invoked on
    /// the first lookup for the backend; on failure the resolve reports
    /// `BackendUnavailable` carrying `hint`.
    pub fn register_backend(
        &self,
        name: impl Into<String>,
        hint: impl Into<String>,
        activate: impl Fn(&StrategyRegistry) -> Result<()> + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(backend = %name, "Backend registered for lazy activation");
        self.backends.insert(
            name,
            BackendRegistration {
                hint: hint.into(),
                activate: Box::new(activate),
                activated: AtomicBool::new(false),
            },
        );
    }

    /// Store a strategy under its identity, overwriting any prior entry.
    /// Last registration for a given identity wins.
    pub fn register(&self, backend: &str, version: u32, strategy: RegisteredStrategy) {
        let id = StrategyId::new(strategy.action(), backend, version);
        info!(%id, strategy = %strategy.description(), "Registered checkpoint strategy");
        if self.strategies.insert(id.clone(), strategy).is_some() {
            debug!(%id, "Replaced previously registered strategy");
        }
    }

    /// Resolve the strategy registered under the exact identity triple,
    /// activating the backend first if it has never registered anything.
    pub fn resolve(
        &self,
        action: StrategyAction,
        backend: &str,
        version: u32,
    ) -> Result<RegisteredStrategy> {
        self.ensure_backend_activated(action, backend, version)?;
        let id = StrategyId::new(action, backend, version);
        match self.strategies.get(&id) {
            Some(entry) => Ok(entry.clone()),
            None => Err(Error::StrategyNotFound { id }),
        }
    }

    /// Resolve a load-common strategy
    pub fn get_load_common(
        &self,
        backend: &str,
        version: u32,
    ) -> Result<Arc<dyn LoadCommonStrategy>> {
        let resolved = self.resolve(StrategyAction::LoadCommon, backend, version)?;
        match resolved {
            RegisteredStrategy::LoadCommon(s) => Ok(s),
            _ => Err(Error::StrategyNotFound {
                id: StrategyId::new(StrategyAction::LoadCommon, backend, version),
            }),
        }
    }

    /// Resolve a load-sharded strategy
    pub fn get_load_sharded(
        &self,
        backend: &str,
        version: u32,
    ) -> Result<Arc<dyn LoadShardedStrategy>> {
        let resolved = self.resolve(StrategyAction::LoadSharded, backend, version)?;
        match resolved {
            RegisteredStrategy::LoadSharded(s) => Ok(s),
            _ => Err(Error::StrategyNotFound {
                id: StrategyId::new(StrategyAction::LoadSharded, backend, version),
            }),
        }
    }

    /// Resolve a save-common strategy
    pub fn get_save_common(
        &self,
        backend: &str,
        version: u32,
    ) -> Result<Arc<dyn SaveCommonStrategy>> {
        let resolved = self.resolve(StrategyAction::SaveCommon, backend, version)?;
        match resolved {
            RegisteredStrategy::SaveCommon(s) => Ok(s),
            _ => Err(Error::StrategyNotFound {
                id: StrategyId::new(StrategyAction::SaveCommon, backend, version),
            }),
        }
    }

    /// Resolve a save-sharded strategy (sync or async capable)
    pub fn get_save_sharded(
        &self,
        backend: &str,
        version: u32,
    ) -> Result<SaveShardedRegistration> {
        let resolved = self.resolve(StrategyAction::SaveSharded, backend, version)?;
        match resolved {
            RegisteredStrategy::SaveSharded(s) => Ok(s),
            _ => Err(Error::StrategyNotFound {
                id: StrategyId::new(StrategyAction::SaveSharded, backend, version),
            }),
        }
    }

    fn ensure_backend_activated(
        &self,
        action: StrategyAction,
        backend: &str,
        version: u32,
    ) -> Result<()> {
        let has_any = self
            .strategies
            .iter()
            .any(|entry| entry.key().backend == backend);
        if has_any {
            return Ok(());
        }

        let registration = match self.backends.get(backend) {
            Some(registration) => registration,
            None => return Ok(()),
        };
        if registration.activated.load(Ordering::Acquire) {
            return Ok(());
        }

        debug!(backend, "Activating checkpoint backend");
        match (registration.activate)(self) {
            Ok(()) => {
                // Success sets the idempotency flag; a failed activation is
                // retried on the next resolve.
                registration.activated.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(Error::BackendUnavailable {
                id: StrategyId::new(action, backend, version),
                reason: e.to_string(),
                hint: registration.hint.clone(),
            }),
        }
    }
}

static DEFAULT_REGISTRY: Lazy<StrategyRegistry> =
    Lazy::new(StrategyRegistry::with_default_backends);

/// Process-wide registry provided for ergonomics; tests and embedders can
/// construct their own [`StrategyRegistry`] instead.
pub fn default_registry() -> &'static StrategyRegistry {
    &DEFAULT_REGISTRY
}

/// Register a strategy in the process-wide registry
pub fn register_default_strategy(backend: &str, version: u32, strategy: RegisteredStrategy) {
    default_registry().register(backend, version, strategy);
}

/// Resolve a strategy from the process-wide registry
pub fn get_default_strategy(
    action: StrategyAction,
    backend: &str,
    version: u32,
) -> Result<RegisteredStrategy> {
    default_registry().resolve(action, backend, version)
}
