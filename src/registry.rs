//! Registry of running entity processes.
//!
//! [`EntityRegistry`] holds the shared journal and snapshot store, spawns
//! entity processes on demand, and caches their handles so that at most one
//! live process exists per [`EntityId`] within the registry.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::actor::{EntityHandle, spawn_entity};
use crate::config::EntityConfig;
use crate::entity::{Entity, EntityId};
use crate::error::RegistryError;
use crate::journal::{InMemoryJournal, Journal};
use crate::policy::SnapshotPolicy;
use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};
use crate::storage::{FileJournal, StorageLayout};

/// Type-erased view of an [`EntityHandle`], so one map can hold handles for
/// any entity type and still stop them.
#[async_trait]
trait ManagedEntity: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn entity_type(&self) -> &'static str;
    fn is_alive(&self) -> bool;
    async fn stop(&self);
}

#[async_trait]
impl<E: Entity> ManagedEntity for EntityHandle<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entity_type(&self) -> &'static str {
        E::ENTITY_TYPE
    }

    fn is_alive(&self) -> bool {
        EntityHandle::is_alive(self)
    }

    async fn stop(&self) {
        EntityHandle::stop(self).await;
    }
}

type HandleCache = HashMap<EntityId, Arc<dyn ManagedEntity>>;
type SpawnLock = Arc<Mutex<()>>;

/// Spawns, caches, and stops entity processes over shared stores.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct EntityRegistry {
    journal: Arc<dyn Journal>,
    snapshots: Arc<dyn SnapshotStore>,
    config: EntityConfig,
    cache: Arc<RwLock<HandleCache>>,
    // One lock per id: two callers never recover the same id twice, while
    // different ids recover concurrently.
    spawn_locks: Arc<std::sync::Mutex<HashMap<EntityId, SpawnLock>>>,
}

// Manual `Debug` because the stores and the cache are trait objects.
impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EntityRegistry {
    /// Start building a registry.
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::new()
    }

    /// Registry over in-memory stores with default configuration.
    pub fn in_memory() -> Self {
        EntityRegistryBuilder::new().build()
    }

    /// The shared journal.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// The shared snapshot store.
    pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// Default configuration applied to spawned processes.
    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    /// Get a handle to a live entity process, recovering it if needed.
    ///
    /// If a live process for `entity_id` is cached, a clone of its handle is
    /// returned and `empty_state` is dropped. Otherwise a stale process that
    /// is still winding down is stopped and joined first, so its in-flight
    /// append lands before the entity is recovered from the stores. A new
    /// process is then started with the registry's configuration and the
    /// given snapshot `policy`.
    ///
    /// # Errors
    ///
    /// * [`RegistryError::Recovery`] if recovery fails; no process is started.
    /// * [`RegistryError::TypeMismatch`] if a live process of another entity
    ///   type already owns `entity_id`.
    pub async fn spawn_or_recover<E: Entity>(
        &self,
        entity_id: EntityId,
        empty_state: E,
        policy: SnapshotPolicy,
    ) -> Result<EntityHandle<E>, RegistryError> {
        // Fast path: check cache with read lock.
        if let Some(handle) = self.cached::<E>(&entity_id).await? {
            return Ok(handle);
        }

        let lock = self.spawn_lock(&entity_id);
        let _guard = lock.lock().await;

        // Another caller may have spawned it while we waited.
        if let Some(handle) = self.cached::<E>(&entity_id).await? {
            return Ok(handle);
        }

        // Slow path: join the stale process, evict it, spawn a new one.
        let stale = self.cache.read().await.get(&entity_id).cloned();
        if let Some(stale) = stale {
            stale.stop().await;
            self.evict(&entity_id, &stale).await;
        }

        tracing::debug!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %entity_id,
            "spawning entity process"
        );

        let config = self.config.clone().snapshot_policy(policy);
        let handle = spawn_entity(
            entity_id.clone(),
            empty_state,
            Arc::clone(&self.journal),
            Arc::clone(&self.snapshots),
            config,
        )
        .await?;

        self.cache
            .write()
            .await
            .insert(entity_id, Arc::new(handle.clone()));
        Ok(handle)
    }

    fn spawn_lock(&self, entity_id: &EntityId) -> SpawnLock {
        let mut locks = self
            .spawn_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(entity_id.clone()).or_default())
    }

    /// Drop the cache entry for `entity_id` if it still holds `managed`.
    async fn evict(&self, entity_id: &EntityId, managed: &Arc<dyn ManagedEntity>) {
        let mut cache = self.cache.write().await;
        if cache
            .get(entity_id)
            .is_some_and(|current| Arc::ptr_eq(current, managed))
        {
            cache.remove(entity_id);
        }
    }

    /// Live cached handle for `entity_id`, if any.
    async fn cached<E: Entity>(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<EntityHandle<E>>, RegistryError> {
        let cache = self.cache.read().await;
        let Some(managed) = cache.get(entity_id) else {
            return Ok(None);
        };
        if !managed.is_alive() {
            return Ok(None);
        }
        match managed.as_any().downcast_ref::<EntityHandle<E>>() {
            Some(handle) => Ok(Some(handle.clone())),
            None => {
                tracing::warn!(
                    entity_id = %entity_id,
                    running = managed.entity_type(),
                    requested = E::ENTITY_TYPE,
                    "entity id already in use by another type"
                );
                Err(RegistryError::TypeMismatch {
                    entity_id: entity_id.clone(),
                    requested: E::ENTITY_TYPE,
                })
            }
        }
    }

    /// Handle to an already-running entity of type `E`, without spawning.
    ///
    /// Returns `None` if no live process of that type exists for the id.
    pub async fn get<E: Entity>(&self, entity_id: &EntityId) -> Option<EntityHandle<E>> {
        self.cached::<E>(entity_id).await.ok().flatten()
    }

    /// Ids of every live entity process.
    pub async fn ids(&self) -> Vec<EntityId> {
        let cache = self.cache.read().await;
        let mut ids: Vec<EntityId> = cache
            .iter()
            .filter(|(_, managed)| managed.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop one entity process and forget its handle.
    ///
    /// The handle stays cached until the process has exited, so a concurrent
    /// [`spawn_or_recover`](Self::spawn_or_recover) waits for it instead of
    /// recovering while the old process may still append.
    ///
    /// Returns `false` if nothing was registered under `entity_id`.
    pub async fn stop(&self, entity_id: &EntityId) -> bool {
        let cached = self.cache.read().await.get(entity_id).cloned();
        match cached {
            Some(managed) => {
                managed.stop().await;
                self.evict(entity_id, &managed).await;
                true
            }
            None => false,
        }
    }

    /// Stop every entity process. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let entries: Vec<(EntityId, Arc<dyn ManagedEntity>)> = self
            .cache
            .read()
            .await
            .iter()
            .map(|(id, managed)| (id.clone(), Arc::clone(managed)))
            .collect();
        let count = entries.len();
        for (entity_id, managed) in entries {
            tracing::debug!(
                entity_type = managed.entity_type(),
                entity_id = %entity_id,
                "stopping entity process"
            );
            managed.stop().await;
            self.evict(&entity_id, &managed).await;
        }
        count
    }
}

/// Builder for [`EntityRegistry`].
///
/// Stores default to in-memory ones unless a `base_dir` or explicit store
/// is supplied.
///
/// # Examples
///
/// ```no_run
/// # async fn example() {
/// use eventfold_engine::{EntityConfig, EntityRegistry};
///
/// let registry = EntityRegistry::builder()
///     .base_dir("/tmp/my-app")
///     .config(EntityConfig::default().mailbox_capacity(128))
///     .build();
/// # let _ = registry;
/// # }
/// ```
#[derive(Default)]
pub struct EntityRegistryBuilder {
    base_dir: Option<PathBuf>,
    journal: Option<Arc<dyn Journal>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: EntityConfig,
}

impl EntityRegistryBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the journal and snapshots as files under `path`.
    ///
    /// An explicitly supplied journal or snapshot store takes precedence.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Use `journal` as the event log.
    pub fn journal(mut self, journal: impl Journal) -> Self {
        self.journal = Some(Arc::new(journal));
        self
    }

    /// Use `store` for snapshots.
    pub fn snapshot_store(mut self, store: impl SnapshotStore) -> Self {
        self.snapshots = Some(Arc::new(store));
        self
    }

    /// Default process configuration. The snapshot policy passed to
    /// [`EntityRegistry::spawn_or_recover`] overrides `config.snapshot`.
    pub fn config(mut self, config: EntityConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the registry.
    pub fn build(self) -> EntityRegistry {
        let layout = self.base_dir.map(StorageLayout::new);

        let journal = match (self.journal, &layout) {
            (Some(journal), _) => journal,
            (None, Some(layout)) => Arc::new(FileJournal::with_layout(layout.clone())),
            (None, None) => Arc::new(InMemoryJournal::new()),
        };
        let snapshots = match (self.snapshots, layout) {
            (Some(store), _) => store,
            (None, Some(layout)) => Arc::new(FileSnapshotStore::with_layout(layout)),
            (None, None) => Arc::new(InMemorySnapshotStore::new()),
        };

        EntityRegistry {
            journal,
            snapshots,
            config: self.config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            spawn_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}
