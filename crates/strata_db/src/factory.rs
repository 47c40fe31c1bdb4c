//! Repository registry and factory
//!
//! The factory maps entity names to repository constructors and keeps a
//! bounded cache of live repositories keyed by entity name and call-site
//! options, so repeated lookups with the same options share one instance.
//! Cache entries expire once they have not been accessed for the configured
//! TTL; the owning process sweeps them with
//! [`RepositoryFactory::cleanup_expired_cache`], for example through
//! [`spawn_cache_cleanup`].

use crate::client::DbClient;
use crate::entity::EntityMapper;
use crate::record::TableDef;
use crate::repository::{BaseRepository, ManagedRepository, RepositoryContext};
use crate::sync::lock;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use strata_common::{InternalCode, RepositoryError, RepositoryResult};
use strata_config::{RepositoryFactoryConfig, RepositoryOptions, RepositoryOptionsOverride};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Constructor =
    Arc<dyn Fn(RepositoryOptions, &RepositoryContext) -> RepositoryResult<Arc<dyn ManagedRepository>> + Send + Sync>;

/// Binds an entity name to a repository constructor, a table and default options.
#[derive(Clone)]
pub struct RepositoryRegistration {
    entity_name: String,
    table: TableDef,
    options: Option<RepositoryOptionsOverride>,
    repository_type: &'static str,
    constructor: Constructor,
}

impl RepositoryRegistration {
    /// Registers a [`BaseRepository`] built with a fresh mapper from `make_mapper`.
    pub fn new<M, F>(entity_name: impl Into<String>, table: TableDef, make_mapper: F) -> Self
    where
        M: EntityMapper,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let entity_name = entity_name.into();
        let name = entity_name.clone();
        let repository_table = table.clone();
        let constructor: Constructor = Arc::new(move |options: RepositoryOptions, context: &RepositoryContext| {
            let repository = BaseRepository::new(
                name.clone(),
                repository_table.clone(),
                make_mapper(),
                options,
                context,
            )?;
            Ok(Arc::new(repository) as Arc<dyn ManagedRepository>)
        });

        Self {
            entity_name,
            table,
            options: None,
            repository_type: std::any::type_name::<M>(),
            constructor,
        }
    }

    /// Registration-level options, applied over the factory defaults.
    pub fn with_options(mut self, options: RepositoryOptionsOverride) -> Self {
        self.options = Some(options);
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    pub fn options(&self) -> Option<&RepositoryOptionsOverride> {
        self.options.as_ref()
    }
}

impl std::fmt::Debug for RepositoryRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRegistration")
            .field("entity_name", &self.entity_name)
            .field("table", &self.table.name())
            .field("options", &self.options)
            .field("repository_type", &self.repository_type)
            .finish()
    }
}

/// Bookkeeping for one cached repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryMetadata {
    pub cache_key: String,
    pub entity_name: String,
    pub repository_type: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub options: RepositoryOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactoryStats {
    pub registered_repositories: usize,
    pub cached_repositories: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits as a percentage of cached lookups.
    pub cache_hit_rate: f64,
    pub repositories: Vec<RepositoryMetadata>,
}

struct CachedRepository {
    repository: Arc<dyn ManagedRepository>,
    metadata: RepositoryMetadata,
    last_access: Instant,
    // Breaks ties between entries touched within the same clock tick
    sequence: u64,
}

impl CachedRepository {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_access.elapsed() > ttl
    }
}

#[derive(Default)]
struct FactoryState {
    registrations: HashMap<String, RepositoryRegistration>,
    cache: HashMap<String, CachedRepository>,
    sequence: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl FactoryState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Drops the least recently accessed entry.
    fn evict_lru(&mut self) {
        let oldest = self
            .cache
            .iter()
            .min_by_key(|(_, entry)| (entry.last_access, entry.sequence))
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.cache.remove(&key);
            debug!(cache_key = %key, "Evicted least recently used repository");
        }
    }

    fn remove_entity(&mut self, entity_name: &str) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.metadata.entity_name != entity_name);
        before - self.cache.len()
    }
}

static INSTANCE: Lazy<RwLock<Option<Arc<RepositoryFactory>>>> = Lazy::new(|| RwLock::new(None));

pub struct RepositoryFactory {
    config: RepositoryFactoryConfig,
    context: RepositoryContext,
    state: Mutex<FactoryState>,
}

impl std::fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RepositoryFactory")
            .field("config", &self.config)
            .field("registered", &state.registrations.len())
            .field("cached", &state.cache.len())
            .finish()
    }
}

impl RepositoryFactory {
    /// Creates an isolated factory. Most processes use [`RepositoryFactory::init`] instead.
    pub fn new(client: DbClient, config: RepositoryFactoryConfig) -> Self {
        let context = RepositoryContext::new(client, config.monitoring.clone());
        Self {
            config,
            context,
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// Initializes the process-wide factory once.
    ///
    /// Later calls return the existing instance and ignore their arguments.
    pub fn init(client: DbClient, config: RepositoryFactoryConfig) -> Arc<Self> {
        let mut instance = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instance.as_ref() {
            debug!("Repository factory already initialized");
            return Arc::clone(existing);
        }

        let factory = Arc::new(Self::new(client, config));
        *instance = Some(Arc::clone(&factory));
        info!("Repository factory initialized");
        factory
    }

    /// The process-wide factory.
    ///
    /// # Errors
    ///
    /// `Internal(CONFIGURATION_ERROR)` before [`RepositoryFactory::init`] has run.
    pub fn instance() -> RepositoryResult<Arc<Self>> {
        INSTANCE
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| {
                RepositoryError::internal(
                    InternalCode::ConfigurationError,
                    "Repository factory has not been initialized",
                )
            })
    }

    /// Drops the process-wide factory so the next [`RepositoryFactory::init`] builds a new one.
    pub fn reset() {
        INSTANCE.write().unwrap_or_else(PoisonError::into_inner).take();
        debug!("Repository factory reset");
    }

    /// Stores a registration, replacing (and uncaching) any previous one for the same entity.
    pub fn register(&self, registration: RepositoryRegistration) {
        let entity_name = registration.entity_name.clone();
        let mut state = lock(&self.state);
        if state.registrations.insert(entity_name.clone(), registration).is_some() {
            let dropped = state.remove_entity(&entity_name);
            warn!(entity = %entity_name, dropped, "Overwriting existing repository registration");
        } else {
            debug!(entity = %entity_name, "Repository registered");
        }
    }

    /// Returns the cached repository for `entity_name` and `options`, building it on a miss.
    ///
    /// # Errors
    ///
    /// * `Internal(REPOSITORY_NOT_REGISTERED)` for an unknown entity
    /// * `Internal(REPOSITORY_TYPE_MISMATCH)` when the registration uses a different mapper than `M`
    /// * whatever the repository constructor reports
    pub fn create<M: EntityMapper>(
        &self,
        entity_name: &str,
        options: Option<&RepositoryOptionsOverride>,
    ) -> RepositoryResult<Arc<BaseRepository<M>>> {
        let repository = self.resolve(entity_name, options, true)?;
        downcast(entity_name, repository)
    }

    /// Builds a new, unshared repository without touching the cache.
    pub fn create_transient<M: EntityMapper>(
        &self,
        entity_name: &str,
        options: Option<&RepositoryOptionsOverride>,
    ) -> RepositoryResult<Arc<BaseRepository<M>>> {
        let repository = self.resolve(entity_name, options, false)?;
        downcast(entity_name, repository)
    }

    fn resolve(
        &self,
        entity_name: &str,
        options: Option<&RepositoryOptionsOverride>,
        use_cache: bool,
    ) -> RepositoryResult<Arc<dyn ManagedRepository>> {
        let caching = use_cache && self.config.cache.enabled && self.config.cache.max_size > 0;
        let cache_key = cache_key(entity_name, options)?;

        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if caching {
            let sequence = state.next_sequence();
            let ttl = self.config.cache.ttl();
            match state.cache.get_mut(&cache_key) {
                Some(entry) if !entry.is_expired(ttl) => {
                    entry.last_access = Instant::now();
                    entry.sequence = sequence;
                    entry.metadata.last_accessed = Utc::now();
                    entry.metadata.access_count += 1;
                    state.cache_hits += 1;
                    debug!(cache_key = %cache_key, "Repository cache hit");
                    return Ok(Arc::clone(&entry.repository));
                }
                Some(_) => {
                    state.cache.remove(&cache_key);
                    debug!(cache_key = %cache_key, "Repository cache entry expired");
                }
                None => {}
            }
            state.cache_misses += 1;
        }

        let registration = state.registrations.get(entity_name).ok_or_else(|| {
            RepositoryError::internal(
                InternalCode::RepositoryNotRegistered,
                format!("No repository registered for entity '{}'", entity_name),
            )
        })?;
        let resolved = self
            .config
            .default_options
            .merged(registration.options.as_ref())
            .merged(options);
        let repository = (registration.constructor)(resolved.clone(), &self.context)?;

        if caching {
            if state.cache.len() >= self.config.cache.max_size {
                state.evict_lru();
            }
            let now = Utc::now();
            let metadata = RepositoryMetadata {
                cache_key: cache_key.clone(),
                entity_name: entity_name.to_string(),
                repository_type: repository.repository_type().to_string(),
                created_at: now,
                last_accessed: now,
                access_count: 1,
                options: resolved,
            };
            let sequence = state.next_sequence();
            state.cache.insert(
                cache_key.clone(),
                CachedRepository {
                    repository: Arc::clone(&repository),
                    metadata,
                    last_access: Instant::now(),
                    sequence,
                },
            );
            debug!(cache_key = %cache_key, "Repository cached");
        } else {
            debug!(entity = %entity_name, "Transient repository created");
        }

        Ok(repository)
    }

    /// Removes cached repositories of one entity, or all of them.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn clear_cache(&self, entity_name: Option<&str>) -> usize {
        let mut state = lock(&self.state);
        let removed = match entity_name {
            Some(name) => state.remove_entity(name),
            None => {
                let count = state.cache.len();
                state.cache.clear();
                count
            }
        };
        debug!(entity = ?entity_name, removed, "Repository cache cleared");
        removed
    }

    /// Evicts every entry not accessed within the cache TTL.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn cleanup_expired_cache(&self) -> usize {
        let ttl = self.config.cache.ttl();
        let mut state = lock(&self.state);
        let before = state.cache.len();
        state.cache.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before - state.cache.len();
        if removed > 0 {
            debug!(removed, "Cleaned up expired repository cache entries");
        }
        removed
    }

    /// Removes a registration and its cached repositories.
    pub fn unregister(&self, entity_name: &str) -> RepositoryResult<()> {
        let mut state = lock(&self.state);
        if state.registrations.remove(entity_name).is_none() {
            return Err(RepositoryError::internal(
                InternalCode::RepositoryNotRegistered,
                format!("No repository registered for entity '{}'", entity_name),
            ));
        }
        let dropped = state.remove_entity(entity_name);
        info!(entity = %entity_name, dropped, "Repository unregistered");
        Ok(())
    }

    pub fn get_stats(&self) -> FactoryStats {
        let state = lock(&self.state);
        let lookups = state.cache_hits + state.cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            state.cache_hits as f64 / lookups as f64 * 100.0
        };
        let mut repositories: Vec<RepositoryMetadata> =
            state.cache.values().map(|entry| entry.metadata.clone()).collect();
        repositories.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));

        FactoryStats {
            registered_repositories: state.registrations.len(),
            cached_repositories: state.cache.len(),
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            cache_hit_rate,
            repositories,
        }
    }

    /// Registered entity names, sorted.
    pub fn get_registered_repositories(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).registrations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_registered(&self, entity_name: &str) -> bool {
        lock(&self.state).registrations.contains_key(entity_name)
    }

    pub fn get_config(&self) -> &RepositoryFactoryConfig {
        &self.config
    }
}

/// Runs [`RepositoryFactory::cleanup_expired_cache`] every `period` until the task is aborted.
pub fn spawn_cache_cleanup(factory: Arc<RepositoryFactory>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            factory.cleanup_expired_cache();
        }
    })
}

fn cache_key(entity_name: &str, options: Option<&RepositoryOptionsOverride>) -> RepositoryResult<String> {
    match options.filter(|options| !options.is_empty()) {
        Some(options) => Ok(format!("{}:{}", entity_name, serde_json::to_string(options)?)),
        None => Ok(format!("{}:default", entity_name)),
    }
}

fn downcast<M: EntityMapper>(
    entity_name: &str,
    repository: Arc<dyn ManagedRepository>,
) -> RepositoryResult<Arc<BaseRepository<M>>> {
    let actual = repository.repository_type();
    repository.into_any().downcast::<BaseRepository<M>>().map_err(|_| {
        RepositoryError::internal(
            InternalCode::RepositoryTypeMismatch,
            format!(
                "Repository for '{}' is built with {}, not {}",
                entity_name,
                actual,
                std::any::type_name::<M>()
            ),
        )
    })
}
