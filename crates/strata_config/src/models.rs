use serde::{Deserialize, Serialize};
use std::time::Duration;

// --- Database Config ---
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String, // e.g. sqlite:data/strata.db, loaded via STRATA__DATABASE__URL
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    3
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

// --- Repository Options ---
// Resolved per-repository behaviour. Immutable once a repository is built.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub auditing: bool,
    #[serde(default)]
    pub caching: bool,
    #[serde(default = "default_entity_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_entity_cache_max_entries")]
    pub cache_max_entries: usize,
}

fn default_entity_cache_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_entity_cache_max_entries() -> usize {
    1_000
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            soft_delete: false,
            auditing: false,
            caching: false,
            cache_ttl_ms: default_entity_cache_ttl_ms(),
            cache_max_entries: default_entity_cache_max_entries(),
        }
    }
}

impl RepositoryOptions {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Applies an override layer; fields set in `layer` win.
    pub fn merged(&self, layer: Option<&RepositoryOptionsOverride>) -> RepositoryOptions {
        let Some(layer) = layer else {
            return self.clone();
        };
        RepositoryOptions {
            soft_delete: layer.soft_delete.unwrap_or(self.soft_delete),
            auditing: layer.auditing.unwrap_or(self.auditing),
            caching: layer.caching.unwrap_or(self.caching),
            cache_ttl_ms: layer.cache_ttl_ms.unwrap_or(self.cache_ttl_ms),
            cache_max_entries: layer.cache_max_entries.unwrap_or(self.cache_max_entries),
        }
    }
}

// Partial options, used for registration defaults and call-site options.
// Serialized form doubles as the factory cache key, so unset fields are skipped.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct RepositoryOptionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_delete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auditing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_max_entries: Option<usize>,
}

impl RepositoryOptionsOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = Some(enabled);
        self
    }

    pub fn auditing(mut self, enabled: bool) -> Self {
        self.auditing = Some(enabled);
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.caching = Some(enabled);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn cache_max_entries(mut self, max_entries: usize) -> Self {
        self.cache_max_entries = Some(max_entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.soft_delete.is_none()
            && self.auditing.is_none()
            && self.caching.is_none()
            && self.cache_ttl_ms.is_none()
            && self.cache_max_entries.is_none()
    }
}

// --- Repository Factory Config ---
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_factory_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_factory_cache_ttl_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_max_size() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_factory_cache_ttl_ms(),
            max_size: default_max_size(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
}

fn default_slow_query_threshold_ms() -> u64 {
    1_000
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
        }
    }
}

impl MonitoringConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct RepositoryFactoryConfig {
    #[serde(default)]
    pub default_options: RepositoryOptions,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

// --- Logging Config ---
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// --- Unified App Configuration ---
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    // Optional so that a process can start without a store and attach one later
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub repository: RepositoryFactoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}
