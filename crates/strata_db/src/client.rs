//! Store client for Strata
//!
//! Owns the SQLite connection pool that every repository, the query engine
//! and the transaction manager share.

use crate::error::DbError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strata_config::{AppConfig, DatabaseConfig};
use tracing::{debug, error, info};

/// A transaction borrowed from the pool for its whole lifetime.
pub type DbTransaction = Transaction<'static, Sqlite>;

/// Cloning is cheap; clones share the same pool.
#[derive(Debug, Clone)]
pub struct DbClient {
    pool: SqlitePool,
}

impl DbClient {
    /// Connects using the `database` section of the application configuration.
    ///
    /// # Errors
    ///
    /// * [`DbError::ConfigError`] when the section is absent or its URL is empty
    /// * [`DbError::UrlError`] for a URL SQLite cannot parse
    /// * [`DbError::PoolError`] when the first connection fails
    pub async fn new(config: &Arc<AppConfig>) -> Result<Self, DbError> {
        let db_config = config
            .database
            .as_ref()
            .ok_or_else(|| DbError::ConfigError("Database configuration is missing".to_string()))?;

        Self::from_config(db_config).await
    }

    /// Connects with the pool limits of `db_config`.
    pub async fn from_config(db_config: &DatabaseConfig) -> Result<Self, DbError> {
        if db_config.url.is_empty() {
            return Err(DbError::ConfigError("Database URL is empty".to_string()));
        }

        let pool = Self::create_pool(db_config).await?;
        Ok(Self { pool })
    }

    /// Connects to `db_url` with default pool limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn demo() -> Result<(), strata_db::DbError> {
    /// let client = strata_db::DbClient::from_url("sqlite::memory:").await?;
    /// assert!(client.is_healthy().await);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn from_url(db_url: &str) -> Result<Self, DbError> {
        if db_url.is_empty() {
            return Err(DbError::UrlError("Database URL is empty".to_string()));
        }

        let pool = Self::create_pool(&DatabaseConfig::new(db_url)).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn create_pool(db_config: &DatabaseConfig) -> Result<SqlitePool, DbError> {
        let db_url = db_config.url.as_str();
        debug!(url = db_url, max_connections = db_config.max_connections, "Creating SQLite pool");

        let connect_options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| DbError::UrlError(format!("{}: {}", db_url, e)))?
            .create_if_missing(true);

        let in_memory = is_in_memory(db_url);
        let pool_options = if in_memory {
            // Every connection to :memory: is its own database, so keep exactly one alive
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(db_config.acquire_timeout())
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            ensure_parent_dir(&connect_options.clone().get_filename())?;
            SqlitePoolOptions::new()
                .max_connections(db_config.max_connections.max(1))
                .acquire_timeout(db_config.acquire_timeout())
                .idle_timeout(Duration::from_secs(600))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                error!("Failed to create database pool: {}", e);
                DbError::PoolError(e.to_string())
            })?;

        info!(in_memory, "SQLite pool ready");
        Ok(pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a transaction on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TransactionError`] if no connection could be
    /// acquired or `BEGIN` failed.
    pub async fn begin(&self) -> Result<DbTransaction, DbError> {
        self.pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionError(e.to_string()))
    }

    /// Runs a statement without bind parameters, typically DDL.
    ///
    /// # Returns
    ///
    /// The number of rows affected
    pub async fn execute(&self, statement: &str) -> Result<u64, DbError> {
        sqlx::query(statement)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(DbError::from)
    }

    /// `SELECT 1` probe.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Close the pool; every later operation fails with a closed-pool error.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Display for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbClient(size={}, closed={})", self.pool.size(), self.pool.is_closed())
    }
}

fn is_in_memory(db_url: &str) -> bool {
    db_url.contains(":memory:") || db_url.contains("mode=memory")
}

fn ensure_parent_dir(db_path: &Path) -> Result<(), DbError> {
    let Some(dir) = db_path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }

    debug!("Creating directory for SQLite database: {:?}", dir);
    std::fs::create_dir_all(dir).map_err(|e| {
        error!("Failed to create directory for SQLite database: {}", e);
        DbError::PoolError(format!("Failed to create directory: {}", e))
    })
}
