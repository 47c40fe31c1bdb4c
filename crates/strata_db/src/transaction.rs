//! Transaction boundary.
//!
//! [`TransactionManager::execute_transaction`] runs a unit of work on one
//! store transaction: it commits when the work returns `Ok` and rolls back
//! when it returns `Err`. Nested boundaries are not supported; work must use
//! the handle it is given and never the pool.

use crate::client::{DbClient, DbTransaction};
use crate::error::DbError;
use crate::sync::lock;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use strata_common::{InternalCode, RepositoryError};
use tracing::{debug, error, warn};

/// Type alias for a boxed future that returns a Result
pub type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Lifetime counters of a [`TransactionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Begin or commit failures.
    pub failed: u64,
}

#[derive(Debug)]
pub struct TransactionManager {
    client: DbClient,
    counter: AtomicU64,
    stats: Mutex<TransactionStats>,
}

impl TransactionManager {
    pub fn new(client: DbClient) -> Self {
        Self {
            client,
            counter: AtomicU64::new(0),
            stats: Mutex::new(TransactionStats::default()),
        }
    }

    /// Executes `work` atomically.
    ///
    /// An error returned by `work` is passed through with its kind intact
    /// after the rollback. Failing to begin or commit yields
    /// `Internal(TRANSACTION_FAILED)`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use strata_db::{DbClient, TransactionManager};
    /// # async fn demo(client: DbClient) -> Result<(), strata_common::RepositoryError> {
    /// let transactions = TransactionManager::new(client);
    /// let inserted = transactions
    ///     .execute_transaction(|tx| {
    ///         Box::pin(async move {
    ///             let done = sqlx::query("INSERT INTO audit_log (entry) VALUES ('boot')")
    ///                 .execute(&mut **tx)
    ///                 .await
    ///                 .map_err(strata_db::error::from_sqlx)?;
    ///             Ok(done.rows_affected())
    ///         })
    ///     })
    ///     .await?;
    /// assert_eq!(inserted, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_transaction<T, F>(&self, work: F) -> Result<T, RepositoryError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut DbTransaction) -> BoxFuture<'t, T, RepositoryError> + Send,
    {
        let tx_id = format!("tx-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);

        let mut tx = match self.client.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                lock(&self.stats).failed += 1;
                error!(tx_id = %tx_id, "Failed to begin transaction: {}", e);
                return Err(RepositoryError::from(e).recode_internal(InternalCode::TransactionFailed));
            }
        };
        lock(&self.stats).started += 1;
        debug!(tx_id = %tx_id, "Transaction started");

        match work(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    lock(&self.stats).committed += 1;
                    debug!(tx_id = %tx_id, "Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    lock(&self.stats).failed += 1;
                    error!(tx_id = %tx_id, "Failed to commit transaction: {}", e);
                    Err(RepositoryError::internal_with_source(
                        InternalCode::TransactionFailed,
                        format!("Failed to commit transaction {}: {}", tx_id, e),
                        DbError::SqlxError(e),
                    ))
                }
            },
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(tx_id = %tx_id, "Rollback failed: {}", e);
                }
                lock(&self.stats).rolled_back += 1;
                debug!(tx_id = %tx_id, code = err.code(), "Transaction rolled back");
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> TransactionStats {
        *lock(&self.stats)
    }
}
