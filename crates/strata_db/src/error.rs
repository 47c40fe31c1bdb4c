//! Error types for the store client
//!
//! [`DbError`] is what the client and the SQL helpers produce; every
//! repository operation converts it into a [`RepositoryError`] at the
//! operation boundary.

use sqlx::error::DatabaseError;
use strata_common::{ConflictCode, InternalCode, RepositoryError};
use thiserror::Error;

// SQLite primary result codes (low byte of the extended code)
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
// SQLite extended codes for UNIQUE and PRIMARY KEY constraint failures
const SQLITE_CONSTRAINT_UNIQUE: i64 = 2067;
const SQLITE_CONSTRAINT_PRIMARYKEY: i64 = 1555;

/// Errors that can occur when working with the store client
#[derive(Debug, Error)]
pub enum DbError {
    /// Error from SQLx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Error with the database configuration
    #[error("Database configuration error: {0}")]
    ConfigError(String),

    /// Error with database URL parsing
    #[error("Database URL error: {0}")]
    UrlError(String),

    /// Error with database pool creation
    #[error("Database pool error: {0}")]
    PoolError(String),

    /// Error with database transaction
    #[error("Database transaction error: {0}")]
    TransactionError(String),

    /// A row could not be converted to or from its domain form
    #[error("Row mapping error: {0}")]
    MappingError(String),
}

impl DbError {
    /// Whether the store rejected a write because of a UNIQUE or PRIMARY KEY constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::SqlxError(sqlx::Error::Database(db)) => is_unique_violation(db.as_ref()),
            _ => false,
        }
    }
}

fn extended_code(db: &dyn DatabaseError) -> Option<i64> {
    db.code().and_then(|code| code.parse::<i64>().ok())
}

fn is_unique_violation(db: &dyn DatabaseError) -> bool {
    if db.is_unique_violation() {
        return true;
    }
    match extended_code(db) {
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY) => true,
        _ => db.message().contains("UNIQUE constraint failed"),
    }
}

fn is_lock_conflict(db: &dyn DatabaseError) -> bool {
    matches!(
        extended_code(db).map(|code| code & 0xff),
        Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)
    )
}

impl From<DbError> for RepositoryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::SqlxError(sqlx_err) => from_sqlx(sqlx_err),
            DbError::ConfigError(_) | DbError::UrlError(_) => {
                let message = err.to_string();
                RepositoryError::internal_with_source(InternalCode::ConfigurationError, message, err)
            }
            DbError::PoolError(_) => {
                let message = err.to_string();
                RepositoryError::internal_with_source(InternalCode::DatabaseError, message, err)
            }
            DbError::TransactionError(_) => {
                let message = err.to_string();
                RepositoryError::internal_with_source(InternalCode::TransactionFailed, message, err)
            }
            DbError::MappingError(_) => {
                let message = err.to_string();
                RepositoryError::internal_with_source(InternalCode::SerializationError, message, err)
            }
        }
    }
}

/// Classifies a driver error into the repository error taxonomy.
pub fn from_sqlx(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if is_unique_violation(db.as_ref()) {
            return RepositoryError::conflict(
                ConflictCode::UniqueConstraintViolation,
                db.message().to_string(),
            );
        }
        if is_lock_conflict(db.as_ref()) {
            return RepositoryError::conflict(ConflictCode::LockConflict, db.message().to_string());
        }
    }

    let code = match &err {
        sqlx::Error::PoolTimedOut => InternalCode::TimeoutError,
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
            InternalCode::NetworkError
        }
        sqlx::Error::Configuration(_) => InternalCode::ConfigurationError,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            InternalCode::SerializationError
        }
        _ => InternalCode::DatabaseError,
    };
    let message = format!("Database error: {}", err);
    RepositoryError::internal_with_source(code, message, DbError::SqlxError(err))
}
