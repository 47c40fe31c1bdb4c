//! Shared building blocks for the Strata workspace: the repository error
//! taxonomy and the tracing bootstrap.

pub mod error; // Error taxonomy
pub mod logging; // Logging utilities

// Re-export error types for easier access
pub use error::{
    ConflictCode, ErrorKind, FieldError, InternalCode, NotFoundCode, RepositoryError, Severity,
    ValidationCode,
};

// Re-export logging utilities for easier access
pub use logging::{init, init_from_config, init_with_level, log_error, log_result};

/// Result alias used by every repository and factory operation.
pub type RepositoryResult<T> = Result<T, RepositoryError>;
