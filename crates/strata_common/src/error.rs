//! Error taxonomy shared by every Strata crate.
//!
//! Repository and factory operations never panic or raise; they return a
//! [`RepositoryError`] whose kind tells the caller what went wrong and whose
//! [`RepositoryError::is_retryable`] tells it whether trying again can help.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Boxed error used as the source of internal failures.
pub type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// How loudly an error should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// The four kinds of failure a repository operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

/// Codes for [`RepositoryError::Validation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    RequiredField,
    InvalidFormat,
    InvalidLength,
    InvalidValue,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::RequiredField => "REQUIRED_FIELD",
            ValidationCode::InvalidFormat => "INVALID_FORMAT",
            ValidationCode::InvalidLength => "INVALID_LENGTH",
            ValidationCode::InvalidValue => "INVALID_VALUE",
        }
    }
}

/// Codes for [`RepositoryError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotFoundCode {
    EntityNotFound,
    ResourceNotFound,
}

impl NotFoundCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotFoundCode::EntityNotFound => "ENTITY_NOT_FOUND",
            NotFoundCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
        }
    }
}

/// Codes for [`RepositoryError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictCode {
    /// Application-level existence check found the id already present.
    EntityAlreadyExists,
    /// The store rejected a write because of a unique constraint.
    UniqueConstraintViolation,
    ConcurrentModification,
    /// The caller's copy is older than the stored one.
    StaleEntity,
    LockConflict,
}

impl ConflictCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCode::EntityAlreadyExists => "ENTITY_ALREADY_EXISTS",
            ConflictCode::UniqueConstraintViolation => "UNIQUE_CONSTRAINT_VIOLATION",
            ConflictCode::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ConflictCode::StaleEntity => "STALE_ENTITY",
            ConflictCode::LockConflict => "LOCK_CONFLICT",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConflictCode::ConcurrentModification
                | ConflictCode::StaleEntity
                | ConflictCode::LockConflict
        )
    }
}

/// Codes for [`RepositoryError::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalCode {
    DatabaseError,
    NetworkError,
    TimeoutError,
    ConfigurationError,
    SerializationError,
    ExternalServiceError,
    TransactionFailed,
    QuerySpecificationInvalid,
    RepositoryNotRegistered,
    RepositoryTypeMismatch,
}

impl InternalCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalCode::DatabaseError => "DATABASE_ERROR",
            InternalCode::NetworkError => "NETWORK_ERROR",
            InternalCode::TimeoutError => "TIMEOUT_ERROR",
            InternalCode::ConfigurationError => "CONFIGURATION_ERROR",
            InternalCode::SerializationError => "SERIALIZATION_ERROR",
            InternalCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            InternalCode::TransactionFailed => "TRANSACTION_FAILED",
            InternalCode::QuerySpecificationInvalid => "QUERY_SPECIFICATION_INVALID",
            InternalCode::RepositoryNotRegistered => "REPOSITORY_NOT_REGISTERED",
            InternalCode::RepositoryTypeMismatch => "REPOSITORY_TYPE_MISMATCH",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            InternalCode::NetworkError
                | InternalCode::TimeoutError
                | InternalCode::ExternalServiceError
        )
    }
}

/// A single failed field check produced by an entity validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The error type returned by every repository and factory operation.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Bad input shape or value. Never touches storage.
    #[error("Validation error: {message}")]
    Validation {
        code: ValidationCode,
        message: String,
        fields: Vec<FieldError>,
    },

    /// The addressed resource does not exist.
    #[error("Not found: {message}")]
    NotFound { code: NotFoundCode, message: String },

    /// Duplicate or concurrent modification.
    #[error("Conflict: {message}")]
    Conflict { code: ConflictCode, message: String },

    /// Unexpected failure, usually a wrapped store or driver error.
    #[error("Internal error: {message}")]
    Internal {
        code: InternalCode,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl RepositoryError {
    /// Builds a validation error out of the field errors a validator returned.
    ///
    /// Uses `INVALID_VALUE`; callers that need a specific code use
    /// [`RepositoryError::validation_with_code`].
    pub fn validation(fields: Vec<FieldError>) -> Self {
        Self::validation_with_code(ValidationCode::InvalidValue, fields)
    }

    pub fn validation_with_code(code: ValidationCode, fields: Vec<FieldError>) -> Self {
        let message = fields
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        RepositoryError::Validation {
            code,
            message,
            fields,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RepositoryError::NotFound {
            code: NotFoundCode::EntityNotFound,
            message: message.into(),
        }
    }

    pub fn conflict(code: ConflictCode, message: impl Into<String>) -> Self {
        RepositoryError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: InternalCode, message: impl Into<String>) -> Self {
        RepositoryError::Internal {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source<E>(code: InternalCode, message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        RepositoryError::Internal {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::Validation { .. } => ErrorKind::Validation,
            RepositoryError::NotFound { .. } => ErrorKind::NotFound,
            RepositoryError::Conflict { .. } => ErrorKind::Conflict,
            RepositoryError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code, e.g. `ENTITY_NOT_FOUND`.
    pub fn code(&self) -> &'static str {
        match self {
            RepositoryError::Validation { code, .. } => code.as_str(),
            RepositoryError::NotFound { code, .. } => code.as_str(),
            RepositoryError::Conflict { code, .. } => code.as_str(),
            RepositoryError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RepositoryError::Validation { message, .. }
            | RepositoryError::NotFound { message, .. }
            | RepositoryError::Conflict { message, .. }
            | RepositoryError::Internal { message, .. } => message,
        }
    }

    /// Field errors of a validation failure; empty for every other kind.
    pub fn fields(&self) -> &[FieldError] {
        match self {
            RepositoryError::Validation { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RepositoryError::Internal { .. } => Severity::Error,
            _ => Severity::Warning,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Validation { .. } | RepositoryError::NotFound { .. } => false,
            RepositoryError::Conflict { code, .. } => code.is_retryable(),
            RepositoryError::Internal { code, .. } => code.is_retryable(),
        }
    }

    /// Returns a copy of this error with a new internal code, keeping message and source.
    ///
    /// Non-internal kinds are returned unchanged.
    pub fn recode_internal(self, new_code: InternalCode) -> Self {
        match self {
            RepositoryError::Internal {
                message, source, ..
            } => RepositoryError::Internal {
                code: new_code,
                message,
                source,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        let message = format!("Serialization failed: {}", err);
        RepositoryError::internal_with_source(InternalCode::SerializationError, message, err)
    }
}
