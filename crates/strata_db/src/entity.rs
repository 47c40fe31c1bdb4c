//! Entity and mapper contracts.

use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use strata_common::{FieldError, RepositoryError};

/// Identity and timestamps shared by every persisted domain object.
///
/// The identifier is chosen by the caller (or by the entity's own
/// constructor) and never changes once the entity has been created.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    type Id: Clone + Debug + PartialEq + Serialize + Send + Sync + 'static;

    fn id(&self) -> &Self::Id;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
}

/// Converts between an entity and its storage row, and validates it.
///
/// Each concrete repository supplies one mapper; the base repository never
/// looks inside an entity except through this trait and [`Entity`].
pub trait EntityMapper: Send + Sync + 'static {
    type Entity: Entity;

    fn to_domain(&self, record: Record) -> Result<Self::Entity, RepositoryError>;

    /// Must include the identifier column.
    fn to_persistence(&self, entity: &Self::Entity) -> Result<Record, RepositoryError>;

    /// An empty list means the entity may be inserted.
    fn validate_for_create(&self, entity: &Self::Entity) -> Vec<FieldError>;

    fn validate_for_update(&self, entity: &Self::Entity) -> Vec<FieldError>;
}

/// Converts an identifier into a bindable JSON scalar.
pub fn id_to_value<I: Serialize>(id: &I) -> Result<Value, RepositoryError> {
    Ok(serde_json::to_value(id)?)
}

/// Renders an identifier for log fields and error messages.
pub(crate) fn id_to_string<I: Serialize + Debug>(id: &I) -> String {
    match serde_json::to_value(id) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => format!("{:?}", id),
    }
}
