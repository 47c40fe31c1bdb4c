//! Repository for device registrations
//!
//! Stores push-notification registration tokens per user and device on top
//! of [`BaseRepository`]. Registrations are soft-deletable; the table keeps a
//! `UNIQUE(user_id, device_id)` constraint as the authoritative guard
//! against duplicate registrations.

use crate::client::DbClient;
use crate::entity::{Entity, EntityMapper};
use crate::error::DbError;
use crate::factory::RepositoryRegistration;
use crate::query::{QueryCondition, QueryOptions, SortOption};
use crate::record::{timestamp_value, Record, RecordExt, TableDef};
use crate::repository::BaseRepository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_common::{FieldError, RepositoryResult};
use tracing::{debug, info};
use uuid::Uuid;

/// Entity name used for the factory registration.
pub const ENTITY_NAME: &str = "DeviceRegistration";

pub const TABLE_NAME: &str = "device_registrations";

const MAX_TOKEN_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub registration_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRegistration {
    /// A new registration with a random UUID v4 id.
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        registration_token: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            registration_token: registration_token.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the token and bumps `updated_at`.
    pub fn with_token(mut self, registration_token: impl Into<String>) -> Self {
        self.registration_token = registration_token.into();
        self.updated_at = Utc::now().max(self.updated_at);
        self
    }
}

impl Entity for DeviceRegistration {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceRegistrationMapper;

impl DeviceRegistrationMapper {
    fn validate(&self, registration: &DeviceRegistration) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("id", &registration.id),
            ("user_id", &registration.user_id),
            ("device_id", &registration.device_id),
            ("registration_token", &registration.registration_token),
        ] {
            if value.trim().is_empty() {
                errors.push(FieldError::new(field, "is required"));
            }
        }
        if registration.registration_token.len() > MAX_TOKEN_LENGTH {
            errors.push(FieldError::new(
                "registration_token",
                format!("must be at most {} characters", MAX_TOKEN_LENGTH),
            ));
        }
        errors
    }
}

impl EntityMapper for DeviceRegistrationMapper {
    type Entity = DeviceRegistration;

    fn to_domain(&self, record: Record) -> RepositoryResult<DeviceRegistration> {
        Ok(DeviceRegistration {
            id: record.text("id")?,
            user_id: record.text("user_id")?,
            device_id: record.text("device_id")?,
            registration_token: record.text("registration_token")?,
            created_at: record.timestamp("created_at")?,
            updated_at: record.timestamp("updated_at")?,
        })
    }

    fn to_persistence(&self, registration: &DeviceRegistration) -> RepositoryResult<Record> {
        let mut record = Record::new();
        record.insert("id".into(), Value::String(registration.id.clone()));
        record.insert("user_id".into(), Value::String(registration.user_id.clone()));
        record.insert("device_id".into(), Value::String(registration.device_id.clone()));
        record.insert(
            "registration_token".into(),
            Value::String(registration.registration_token.clone()),
        );
        record.insert("created_at".into(), timestamp_value(&registration.created_at));
        record.insert("updated_at".into(), timestamp_value(&registration.updated_at));
        Ok(record)
    }

    fn validate_for_create(&self, registration: &DeviceRegistration) -> Vec<FieldError> {
        self.validate(registration)
    }

    fn validate_for_update(&self, registration: &DeviceRegistration) -> Vec<FieldError> {
        self.validate(registration)
    }
}

/// The `device_registrations` table handle.
pub fn device_registrations_table() -> TableDef {
    TableDef::new(
        TABLE_NAME,
        [
            "id",
            "user_id",
            "device_id",
            "registration_token",
            "created_at",
            "updated_at",
        ],
    )
    .with_tombstone("deleted_at")
}

/// Creates the `device_registrations` table if it doesn't exist.
pub async fn init_schema(client: &DbClient) -> Result<(), DbError> {
    debug!("Initializing device registration schema");

    let query = r#"
        CREATE TABLE IF NOT EXISTS device_registrations (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            registration_token TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
    "#;
    client.execute(query).await?;

    // Only live rows claim a (user, device) pair; tombstones keep their history
    client
        .execute(
            r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_device_registrations_live_device
            ON device_registrations(user_id, device_id)
            WHERE deleted_at IS NULL
    "#,
        )
        .await?;

    info!("Device registration schema initialized successfully");
    Ok(())
}

/// Factory registration for device registrations.
pub fn registration() -> RepositoryRegistration {
    RepositoryRegistration::new(ENTITY_NAME, device_registrations_table(), || DeviceRegistrationMapper)
}

pub type DeviceRegistrationRepository = BaseRepository<DeviceRegistrationMapper>;

impl BaseRepository<DeviceRegistrationMapper> {
    /// Live registrations of a user, oldest first.
    pub async fn find_by_user(&self, user_id: &str) -> RepositoryResult<Vec<DeviceRegistration>> {
        debug!("Finding all device registrations for user: {}", user_id);
        let options = QueryOptions::new()
            .filter(QueryCondition::eq("user_id", user_id))
            .sort_by(SortOption::asc("created_at"));
        self.find_all(&options).await
    }

    pub async fn find_by_user_and_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> RepositoryResult<Option<DeviceRegistration>> {
        debug!(user_id, device_id, "Finding device registration");
        let options = QueryOptions::new()
            .filter(QueryCondition::eq("user_id", user_id))
            .filter(QueryCondition::eq("device_id", device_id))
            .paginate(1, 1);
        Ok(self.find_all(&options).await?.pop())
    }

    /// Stores a registration, refreshing the token when the device is already registered.
    pub async fn register_device(&self, registration: DeviceRegistration) -> RepositoryResult<DeviceRegistration> {
        debug!("Registering device for user: {}", registration.user_id);
        match self
            .find_by_user_and_device(&registration.user_id, &registration.device_id)
            .await?
        {
            Some(existing) => self.update(existing.with_token(registration.registration_token)).await,
            None => self.create(registration).await,
        }
    }
}
