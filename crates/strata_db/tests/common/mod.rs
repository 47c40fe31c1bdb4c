// Shared fixtures for the strata-db integration tests
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use strata_common::{FieldError, RepositoryResult};
use strata_config::{MonitoringConfig, RepositoryOptions};
use strata_db::record::timestamp_value;
use strata_db::{BaseRepository, DbClient, Entity, EntityMapper, Record, RecordExt, RepositoryContext, TableDef};

pub const WIDGET: &str = "Widget";

pub const WIDGETS_SCHEMA: &str = r#"
    CREATE TABLE widgets (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL UNIQUE,
        quantity INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT
    )
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    pub id: i64,
    pub name: String,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Widget {
    type Id = i64;

    fn id(&self) -> &i64 {
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
pub struct WidgetMapper;

impl WidgetMapper {
    fn validate(&self, widget: &Widget) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if widget.name.trim().is_empty() {
            errors.push(FieldError::new("name", "is required"));
        }
        if widget.quantity < 0 {
            errors.push(FieldError::new("quantity", "must not be negative"));
        }
        errors
    }
}

impl EntityMapper for WidgetMapper {
    type Entity = Widget;

    fn to_domain(&self, record: Record) -> RepositoryResult<Widget> {
        Ok(Widget {
            id: record.integer("id")?,
            name: record.text("name")?,
            quantity: record.integer("quantity")?,
            created_at: record.timestamp("created_at")?,
            updated_at: record.timestamp("updated_at")?,
        })
    }

    fn to_persistence(&self, widget: &Widget) -> RepositoryResult<Record> {
        let mut record = Record::new();
        record.insert("id".into(), Value::from(widget.id));
        record.insert("name".into(), Value::from(widget.name.clone()));
        record.insert("quantity".into(), Value::from(widget.quantity));
        record.insert("created_at".into(), timestamp_value(&widget.created_at));
        record.insert("updated_at".into(), timestamp_value(&widget.updated_at));
        Ok(record)
    }

    fn validate_for_create(&self, widget: &Widget) -> Vec<FieldError> {
        self.validate(widget)
    }

    fn validate_for_update(&self, widget: &Widget) -> Vec<FieldError> {
        self.validate(widget)
    }
}

pub fn widgets_table() -> TableDef {
    TableDef::new("widgets", ["id", "name", "quantity", "created_at", "updated_at"]).with_tombstone("deleted_at")
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn widget(id: i64, name: &str) -> Widget {
    let at = epoch() + Duration::seconds(id);
    Widget {
        id,
        name: name.to_string(),
        quantity: id * 10,
        created_at: at,
        updated_at: at,
    }
}

/// A widget that fails validation.
pub fn invalid_widget(id: i64) -> Widget {
    Widget {
        name: String::new(),
        ..widget(id, "invalid")
    }
}

pub async fn setup_client() -> DbClient {
    strata_common::logging::init_with_level(tracing::Level::DEBUG);
    let client = DbClient::from_url("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    client
        .execute(WIDGETS_SCHEMA)
        .await
        .expect("Failed to create widgets table");
    client
}

pub fn context(client: &DbClient) -> RepositoryContext {
    RepositoryContext::new(client.clone(), MonitoringConfig::default())
}

pub fn widget_repository(client: &DbClient, options: RepositoryOptions) -> BaseRepository<WidgetMapper> {
    BaseRepository::new(WIDGET, widgets_table(), WidgetMapper, options, &context(client))
        .expect("Failed to build widget repository")
}

pub fn soft_delete_options() -> RepositoryOptions {
    RepositoryOptions {
        soft_delete: true,
        ..RepositoryOptions::default()
    }
}
