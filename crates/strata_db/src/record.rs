//! Dynamic rows and table handles.
//!
//! Repositories are generic over the entity type, so rows travel between the
//! store and the entity mappers as [`Record`]s: ordered maps from column name
//! to a JSON scalar. A [`TableDef`] is the opaque handle that names a table,
//! its identifier and tombstone columns, and the columns a query may mention.

use crate::error::DbError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use strata_common::{InternalCode, RepositoryError};

/// One storage row.
pub type Record = BTreeMap<String, Value>;

/// Storage table handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    name: String,
    id_column: String,
    columns: Vec<String>,
    tombstone_column: Option<String>,
}

impl TableDef {
    /// A table with an `id` identifier column and no tombstone column.
    ///
    /// `columns` must list every column, including the identifier.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self {
            name: name.into(),
            id_column: "id".to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            tombstone_column: None,
        };
        table.add_column("id");
        table
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        let id_column = self.id_column.clone();
        self.add_column(&id_column);
        self
    }

    /// Declares the nullable timestamp column set by soft deletes.
    pub fn with_tombstone(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.add_column(&column);
        self.tombstone_column = Some(column);
        self
    }

    fn add_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn tombstone_column(&self) -> Option<&str> {
        self.tombstone_column.as_deref()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Fails with `QUERY_SPECIFICATION_INVALID` for a column the table does not declare.
    pub fn require_column(&self, column: &str) -> Result<(), RepositoryError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(RepositoryError::internal(
                InternalCode::QuerySpecificationInvalid,
                format!("Unknown column '{}' for table '{}'", column, self.name),
            ))
        }
    }
}

/// Double-quotes an identifier for SQLite.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Binds a JSON scalar as a query parameter.
///
/// Arrays and objects are stored as their JSON text.
pub fn push_value(builder: &mut QueryBuilder<'static, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push_bind(Option::<String>::None);
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                builder.push_bind(i);
            } else {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        }
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        Value::Array(_) | Value::Object(_) => {
            builder.push_bind(value.to_string());
        }
    }
}

/// Decodes every column of a row by its storage class.
pub fn decode_row(row: &SqliteRow) -> Result<Record, DbError> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let (is_null, type_name) = {
            let raw = row.try_get_raw(idx)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };

        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => Number::from_f64(row.try_get::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(idx)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get::<String, _>(idx)?),
            }
        };
        record.insert(sqlx::Column::name(column).to_string(), value);
    }
    Ok(record)
}

/// Typed accessors used by entity mappers.
pub trait RecordExt {
    fn text(&self, column: &str) -> Result<String, RepositoryError>;
    fn optional_text(&self, column: &str) -> Result<Option<String>, RepositoryError>;
    fn integer(&self, column: &str) -> Result<i64, RepositoryError>;
    fn boolean(&self, column: &str) -> Result<bool, RepositoryError>;
    fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, RepositoryError>;
}

fn mapping_error(column: &str, expected: &str, value: Option<&Value>) -> RepositoryError {
    RepositoryError::from(DbError::MappingError(format!(
        "column '{}': expected {}, found {}",
        column,
        expected,
        value.map(Value::to_string).unwrap_or_else(|| "nothing".to_string())
    )))
}

impl RecordExt for Record {
    fn text(&self, column: &str) -> Result<String, RepositoryError> {
        match self.get(column) {
            Some(Value::String(s)) => Ok(s.clone()),
            other => Err(mapping_error(column, "text", other)),
        }
    }

    fn optional_text(&self, column: &str) -> Result<Option<String>, RepositoryError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            other => Err(mapping_error(column, "text or null", other)),
        }
    }

    fn integer(&self, column: &str) -> Result<i64, RepositoryError> {
        match self.get(column) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| mapping_error(column, "integer", self.get(column))),
            other => Err(mapping_error(column, "integer", other)),
        }
    }

    fn boolean(&self, column: &str) -> Result<bool, RepositoryError> {
        match self.get(column) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) if n.as_i64() == Some(0) => Ok(false),
            Some(Value::Number(n)) if n.as_i64() == Some(1) => Ok(true),
            other => Err(mapping_error(column, "boolean", other)),
        }
    }

    fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
        let value = self.get(column);
        let Some(Value::String(s)) = value else {
            return Err(mapping_error(column, "timestamp", value));
        };
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
            return Ok(parsed.with_timezone(&Utc));
        }
        // CURRENT_TIMESTAMP defaults are written without an offset
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| mapping_error(column, "timestamp", value))
    }
}

/// Formats a timestamp the way mappers store it.
pub fn timestamp_value(at: &DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> TableDef {
        TableDef::new("widgets", ["name", "quantity"]).with_tombstone("deleted_at")
    }

    #[test]
    fn test_table_def_always_declares_id_and_tombstone() {
        let table = widgets();
        assert_eq!(table.id_column(), "id");
        assert!(table.has_column("id"));
        assert!(table.has_column("deleted_at"));
        assert_eq!(table.tombstone_column(), Some("deleted_at"));
        assert_eq!(table.columns().len(), 4);
    }

    #[test]
    fn test_require_column_rejects_unknown_column() {
        let err = widgets().require_column("colour").expect_err("unknown column");
        assert_eq!(err.code(), "QUERY_SPECIFICATION_INVALID");
        assert!(widgets().require_column("name").is_ok());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_record_accessors() {
        let mut record = Record::new();
        record.insert("name".into(), json!("bolt"));
        record.insert("quantity".into(), json!(3));
        record.insert("active".into(), json!(1));
        record.insert("note".into(), Value::Null);
        record.insert("created_at".into(), json!("2024-05-01T10:00:00+00:00"));
        record.insert("updated_at".into(), json!("2024-05-01 10:00:00"));

        assert_eq!(record.text("name").expect("text"), "bolt");
        assert_eq!(record.integer("quantity").expect("integer"), 3);
        assert!(record.boolean("active").expect("boolean"));
        assert_eq!(record.optional_text("note").expect("optional"), None);
        assert_eq!(
            record.timestamp("created_at").expect("rfc3339"),
            record.timestamp("updated_at").expect("sqlite format")
        );

        let err = record.integer("name").expect_err("wrong type");
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
