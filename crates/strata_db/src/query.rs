//! Query specification and the engine that turns it into SQL.
//!
//! A [`QueryOptions`] value describes filters, sort order, pagination and
//! projection declaratively. [`QueryEngine`] validates it against a
//! [`TableDef`] and runs it with bound parameters only; a specification that
//! mentions an unknown column or carries a malformed operand is rejected as a
//! whole with `QUERY_SPECIFICATION_INVALID` before any SQL is sent.

use crate::client::DbClient;
use crate::error::from_sqlx;
use crate::record::{decode_row, push_value, quote_ident, Record, TableDef};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;
use strata_common::{FieldError, InternalCode, RepositoryError, ValidationCode};
use strata_config::MonitoringConfig;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    /// Case-insensitive `Like`; both sides are lower-cased.
    ILike,
    IsNull,
    IsNotNull,
    In,
    NotIn,
}

impl QueryOperator {
    fn comparison(&self) -> Option<&'static str> {
        match self {
            QueryOperator::Equals => Some(" = "),
            QueryOperator::NotEquals => Some(" <> "),
            QueryOperator::GreaterThan => Some(" > "),
            QueryOperator::GreaterThanOrEqual => Some(" >= "),
            QueryOperator::LessThan => Some(" < "),
            QueryOperator::LessThanOrEqual => Some(" <= "),
            QueryOperator::Like => Some(" LIKE "),
            _ => None,
        }
    }
}

/// How a condition joins the ones before it.
///
/// A single `Or` anywhere turns the whole group into a disjunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connector {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCondition {
    pub column: String,
    pub operator: QueryOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub connector: Connector,
}

impl QueryCondition {
    pub fn new(column: impl Into<String>, operator: QueryOperator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            connector: Connector::And,
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, QueryOperator::Equals, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, QueryOperator::IsNull, Value::Null)
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, QueryOperator::In, Value::Array(values))
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, QueryOperator::ILike, Value::String(pattern.into()))
    }

    pub fn or(mut self) -> Self {
        self.connector = Connector::Or;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOption {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortOption {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationOptions {
    pub page: u32,
    pub limit: u32,
}

impl PaginationOptions {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    fn validate(&self) -> Result<(), RepositoryError> {
        let mut fields = Vec::new();
        if self.page == 0 {
            fields.push(FieldError::new("page", "must be at least 1"));
        }
        if self.limit == 0 {
            fields.push(FieldError::new("limit", "must be at least 1"));
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(RepositoryError::validation_with_code(ValidationCode::InvalidValue, fields))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,
    #[serde(default)]
    pub sort: Vec<SortOption>,
    #[serde(default)]
    pub pagination: Option<PaginationOptions>,
    /// Projection; `None` selects every declared column.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Also return rows whose tombstone column is set.
    #[serde(default)]
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: QueryCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn sort_by(mut self, sort: SortOption) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn paginate(mut self, page: u32, limit: u32) -> Self {
        self.pagination = Some(PaginationOptions::new(page, limit));
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PageInfo {
    pub fn new(pagination: PaginationOptions, total: u64) -> Self {
        let limit = u64::from(pagination.limit.max(1));
        let pages = total.div_ceil(limit);
        Self {
            page: pagination.page,
            limit: pagination.limit,
            total,
            pages,
            has_next: u64::from(pagination.page) < pages,
            has_prev: pagination.page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> PaginatedResult<T> {
    /// Converts every item, keeping the page metadata. Stops at the first error.
    pub fn try_map<U, E, F>(self, f: F) -> Result<PaginatedResult<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(PaginatedResult {
            data: self.data.into_iter().map(f).collect::<Result<Vec<_>, E>>()?,
            pagination: self.pagination,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    fn default_alias(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// One aggregate, optionally grouped.
///
/// `having` conditions filter groups; their column is either the result
/// alias or one of the table's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOptions {
    pub function: AggregateFunction,
    pub column: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub having: Vec<QueryCondition>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl AggregateOptions {
    pub fn new(function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: column.into(),
            alias: None,
            conditions: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            include_deleted: false,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<QueryCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, condition: QueryCondition) -> Self {
        self.having.push(condition);
        self
    }

    pub fn including_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    /// Name of the aggregate column in each result row.
    pub fn result_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.function.default_alias())
    }
}

/// Counters kept by a [`QueryEngine`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub total_time_ms: u64,
}

impl QueryStats {
    pub fn average_time_ms(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.total_queries as f64
        }
    }
}

fn spec_error(message: String) -> RepositoryError {
    RepositoryError::internal(InternalCode::QuerySpecificationInvalid, message)
}

fn check_operand(condition: &QueryCondition) -> Result<(), RepositoryError> {
    match condition.operator {
        QueryOperator::In | QueryOperator::NotIn if !condition.value.is_array() => Err(spec_error(format!(
            "Operator {:?} on '{}' requires an array operand",
            condition.operator, condition.column
        ))),
        QueryOperator::Like | QueryOperator::ILike if !condition.value.is_string() => Err(spec_error(format!(
            "Operator {:?} on '{}' requires a text operand",
            condition.operator, condition.column
        ))),
        _ => Ok(()),
    }
}

/// Validates every condition before anything is pushed.
fn check_conditions(table: &TableDef, conditions: &[QueryCondition]) -> Result<(), RepositoryError> {
    for condition in conditions {
        table.require_column(&condition.column)?;
        check_operand(condition)?;
    }
    Ok(())
}

fn push_condition(builder: &mut QueryBuilder<'static, Sqlite>, condition: &QueryCondition) {
    let column = quote_ident(&condition.column);
    match condition.operator {
        QueryOperator::IsNull => {
            builder.push(column).push(" IS NULL");
        }
        QueryOperator::IsNotNull => {
            builder.push(column).push(" IS NOT NULL");
        }
        QueryOperator::In | QueryOperator::NotIn => {
            let items = condition.value.as_array().map(Vec::as_slice).unwrap_or_default();
            let negate = condition.operator == QueryOperator::NotIn;
            if items.is_empty() {
                builder.push(if negate { "1 = 1" } else { "1 = 0" });
                return;
            }
            builder.push(column).push(if negate { " NOT IN (" } else { " IN (" });
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(builder, item);
            }
            builder.push(")");
        }
        QueryOperator::ILike => {
            builder.push("LOWER(").push(column).push(") LIKE LOWER(");
            push_value(builder, &condition.value);
            builder.push(")");
        }
        op => {
            builder.push(column).push(op.comparison().unwrap_or(" = "));
            push_value(builder, &condition.value);
        }
    }
}

/// Pushes `(c1 AND c2 ...)`, or `OR` when any connector asks for it.
fn push_group(builder: &mut QueryBuilder<'static, Sqlite>, conditions: &[QueryCondition]) {
    let joiner = if conditions.iter().any(|c| c.connector == Connector::Or) {
        " OR "
    } else {
        " AND "
    };
    builder.push("(");
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            builder.push(joiner);
        }
        push_condition(builder, condition);
    }
    builder.push(")");
}

/// Appends `WHERE ...` for the conditions plus the tombstone filter.
pub(crate) fn push_where(
    builder: &mut QueryBuilder<'static, Sqlite>,
    table: &TableDef,
    conditions: &[QueryCondition],
    include_deleted: bool,
) -> Result<(), RepositoryError> {
    check_conditions(table, conditions)?;

    let tombstone = table.tombstone_column().filter(|_| !include_deleted);
    if conditions.is_empty() && tombstone.is_none() {
        return Ok(());
    }

    builder.push(" WHERE ");
    if !conditions.is_empty() {
        push_group(builder, conditions);
    }
    if let Some(tombstone) = tombstone {
        if !conditions.is_empty() {
            builder.push(" AND ");
        }
        builder.push(quote_ident(tombstone)).push(" IS NULL");
    }
    Ok(())
}

fn push_column_list(builder: &mut QueryBuilder<'static, Sqlite>, columns: &[String]) {
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(column));
    }
}

/// Runs query specifications against one store and keeps timing statistics.
#[derive(Debug)]
pub struct QueryEngine {
    client: DbClient,
    monitoring: MonitoringConfig,
    stats: Mutex<QueryStats>,
}

impl QueryEngine {
    pub fn new(client: DbClient, monitoring: MonitoringConfig) -> Self {
        Self {
            client,
            monitoring,
            stats: Mutex::new(QueryStats::default()),
        }
    }

    /// Builds the `SELECT` for `options`, without running it.
    pub fn build_select(
        &self,
        table: &TableDef,
        options: &QueryOptions,
    ) -> Result<QueryBuilder<'static, Sqlite>, RepositoryError> {
        let columns: Vec<String> = match &options.select {
            Some(select) if !select.is_empty() => select.clone(),
            _ => table.columns().to_vec(),
        };
        for column in &columns {
            table.require_column(column)?;
        }
        for sort in &options.sort {
            table.require_column(&sort.column)?;
        }

        let mut builder = QueryBuilder::new("SELECT ");
        push_column_list(&mut builder, &columns);
        builder.push(" FROM ").push(quote_ident(table.name()));

        push_where(&mut builder, table, &options.conditions, options.include_deleted)?;

        builder.push(" ORDER BY ");
        if options.sort.is_empty() {
            builder.push(quote_ident(table.id_column())).push(" ASC");
        } else {
            for (i, sort) in options.sort.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(quote_ident(&sort.column)).push(match sort.direction {
                    SortDirection::Asc => " ASC",
                    SortDirection::Desc => " DESC",
                });
            }
        }

        if let Some(pagination) = &options.pagination {
            pagination.validate()?;
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(pagination.limit));
            builder.push(" OFFSET ");
            builder.push_bind(pagination.offset() as i64);
        }

        Ok(builder)
    }

    pub async fn query(&self, table: &TableDef, options: &QueryOptions) -> Result<Vec<Record>, RepositoryError> {
        let mut builder = self.build_select(table, options)?;
        debug!(table = table.name(), sql = builder.sql(), "Running query");

        let rows = self
            .observe(table.name(), builder.build().fetch_all(self.client.pool()))
            .await?;
        rows.iter()
            .map(|row| decode_row(row).map_err(RepositoryError::from))
            .collect()
    }

    /// Runs a page query and a count over the same filters.
    ///
    /// Pagination is required; a page or limit of zero is a validation error.
    pub async fn query_paginated(
        &self,
        table: &TableDef,
        options: &QueryOptions,
    ) -> Result<PaginatedResult<Record>, RepositoryError> {
        let pagination = options.pagination.ok_or_else(|| {
            RepositoryError::validation_with_code(
                ValidationCode::RequiredField,
                vec![FieldError::new("pagination", "is required for paginated queries")],
            )
        })?;
        pagination.validate()?;

        let total = self
            .count_matching(table, &options.conditions, options.include_deleted)
            .await?;
        let data = self.query(table, options).await?;

        Ok(PaginatedResult {
            data,
            pagination: PageInfo::new(pagination, total),
        })
    }

    /// Builds the aggregate `SELECT`, without running it.
    pub fn build_aggregate(
        &self,
        table: &TableDef,
        options: &AggregateOptions,
    ) -> Result<QueryBuilder<'static, Sqlite>, RepositoryError> {
        table.require_column(&options.column)?;
        for column in &options.group_by {
            table.require_column(column)?;
        }
        let alias = options.result_alias();
        for condition in &options.having {
            if condition.column != alias {
                table.require_column(&condition.column)?;
            }
            check_operand(condition)?;
        }

        let mut builder = QueryBuilder::new("SELECT ");
        for column in &options.group_by {
            builder.push(quote_ident(column)).push(", ");
        }
        builder
            .push(options.function.as_sql())
            .push("(")
            .push(quote_ident(&options.column))
            .push(") AS ")
            .push(quote_ident(alias))
            .push(" FROM ")
            .push(quote_ident(table.name()));
        push_where(&mut builder, table, &options.conditions, options.include_deleted)?;

        if !options.group_by.is_empty() {
            builder.push(" GROUP BY ");
            push_column_list(&mut builder, &options.group_by);
        }
        if !options.having.is_empty() {
            builder.push(" HAVING ");
            push_group(&mut builder, &options.having);
        }
        if !options.group_by.is_empty() {
            builder.push(" ORDER BY ");
            push_column_list(&mut builder, &options.group_by);
        }
        Ok(builder)
    }

    /// One row per group, or a single row when ungrouped.
    ///
    /// SUM/AVG/MIN/MAX over no rows yield `Null` in the alias column.
    pub async fn aggregate(
        &self,
        table: &TableDef,
        options: &AggregateOptions,
    ) -> Result<Vec<Record>, RepositoryError> {
        let mut builder = self.build_aggregate(table, options)?;
        debug!(table = table.name(), sql = builder.sql(), "Running aggregate");

        let rows = self
            .observe(table.name(), builder.build().fetch_all(self.client.pool()))
            .await?;
        rows.iter()
            .map(|row| decode_row(row).map_err(RepositoryError::from))
            .collect()
    }

    /// `COUNT(id)` of the rows matching `conditions`.
    pub async fn count_matching(
        &self,
        table: &TableDef,
        conditions: &[QueryCondition],
        include_deleted: bool,
    ) -> Result<u64, RepositoryError> {
        let options = AggregateOptions::new(AggregateFunction::Count, table.id_column())
            .with_conditions(conditions.to_vec())
            .including_deleted(include_deleted);
        let rows = self.aggregate(table, &options).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(options.result_alias()))
            .and_then(Value::as_u64)
            .unwrap_or_default())
    }

    pub fn stats(&self) -> QueryStats {
        lock(&self.stats).clone()
    }

    async fn observe<T, F>(&self, table: &str, fut: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();

        let slow = self.monitoring.enabled && elapsed >= self.monitoring.slow_query_threshold();
        {
            let mut stats = lock(&self.stats);
            stats.total_queries += 1;
            stats.total_time_ms += elapsed.as_millis() as u64;
            if result.is_err() {
                stats.failed_queries += 1;
            }
            if slow {
                stats.slow_queries += 1;
            }
        }
        if slow {
            warn!(table, elapsed_ms = elapsed.as_millis() as u64, "Slow query detected");
        }

        result.map_err(|e| {
            error!(table, "Query failed: {}", e);
            from_sqlx(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> TableDef {
        TableDef::new("widgets", ["name", "quantity"]).with_tombstone("deleted_at")
    }

    fn where_sql(conditions: &[QueryCondition], include_deleted: bool) -> Result<String, RepositoryError> {
        let mut builder = QueryBuilder::new("SELECT 1 FROM \"widgets\"");
        push_where(&mut builder, &widgets(), conditions, include_deleted)?;
        Ok(builder.sql().to_string())
    }

    #[test]
    fn test_conditions_are_conjunctive_by_default() {
        let sql = where_sql(
            &[
                QueryCondition::eq("name", "bolt"),
                QueryCondition::new("quantity", QueryOperator::GreaterThan, 2),
            ],
            false,
        )
        .expect("valid spec");
        assert_eq!(
            sql,
            "SELECT 1 FROM \"widgets\" WHERE (\"name\" = ? AND \"quantity\" > ?) AND \"deleted_at\" IS NULL"
        );
    }

    #[test]
    fn test_any_or_connector_makes_a_disjunction() {
        let sql = where_sql(
            &[QueryCondition::eq("name", "bolt"), QueryCondition::eq("name", "nut").or()],
            true,
        )
        .expect("valid spec");
        assert_eq!(sql, "SELECT 1 FROM \"widgets\" WHERE (\"name\" = ? OR \"name\" = ?)");
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let sql = where_sql(&[QueryCondition::is_in("name", vec![])], true).expect("valid spec");
        assert_eq!(sql, "SELECT 1 FROM \"widgets\" WHERE (1 = 0)");

        let sql = where_sql(
            &[QueryCondition::is_in("name", vec![json!("a"), json!("b")])],
            true,
        )
        .expect("valid spec");
        assert_eq!(sql, "SELECT 1 FROM \"widgets\" WHERE (\"name\" IN (?, ?))");
    }

    #[test]
    fn test_ilike_lowercases_both_sides() {
        let sql = where_sql(&[QueryCondition::ilike("name", "%BOLT%")], true).expect("valid spec");
        assert_eq!(sql, "SELECT 1 FROM \"widgets\" WHERE (LOWER(\"name\") LIKE LOWER(?))");

        let err = where_sql(&[QueryCondition::new("name", QueryOperator::ILike, 3)], true)
            .expect_err("numeric pattern");
        assert_eq!(err.code(), "QUERY_SPECIFICATION_INVALID");
    }

    #[test]
    fn test_invalid_specifications_are_rejected() {
        let err = where_sql(&[QueryCondition::eq("colour", "red")], false).expect_err("unknown column");
        assert_eq!(err.code(), "QUERY_SPECIFICATION_INVALID");

        let err = where_sql(&[QueryCondition::new("name", QueryOperator::In, "bolt")], false)
            .expect_err("non-array operand");
        assert_eq!(err.code(), "QUERY_SPECIFICATION_INVALID");
    }

    #[test]
    fn test_page_info() {
        let info = PageInfo::new(PaginationOptions::new(2, 10), 25);
        assert_eq!(info.pages, 3);
        assert!(info.has_next);
        assert!(info.has_prev);

        let info = PageInfo::new(PaginationOptions::new(1, 10), 0);
        assert_eq!(info.pages, 0);
        assert!(!info.has_next);
        assert!(!info.has_prev);

        assert_eq!(PaginationOptions::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_zero_page_is_invalid_value() {
        let err = PaginationOptions::new(0, 10).validate().expect_err("page 0");
        assert_eq!(err.code(), "INVALID_VALUE");
        assert_eq!(err.fields().len(), 1);
    }
}
