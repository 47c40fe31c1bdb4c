//! The generic base repository.
//!
//! [`BaseRepository`] implements CRUD, existence, counting and bulk
//! operations once, for any entity whose [`EntityMapper`] converts it to and
//! from a storage [`Record`]. The table is passed in as a [`TableDef`]
//! value, so one implementation serves every entity kind.
//!
//! Every public operation returns a [`RepositoryError`]; failures are logged
//! with the entity name, id and operation before they are returned.

use crate::bulk::{BulkOptions, BulkResult};
use crate::client::DbClient;
use crate::entity::{id_to_string, id_to_value, Entity, EntityMapper};
use crate::entity_cache::EntityCache;
use crate::error::from_sqlx;
use crate::query::{push_where, PaginatedResult, QueryCondition, QueryEngine, QueryOptions, QueryStats};
use crate::record::{decode_row, push_value, quote_ident, timestamp_value, Record, TableDef};
use crate::transaction::{TransactionManager, TransactionStats};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use strata_common::{ConflictCode, InternalCode, RepositoryError, RepositoryResult, Severity};
use strata_config::{MonitoringConfig, RepositoryOptions};
use tracing::{debug, error, info, warn};

/// Ids bound per membership statement; older SQLite builds cap a statement
/// at 999 variables and a soft delete binds one more for the tombstone.
const MAX_BOUND_IDS: usize = 900;

/// Target of the audit events emitted when `auditing` is on.
pub const AUDIT_TARGET: &str = "strata::audit";

/// Repository operations over one entity type.
///
/// Implemented by [`BaseRepository`]; generic callers and test doubles
/// program against this trait.
pub trait Repository<T>: Send + Sync
where
    T: Entity,
{
    /// Returns `None` when no live row has this id.
    fn find_by_id(&self, id: &T::Id) -> impl Future<Output = RepositoryResult<Option<T>>> + Send;

    fn find_all(&self, options: &QueryOptions) -> impl Future<Output = RepositoryResult<Vec<T>>> + Send;

    fn find_paginated(
        &self,
        options: &QueryOptions,
    ) -> impl Future<Output = RepositoryResult<PaginatedResult<T>>> + Send;

    fn create(&self, entity: T) -> impl Future<Output = RepositoryResult<T>> + Send;

    fn update(&self, entity: T) -> impl Future<Output = RepositoryResult<T>> + Send;

    fn delete(&self, id: &T::Id) -> impl Future<Output = RepositoryResult<()>> + Send;

    fn exists(&self, id: &T::Id) -> impl Future<Output = RepositoryResult<bool>> + Send;

    fn count(&self, options: &QueryOptions) -> impl Future<Output = RepositoryResult<u64>> + Send;

    fn bulk_create(
        &self,
        entities: Vec<T>,
        options: BulkOptions,
    ) -> impl Future<Output = RepositoryResult<BulkResult<T>>> + Send;

    fn bulk_delete(
        &self,
        ids: Vec<T::Id>,
        options: BulkOptions,
    ) -> impl Future<Output = RepositoryResult<BulkResult<T::Id>>> + Send;

    fn get_stats(&self) -> RepositoryStats;
}

/// Object-safe view of a repository, used by the factory cache.
pub trait ManagedRepository: Send + Sync + 'static {
    fn entity_name(&self) -> &str;

    /// Type name of the mapper the repository was built with.
    fn repository_type(&self) -> &'static str;

    fn options(&self) -> &RepositoryOptions;

    fn stats(&self) -> RepositoryStats;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared collaborators handed to every repository built from one store.
#[derive(Debug, Clone)]
pub struct RepositoryContext {
    pub client: DbClient,
    pub monitoring: MonitoringConfig,
}

impl RepositoryContext {
    pub fn new(client: DbClient, monitoring: MonitoringConfig) -> Self {
        Self { client, monitoring }
    }
}

/// Read-only introspection of one repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryStats {
    pub entity_name: String,
    pub table: String,
    pub options: RepositoryOptions,
    pub query_stats: QueryStats,
    pub transaction_stats: TransactionStats,
    pub cached_entities: usize,
}

pub struct BaseRepository<M: EntityMapper> {
    entity_name: String,
    table: Arc<TableDef>,
    mapper: Arc<M>,
    options: RepositoryOptions,
    transactions: TransactionManager,
    queries: QueryEngine,
    cache: Option<EntityCache<M::Entity>>,
}

impl<M: EntityMapper> std::fmt::Debug for BaseRepository<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseRepository")
            .field("entity_name", &self.entity_name)
            .field("table", &self.table.name())
            .field("options", &self.options)
            .finish()
    }
}

impl<M: EntityMapper> BaseRepository<M> {
    /// Builds a repository over `table`.
    ///
    /// # Errors
    ///
    /// `Internal(CONFIGURATION_ERROR)` when `soft_delete` is requested for a
    /// table without a tombstone column.
    pub fn new(
        entity_name: impl Into<String>,
        table: TableDef,
        mapper: M,
        options: RepositoryOptions,
        context: &RepositoryContext,
    ) -> RepositoryResult<Self> {
        let entity_name = entity_name.into();
        if options.soft_delete && table.tombstone_column().is_none() {
            return Err(RepositoryError::internal(
                InternalCode::ConfigurationError,
                format!(
                    "Soft delete enabled for {} but table '{}' has no tombstone column",
                    entity_name,
                    table.name()
                ),
            ));
        }

        let cache = options
            .caching
            .then(|| EntityCache::new(options.cache_ttl(), options.cache_max_entries));
        debug!(entity = %entity_name, table = table.name(), ?options, "Repository created");

        Ok(Self {
            entity_name,
            table: Arc::new(table),
            mapper: Arc::new(mapper),
            options,
            transactions: TransactionManager::new(context.client.clone()),
            queries: QueryEngine::new(context.client.clone(), context.monitoring.clone()),
            cache,
        })
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// The query engine, for concrete repositories that add finders of their own.
    pub fn queries(&self) -> &QueryEngine {
        &self.queries
    }

    pub async fn find_by_id(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<Option<M::Entity>> {
        let key = id_to_string(id);
        debug!(entity = %self.entity_name, id = %key, "Finding entity by id");

        if let Some(entity) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
            return Ok(Some(entity));
        }

        let found = self
            .fetch_by_id(id)
            .await
            .map_err(|e| self.fail("find_by_id", &key, e))?;
        if let (Some(cache), Some(entity)) = (&self.cache, &found) {
            cache.put(key, entity.clone());
        }
        Ok(found)
    }

    /// Uncached single-row lookup of a live entity.
    async fn fetch_by_id(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<Option<M::Entity>> {
        let options = QueryOptions::new()
            .filter(QueryCondition::eq(self.table.id_column(), id_to_value(id)?))
            .paginate(1, 1);
        let mut rows = self.queries.query(&self.table, &options).await?;
        match rows.pop() {
            Some(record) => Ok(Some(self.mapper.to_domain(record)?)),
            None => Ok(None),
        }
    }

    /// Projections are ignored; entities are always built from full rows.
    pub async fn find_all(&self, options: &QueryOptions) -> RepositoryResult<Vec<M::Entity>> {
        debug!(entity = %self.entity_name, conditions = options.conditions.len(), "Finding entities");
        let options = QueryOptions {
            select: None,
            ..options.clone()
        };

        let result = async {
            let rows = self.queries.query(&self.table, &options).await?;
            rows.into_iter()
                .map(|record| self.mapper.to_domain(record))
                .collect::<RepositoryResult<Vec<_>>>()
        }
        .await;
        result.map_err(|e| self.fail("find_all", "-", e))
    }

    pub async fn find_paginated(&self, options: &QueryOptions) -> RepositoryResult<PaginatedResult<M::Entity>> {
        debug!(entity = %self.entity_name, pagination = ?options.pagination, "Finding page of entities");
        let options = QueryOptions {
            select: None,
            ..options.clone()
        };

        let result = async {
            let page = self.queries.query_paginated(&self.table, &options).await?;
            page.try_map(|record| self.mapper.to_domain(record))
        }
        .await;
        result.map_err(|e| self.fail("find_paginated", "-", e))
    }

    /// Validates, checks for an existing row and inserts in a transaction.
    ///
    /// The existence check and the insert are separate round-trips; a
    /// concurrent duplicate that slips between them is caught by the store's
    /// primary key and reported as `Conflict(UNIQUE_CONSTRAINT_VIOLATION)`.
    pub async fn create(&self, entity: M::Entity) -> RepositoryResult<M::Entity> {
        let key = id_to_string(entity.id());
        debug!(entity = %self.entity_name, id = %key, "Creating entity");

        let fields = self.mapper.validate_for_create(&entity);
        if !fields.is_empty() {
            return Err(self.fail("create", &key, RepositoryError::validation(fields)));
        }

        let created = self
            .insert(&entity, &key)
            .await
            .map_err(|e| self.fail("create", &key, e))?;

        if let Some(cache) = &self.cache {
            cache.put(key.clone(), created.clone());
        }
        self.audit("create", &key);
        info!(entity = %self.entity_name, id = %key, "Entity created");
        Ok(created)
    }

    async fn insert(&self, entity: &M::Entity, key: &str) -> RepositoryResult<M::Entity> {
        let id = id_to_value(entity.id())?;
        // Tombstoned rows still occupy their id
        if self.exists_with(id, true).await? {
            return Err(RepositoryError::conflict(
                ConflictCode::EntityAlreadyExists,
                format!("{} with id {} already exists", self.entity_name, key),
            ));
        }

        let statement = insert_statement(&self.table, &self.mapper.to_persistence(entity)?, true)?;
        let record = self
            .transactions
            .execute_transaction(move |tx| {
                Box::pin(async move {
                    let mut statement = statement;
                    let row = statement
                        .build()
                        .fetch_one(&mut **tx)
                        .await
                        .map_err(from_sqlx)?;
                    Ok::<_, RepositoryError>(decode_row(&row)?)
                })
            })
            .await?;
        self.mapper.to_domain(record)
    }

    /// Validates, confirms the entity exists and is not stale, then updates it by id.
    ///
    /// The identifier column is never rewritten.
    pub async fn update(&self, entity: M::Entity) -> RepositoryResult<M::Entity> {
        let key = id_to_string(entity.id());
        debug!(entity = %self.entity_name, id = %key, "Updating entity");

        let fields = self.mapper.validate_for_update(&entity);
        if !fields.is_empty() {
            return Err(self.fail("update", &key, RepositoryError::validation(fields)));
        }

        let updated = self
            .apply_update(&entity, &key)
            .await
            .map_err(|e| self.fail("update", &key, e))?;

        if let Some(cache) = &self.cache {
            cache.put(key.clone(), updated.clone());
        }
        self.audit("update", &key);
        info!(entity = %self.entity_name, id = %key, "Entity updated");
        Ok(updated)
    }

    async fn apply_update(&self, entity: &M::Entity, key: &str) -> RepositoryResult<M::Entity> {
        let current = self
            .fetch_by_id(entity.id())
            .await?
            .ok_or_else(|| self.not_found(key))?;
        if entity.updated_at() < current.updated_at() {
            return Err(RepositoryError::conflict(
                ConflictCode::StaleEntity,
                format!(
                    "{} {} was modified at {}, update is based on {}",
                    self.entity_name,
                    key,
                    current.updated_at(),
                    entity.updated_at()
                ),
            ));
        }

        let record = self.mapper.to_persistence(entity)?;
        let Some(statement) = update_statement(&self.table, &record, id_to_value(entity.id())?)? else {
            return Ok(current);
        };
        let row = self
            .transactions
            .execute_transaction(move |tx| {
                Box::pin(async move {
                    let mut statement = statement;
                    let row = statement
                        .build()
                        .fetch_optional(&mut **tx)
                        .await
                        .map_err(from_sqlx)?;
                    row.as_ref().map(decode_row).transpose().map_err(RepositoryError::from)
                })
            })
            .await?;

        match row {
            Some(record) => self.mapper.to_domain(record),
            // Deleted between the existence check and the update
            None => Err(self.not_found(key)),
        }
    }

    /// Tombstones the row when `soft_delete` is on, removes it otherwise.
    pub async fn delete(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<()> {
        let key = id_to_string(id);
        debug!(entity = %self.entity_name, id = %key, soft = self.options.soft_delete, "Deleting entity");

        let result = async {
            let id = id_to_value(id)?;
            if !self.exists_with(id.clone(), false).await? {
                return Err(self.not_found(&key));
            }

            let statement = self.delete_statement(vec![QueryCondition::eq(self.table.id_column(), id)], false)?;
            let affected = self
                .transactions
                .execute_transaction(move |tx| {
                    Box::pin(async move {
                        let mut statement = statement;
                        let done = statement.build().execute(&mut **tx).await.map_err(from_sqlx)?;
                        Ok::<_, RepositoryError>(done.rows_affected())
                    })
                })
                .await?;
            if affected == 0 {
                return Err(self.not_found(&key));
            }
            Ok::<_, RepositoryError>(())
        }
        .await;
        result.map_err(|e| self.fail("delete", &key, e))?;

        if let Some(cache) = &self.cache {
            cache.remove(&key);
        }
        self.audit("delete", &key);
        info!(entity = %self.entity_name, id = %key, soft = self.options.soft_delete, "Entity deleted");
        Ok(())
    }

    /// Probes for a live row, selecting only the id column.
    pub async fn exists(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<bool> {
        let key = id_to_string(id);
        let result = async { self.exists_with(id_to_value(id)?, false).await }.await;
        result.map_err(|e| self.fail("exists", &key, e))
    }

    async fn exists_with(&self, id: Value, include_deleted: bool) -> RepositoryResult<bool> {
        let mut options = QueryOptions::new()
            .filter(QueryCondition::eq(self.table.id_column(), id))
            .select([self.table.id_column()])
            .paginate(1, 1);
        options.include_deleted = include_deleted;
        Ok(!self.queries.query(&self.table, &options).await?.is_empty())
    }

    pub async fn count(&self, options: &QueryOptions) -> RepositoryResult<u64> {
        self.queries
            .count_matching(&self.table, &options.conditions, options.include_deleted)
            .await
            .map_err(|e| self.fail("count", "-", e))
    }

    /// Inserts `entities` in batches, one transaction per batch.
    ///
    /// Without `continue_on_error` the first failing item rolls back its
    /// batch and the call returns that item's error; batches committed
    /// before it stay committed. With `continue_on_error` failures are
    /// collected per item, and a batch whose transaction fails as a whole
    /// reports every one of its items as failed.
    pub async fn bulk_create(
        &self,
        entities: Vec<M::Entity>,
        options: BulkOptions,
    ) -> RepositoryResult<BulkResult<M::Entity>> {
        let batch_size = options.effective_batch_size();
        debug!(entity = %self.entity_name, items = entities.len(), batch_size, "Bulk create");

        let mut result = BulkResult::new();
        for (batch_no, batch) in entities.chunks(batch_size).enumerate() {
            let batch = batch.to_vec();
            let pending = batch.clone();
            let table = Arc::clone(&self.table);
            let mapper = Arc::clone(&self.mapper);
            let continue_on_error = options.continue_on_error;
            let return_results = options.return_results;

            let outcome: RepositoryResult<BulkResult<M::Entity>> = self
                .transactions
                .execute_transaction(move |tx| {
                    Box::pin(async move {
                        let mut outcome = BulkResult::new();
                        for entity in batch {
                            match insert_in_tx(tx, &table, &*mapper, &entity, return_results).await {
                                Ok(saved) => outcome.push_success(saved),
                                Err(err) if continue_on_error => outcome.push_failure(entity, err.to_string()),
                                Err(err) => return Err(err),
                            }
                        }
                        Ok::<_, RepositoryError>(outcome)
                    })
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    for failure in &outcome.failed {
                        warn!(
                            entity = %self.entity_name,
                            id = %id_to_string(failure.item.id()),
                            operation = "bulk_create",
                            "Item failed: {}", failure.error
                        );
                    }
                    if let Some(cache) = &self.cache {
                        for saved in &outcome.success {
                            cache.put(id_to_string(saved.id()), saved.clone());
                        }
                    }
                    result.absorb(outcome);
                }
                Err(err) if options.continue_on_error => {
                    error!(entity = %self.entity_name, batch = batch_no, "Batch transaction failed: {}", err);
                    let message = err.to_string();
                    for entity in pending {
                        result.push_failure(entity, message.clone());
                    }
                }
                Err(err) => return Err(self.fail("bulk_create", &format!("batch {}", batch_no), err)),
            }
        }

        if self.options.auditing {
            let ids: Vec<String> = result.success.iter().map(|e| id_to_string(e.id())).collect();
            self.audit("bulk_create", &ids.join(","));
        }
        info!(
            entity = %self.entity_name,
            succeeded = result.success_count,
            failed = result.failed_count,
            "Bulk create finished"
        );
        Ok(result)
    }

    /// Deletes (or tombstones) `ids` in batches with the policy of [`Self::bulk_create`].
    ///
    /// Ids with no live row count as failed items.
    pub async fn bulk_delete(
        &self,
        ids: Vec<<M::Entity as Entity>::Id>,
        options: BulkOptions,
    ) -> RepositoryResult<BulkResult<<M::Entity as Entity>::Id>> {
        let batch_size = options.effective_batch_size();
        debug!(entity = %self.entity_name, items = ids.len(), batch_size, "Bulk delete");

        let mut result = BulkResult::new();
        for (batch_no, batch) in ids.chunks(batch_size).enumerate() {
            let batch_label = format!("batch {}", batch_no);
            let values = batch
                .iter()
                .map(id_to_value)
                .collect::<RepositoryResult<Vec<_>>>()
                .map_err(|e| self.fail("bulk_delete", &batch_label, e))?;

            let statements = values
                .chunks(MAX_BOUND_IDS)
                .map(|chunk| {
                    self.delete_statement(vec![QueryCondition::is_in(self.table.id_column(), chunk.to_vec())], true)
                })
                .collect::<RepositoryResult<Vec<_>>>()
                .map_err(|e| self.fail("bulk_delete", &batch_label, e))?;
            let id_column = self.table.id_column().to_string();
            let entity_name = self.entity_name.clone();
            let continue_on_error = options.continue_on_error;

            let outcome: RepositoryResult<Vec<bool>> = self
                .transactions
                .execute_transaction(move |tx| {
                    Box::pin(async move {
                        let mut removed = Vec::with_capacity(values.len());
                        for mut statement in statements {
                            let rows = statement.build().fetch_all(&mut **tx).await.map_err(from_sqlx)?;
                            for row in &rows {
                                if let Some(id) = decode_row(row)?.remove(&id_column) {
                                    removed.push(id);
                                }
                            }
                        }

                        let removed: HashSet<String> = removed.iter().map(Value::to_string).collect();
                        let hits: Vec<bool> = values.iter().map(|v| removed.contains(&v.to_string())).collect();
                        if !continue_on_error {
                            if let Some(missing) = values.iter().zip(&hits).find(|(_, hit)| !**hit) {
                                return Err(RepositoryError::not_found(format!(
                                    "{} with id {} not found",
                                    entity_name, missing.0
                                )));
                            }
                        }
                        Ok::<_, RepositoryError>(hits)
                    })
                })
                .await;

            match outcome {
                Ok(hits) => {
                    for (id, hit) in batch.iter().zip(hits) {
                        let key = id_to_string(id);
                        if hit {
                            if let Some(cache) = &self.cache {
                                cache.remove(&key);
                            }
                            result.push_success(id.clone());
                        } else {
                            warn!(entity = %self.entity_name, id = %key, operation = "bulk_delete", "Item not found");
                            result.push_failure(id.clone(), format!("{} with id {} not found", self.entity_name, key));
                        }
                    }
                }
                Err(err) if options.continue_on_error => {
                    error!(entity = %self.entity_name, batch = batch_no, "Batch transaction failed: {}", err);
                    let message = err.to_string();
                    for id in batch {
                        result.push_failure(id.clone(), message.clone());
                    }
                }
                Err(err) => return Err(self.fail("bulk_delete", &batch_label, err)),
            }
        }

        if self.options.auditing {
            let ids: Vec<String> = result.success.iter().map(id_to_string).collect();
            self.audit("bulk_delete", &ids.join(","));
        }
        info!(
            entity = %self.entity_name,
            succeeded = result.success_count,
            failed = result.failed_count,
            soft = self.options.soft_delete,
            "Bulk delete finished"
        );
        Ok(result)
    }

    pub fn get_stats(&self) -> RepositoryStats {
        RepositoryStats {
            entity_name: self.entity_name.clone(),
            table: self.table.name().to_string(),
            options: self.options.clone(),
            query_stats: self.queries.stats(),
            transaction_stats: self.transactions.stats(),
            cached_entities: self.cache.as_ref().map_or(0, |cache| {
                cache.purge_expired();
                cache.len()
            }),
        }
    }

    /// `UPDATE ... SET tombstone` or `DELETE ...` over live rows matching `conditions`.
    fn delete_statement(
        &self,
        conditions: Vec<QueryCondition>,
        returning: bool,
    ) -> RepositoryResult<QueryBuilder<'static, Sqlite>> {
        let mut builder = QueryBuilder::new("");
        match self.table.tombstone_column().filter(|_| self.options.soft_delete) {
            Some(tombstone) => {
                builder
                    .push("UPDATE ")
                    .push(quote_ident(self.table.name()))
                    .push(" SET ")
                    .push(quote_ident(tombstone))
                    .push(" = ");
                push_value(&mut builder, &timestamp_value(&Utc::now()));
            }
            None => {
                builder.push("DELETE FROM ").push(quote_ident(self.table.name()));
            }
        }
        push_where(&mut builder, &self.table, &conditions, false)?;
        if returning {
            push_returning(&mut builder, &[self.table.id_column().to_string()]);
        }
        Ok(builder)
    }

    fn not_found(&self, key: &str) -> RepositoryError {
        RepositoryError::not_found(format!("{} with id {} not found", self.entity_name, key))
    }

    fn audit(&self, operation: &'static str, ids: &str) {
        if self.options.auditing {
            info!(target: AUDIT_TARGET, entity = %self.entity_name, operation, ids, "Audit");
        }
    }

    fn fail(&self, operation: &'static str, id: &str, err: RepositoryError) -> RepositoryError {
        match err.severity() {
            Severity::Error => {
                error!(entity = %self.entity_name, id, operation, code = err.code(), "{}", err)
            }
            Severity::Warning => {
                warn!(entity = %self.entity_name, id, operation, code = err.code(), "{}", err)
            }
        }
        err
    }
}

/// Validates and inserts one entity on an open transaction.
async fn insert_in_tx<M: EntityMapper>(
    tx: &mut crate::client::DbTransaction,
    table: &TableDef,
    mapper: &M,
    entity: &M::Entity,
    return_results: bool,
) -> RepositoryResult<M::Entity> {
    let fields = mapper.validate_for_create(entity);
    if !fields.is_empty() {
        return Err(RepositoryError::validation(fields));
    }

    let mut statement = insert_statement(table, &mapper.to_persistence(entity)?, return_results)?;
    let query = statement.build();
    if return_results {
        let row = query.fetch_one(&mut **tx).await.map_err(from_sqlx)?;
        mapper.to_domain(decode_row(&row)?)
    } else {
        query.execute(&mut **tx).await.map_err(from_sqlx)?;
        Ok(entity.clone())
    }
}

fn push_returning(builder: &mut QueryBuilder<'static, Sqlite>, columns: &[String]) {
    builder.push(" RETURNING ");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(column));
    }
}

fn insert_statement(
    table: &TableDef,
    record: &Record,
    returning: bool,
) -> RepositoryResult<QueryBuilder<'static, Sqlite>> {
    if !record.contains_key(table.id_column()) {
        return Err(RepositoryError::internal(
            InternalCode::SerializationError,
            format!("Persistence record for '{}' has no '{}' column", table.name(), table.id_column()),
        ));
    }
    for column in record.keys() {
        table.require_column(column)?;
    }

    let mut builder = QueryBuilder::new("INSERT INTO ");
    builder.push(quote_ident(table.name())).push(" (");
    for (i, column) in record.keys().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(column));
    }
    builder.push(") VALUES (");
    for (i, value) in record.values().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_value(&mut builder, value);
    }
    builder.push(")");
    if returning {
        push_returning(&mut builder, table.columns());
    }
    Ok(builder)
}

/// `None` when the record has nothing to update besides its id.
fn update_statement(
    table: &TableDef,
    record: &Record,
    id: Value,
) -> RepositoryResult<Option<QueryBuilder<'static, Sqlite>>> {
    let assignments: Vec<(&String, &Value)> = record
        .iter()
        .filter(|(column, _)| {
            column.as_str() != table.id_column() && Some(column.as_str()) != table.tombstone_column()
        })
        .collect();
    if assignments.is_empty() {
        return Ok(None);
    }
    for (column, _) in &assignments {
        table.require_column(column)?;
    }

    let mut builder = QueryBuilder::new("UPDATE ");
    builder.push(quote_ident(table.name())).push(" SET ");
    for (i, (column, value)) in assignments.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(column)).push(" = ");
        push_value(&mut builder, value);
    }
    push_where(&mut builder, table, &[QueryCondition::eq(table.id_column(), id)], false)?;
    push_returning(&mut builder, table.columns());
    Ok(Some(builder))
}

impl<M: EntityMapper> Repository<M::Entity> for BaseRepository<M> {
    fn find_by_id(
        &self,
        id: &<M::Entity as Entity>::Id,
    ) -> impl Future<Output = RepositoryResult<Option<M::Entity>>> + Send {
        BaseRepository::find_by_id(self, id)
    }

    fn find_all(&self, options: &QueryOptions) -> impl Future<Output = RepositoryResult<Vec<M::Entity>>> + Send {
        BaseRepository::find_all(self, options)
    }

    fn find_paginated(
        &self,
        options: &QueryOptions,
    ) -> impl Future<Output = RepositoryResult<PaginatedResult<M::Entity>>> + Send {
        BaseRepository::find_paginated(self, options)
    }

    fn create(&self, entity: M::Entity) -> impl Future<Output = RepositoryResult<M::Entity>> + Send {
        BaseRepository::create(self, entity)
    }

    fn update(&self, entity: M::Entity) -> impl Future<Output = RepositoryResult<M::Entity>> + Send {
        BaseRepository::update(self, entity)
    }

    fn delete(&self, id: &<M::Entity as Entity>::Id) -> impl Future<Output = RepositoryResult<()>> + Send {
        BaseRepository::delete(self, id)
    }

    fn exists(&self, id: &<M::Entity as Entity>::Id) -> impl Future<Output = RepositoryResult<bool>> + Send {
        BaseRepository::exists(self, id)
    }

    fn count(&self, options: &QueryOptions) -> impl Future<Output = RepositoryResult<u64>> + Send {
        BaseRepository::count(self, options)
    }

    fn bulk_create(
        &self,
        entities: Vec<M::Entity>,
        options: BulkOptions,
    ) -> impl Future<Output = RepositoryResult<BulkResult<M::Entity>>> + Send {
        BaseRepository::bulk_create(self, entities, options)
    }

    fn bulk_delete(
        &self,
        ids: Vec<<M::Entity as Entity>::Id>,
        options: BulkOptions,
    ) -> impl Future<Output = RepositoryResult<BulkResult<<M::Entity as Entity>::Id>>> + Send {
        BaseRepository::bulk_delete(self, ids, options)
    }

    fn get_stats(&self) -> RepositoryStats {
        BaseRepository::get_stats(self)
    }
}

impl<M: EntityMapper> ManagedRepository for BaseRepository<M> {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn repository_type(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    fn stats(&self) -> RepositoryStats {
        self.get_stats()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> TableDef {
        TableDef::new("widgets", ["name", "quantity", "created_at", "updated_at"]).with_tombstone("deleted_at")
    }

    fn record() -> Record {
        let mut record = Record::new();
        record.insert("id".into(), json!(7));
        record.insert("name".into(), json!("bolt"));
        record.insert("quantity".into(), json!(3));
        record
    }

    #[test]
    fn test_insert_statement_binds_every_column() {
        let statement = insert_statement(&widgets(), &record(), false).expect("valid record");
        assert_eq!(
            statement.sql(),
            "INSERT INTO \"widgets\" (\"id\", \"name\", \"quantity\") VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_insert_statement_requires_id() {
        let mut record = record();
        record.remove("id");
        let Err(err) = insert_statement(&widgets(), &record, true) else {
            panic!("id missing");
        };
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_update_statement_never_sets_id_or_tombstone() {
        let mut record = record();
        record.insert("deleted_at".into(), Value::Null);
        let statement = update_statement(&widgets(), &record, json!(7))
            .expect("valid record")
            .expect("has assignments");
        assert_eq!(
            statement.sql(),
            "UPDATE \"widgets\" SET \"name\" = ?, \"quantity\" = ? WHERE (\"id\" = ?) AND \"deleted_at\" IS NULL \
             RETURNING \"name\", \"quantity\", \"created_at\", \"updated_at\", \"id\", \"deleted_at\""
        );
    }

    #[test]
    fn test_update_statement_without_assignments() {
        let mut record = Record::new();
        record.insert("id".into(), json!(7));
        assert!(update_statement(&widgets(), &record, json!(7)).expect("valid").is_none());
    }
}
