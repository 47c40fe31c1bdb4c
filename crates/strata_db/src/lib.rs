//! Transactional repositories for Strata
//!
//! This crate provides a generic repository layer over SQLite, using SQLx as
//! the underlying database library.
//!
//! # Features
//!
//! - [`BaseRepository`]: CRUD, existence checks, counting, pagination and
//!   batched bulk operations for any entity with an [`EntityMapper`]
//! - [`TransactionManager`]: commit-or-rollback execution of a unit of work
//! - [`QueryOptions`]: declarative filters, sort order and pagination
//! - [`RepositoryFactory`]: registrations per entity name and a bounded,
//!   TTL-aware cache of repository instances
//! - Soft delete, audit events and a per-repository entity cache, switched
//!   on through [`strata_config::RepositoryOptions`]
//!
//! # Example
//!
//! ```rust,no_run
//! use strata_config::RepositoryFactoryConfig;
//! use strata_db::repositories::device_registration::{self, DeviceRegistration, DeviceRegistrationMapper};
//! use strata_db::{DbClient, RepositoryFactory};
//!
//! async fn register() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DbClient::from_url("sqlite:data/strata.db").await?;
//!     device_registration::init_schema(&client).await?;
//!
//!     let factory = RepositoryFactory::init(client, RepositoryFactoryConfig::default());
//!     factory.register(device_registration::registration());
//!
//!     let repository = factory.create::<DeviceRegistrationMapper>(device_registration::ENTITY_NAME, None)?;
//!     repository
//!         .register_device(DeviceRegistration::new("user-1", "phone", "token"))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod client;
pub mod entity;
pub mod entity_cache;
pub mod error;
pub mod factory;
pub mod query;
pub mod record;
pub mod repositories;
pub mod repository;
mod sync;
pub mod transaction;

// Re-export the main types for ease of use
pub use bulk::{BulkFailure, BulkOptions, BulkResult};
pub use client::{DbClient, DbTransaction};
pub use entity::{id_to_value, Entity, EntityMapper};
pub use error::DbError;
pub use factory::{
    spawn_cache_cleanup, FactoryStats, RepositoryFactory, RepositoryMetadata, RepositoryRegistration,
};
pub use query::{
    AggregateFunction, AggregateOptions, Connector, PageInfo, PaginatedResult, PaginationOptions,
    QueryCondition, QueryEngine, QueryOperator, QueryOptions, QueryStats, SortDirection, SortOption,
};
pub use record::{Record, RecordExt, TableDef};
pub use repository::{
    BaseRepository, ManagedRepository, Repository, RepositoryContext, RepositoryStats, AUDIT_TARGET,
};
pub use transaction::{BoxFuture, TransactionManager, TransactionStats};
