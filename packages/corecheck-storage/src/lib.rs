//! corecheck-storage - Relational store for the coverage pipeline
//!
//! ## Core Principles
//!
//! 1. **Keyed writes only**: every table has a stable key, every write is an
//!    upsert or a compare-and-set, so independent executions never need locks
//! 2. **Durable executions**: an execution is a serialized record plus an
//!    indexed state column; resuming means reloading the record
//! 3. **Ordered migrations**: one global version row, advanced one step at a
//!    time by the migration runner
//!
//! ## Usage
//!
//! ```rust,ignore
//! use corecheck_storage::{Execution, PipelineStore, SqliteStore};
//!
//! let store = SqliteStore::open("corecheck.db")?;
//! let execution = Execution::new(serde_json::json!({"target": "repo-42"}));
//! store.insert_execution(&execution).await?;
//!
//! let loaded = store.get_execution(execution.execution_id).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod migrations;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    CoverageResult, ErrorDetail, Execution, ExecutionId, ExecutionResult, ExecutionState,
    JobStatus, JobSubmission, PipelineStore, RepositoryRecord, SchemaStore, StateTransition,
    TaskClaim, UpsertOutcome,
};
pub use migrations::{Direction, Migration, MIGRATIONS};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStore;

#[cfg(feature = "postgres")]
pub use infrastructure::PostgresStore;

#[cfg(feature = "postgres")]
pub use sqlx::postgres::PgConnectOptions;
