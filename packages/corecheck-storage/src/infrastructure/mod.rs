//! Infrastructure layer - Storage adapters
//!
//! - SQLite adapter (local runs, tests)
//! - PostgreSQL adapter (deployed store)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
