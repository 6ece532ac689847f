//! SiteScope Database Layer
//!
//! Provides `SQLite` persistence for tasks, modules and the credit ledger.
//! Uses `SQLx` with embedded migrations.
//!
//! # Architecture
//!
//! - **Migrations**: SQL migrations are embedded and versioned using `SQLx`
//! - **Connection Pooling**: WAL-mode file pools, single-connection in-memory pools
//! - **Row locks**: every read-modify-write transaction starts with a write
//!   against the row it is about to change (see [`tasks::lock_task`] and
//!   [`credits::lock_user_credits`]); `SQLite` then serializes competing
//!   writers on the database write lock
//!
//! Functions that must run inside a caller's transaction take
//! `&mut SqliteConnection`; standalone reads take `&SqlitePool`.
//!
//! # Example
//!
//! ```ignore
//! use sitescope_db::Database;
//!
//! let db = Database::new("sitescope.db").await?;
//! db.run_migrations().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod connection;
pub mod credits;
pub mod error;
pub mod migrations;
pub mod modules;
pub mod pricing;
pub mod tasks;
pub mod usage_records;

// Re-export commonly used types
pub use credits::UserCredits;
pub use error::{DatabaseError, Result};
pub use pricing::{FeatureCategory, FeaturePricing};
pub use usage_records::{FundingSource, UsageRecord};

use chrono::{DateTime, Utc};
use sitescope_core::DatabaseConfig;
use sqlx::SqlitePool;
use std::path::Path;

/// High-level database handle: a connection pool plus migrations.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database at `path` with default pool settings.
    ///
    /// # Arguments
    /// * `path` - Path to the database file (or `:memory:` for in-memory)
    ///
    /// # Errors
    /// Returns `DatabaseError` if the database cannot be opened.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            DatabaseError::Open("invalid database path: not valid UTF-8".to_string())
        })?;

        Self::connect(&DatabaseConfig {
            path: path.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Open the database described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = connection::create_pool(config).await?;
        Ok(Self { pool })
    }

    /// Open the database described by `config` and bring its schema up to date.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run all pending database migrations.
    ///
    /// # Errors
    /// Returns `DatabaseError::Migration` if any migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Get the current schema version.
    pub async fn get_schema_version(&self) -> Result<i64> {
        migrations::get_schema_version(&self.pool).await
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool gracefully.
    pub async fn close(self) {
        self.pool.close().await;
        tracing::info!("Database pool closed");
    }
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode(format!("invalid timestamp in {column} '{value}': {e}")))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;

    pub async fn setup_test_db() -> Database {
        let db = Database::new(":memory:")
            .await
            .expect("create test database");
        db.run_migrations().await.expect("run migrations");
        db
    }
}
