//! Connection pool construction.
//!
//! File databases run in WAL mode with a busy timeout so concurrent writers
//! queue instead of failing. `:memory:` databases get exactly one connection
//! that is never recycled: the schema lives only as long as that connection.

use crate::error::{DatabaseError, Result};
use sitescope_core::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Path that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Whether `path` selects an in-memory database.
#[must_use]
pub fn is_memory_path(path: &str) -> bool {
    path == MEMORY_PATH || path == "sqlite::memory:"
}

/// Create a connection pool for the configured database.
///
/// # Errors
/// Returns `DatabaseError::Open` if the path is invalid or the first
/// connection cannot be established.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

    let pool = if is_memory_path(&config.path) {
        let options = SqliteConnectOptions::from_str(MEMORY_PATH)
            .map_err(|e| DatabaseError::Open(format!("invalid connection string: {e}")))?
            .busy_timeout(busy_timeout);

        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
    } else {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
    }
    .map_err(|e| DatabaseError::Open(format!("failed to initialize pool: {e}")))?;

    tracing::info!(path = %config.path, "Database pool created");
    Ok(pool)
}
