//! Database error types.

use thiserror::Error;

/// Database-specific errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open or create database connection.
    #[error("failed to open database: {0}")]
    Open(String),

    /// Migration execution failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Database record with provided identifier not found.
    #[error("{0}")]
    NotFoundWithMessage(String),

    /// Failed to decode database value.
    #[error("decode error: {0}")]
    Decode(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying `SQLx` error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Whether the error is a transient write conflict (`SQLITE_BUSY` /
    /// `SQLITE_LOCKED`, including their extended codes) worth retrying.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Sqlx(sqlx::Error::Database(db_err)) => db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            Self::Sqlx(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_sqlx_errors_are_not_conflicts() {
        assert!(!DatabaseError::NotFoundWithMessage("gone".to_string()).is_conflict());
        assert!(!DatabaseError::Decode("bad".to_string()).is_conflict());
        assert!(DatabaseError::Sqlx(sqlx::Error::PoolTimedOut).is_conflict());
        assert!(!DatabaseError::Sqlx(sqlx::Error::RowNotFound).is_conflict());
    }
}
