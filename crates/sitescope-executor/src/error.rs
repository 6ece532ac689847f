//! Executor error types.

use sitescope_core::{RunStatus, SiteScopeError, StatusTransitionError, TaskId};
use sitescope_db::DatabaseError;
use sitescope_ledger::LedgerError;
use sitescope_plugin::RegistryError;
use thiserror::Error;

/// Errors surfaced by the task service, task manager and executor.
///
/// Plugin failures never appear here: they end up as a failed module.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The request cannot be planned or run
    #[error("validation error: {0}")]
    Validation(String),

    /// No task with this ID exists
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task is terminal and can no longer change
    #[error("task {0} is already {1}")]
    TaskTerminal(TaskId, RunStatus),

    /// Rejected status change
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),

    /// The background worker running a task stopped abnormally
    #[error("task worker stopped: {0}")]
    WorkerStopped(String),

    /// Core type error
    #[error(transparent)]
    Core(#[from] SiteScopeError),

    /// Persistence failure
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Credit reservation or settlement failure
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Plugin lookup failure
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<sqlx::Error> for ExecutorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::Sqlx(err))
    }
}

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_passes_through() {
        let err = ExecutorError::from(LedgerError::InsufficientCredits {
            feature: "deep_crawl".to_string(),
            required: 10,
            available: 5,
        });
        assert_eq!(
            err.to_string(),
            "insufficient credits for deep_crawl: requires 10, available 5"
        );
    }

    #[test]
    fn test_terminal_message() {
        let id = TaskId::generate();
        let err = ExecutorError::TaskTerminal(id.clone(), RunStatus::Completed);
        assert_eq!(err.to_string(), format!("task {id} is already completed"));
    }
}
