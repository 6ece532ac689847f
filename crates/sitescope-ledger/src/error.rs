//! Ledger error types.

use sitescope_db::DatabaseError;
use thiserror::Error;

/// Errors returned by the credit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A requested feature costs more than the user can fund
    #[error("insufficient credits for {feature}: requires {required}, available {available}")]
    InsufficientCredits {
        /// Feature code that could not be funded
        feature: String,
        /// Price of the feature
        required: i64,
        /// Balance left after the user's other reservations
        available: i64,
    },

    /// Anonymous callers may only request basic features
    #[error("feature {0} requires a signed-in user")]
    AccountRequired(String),

    /// No price is configured for the feature
    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// The feature is priced but switched off
    #[error("feature {0} is not available")]
    InactiveFeature(String),

    /// Only settled records can be refunded
    #[error("usage record {0} is not settled")]
    NotSettled(String),

    /// The record has already been refunded
    #[error("usage record {0} was already refunded")]
    AlreadyRefunded(String),

    /// Grants and quotas must be positive / non-negative
    #[error("invalid credit amount: {0}")]
    InvalidAmount(i64),

    /// Persistence failure
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl LedgerError {
    /// Whether retrying the operation may succeed (write conflict on the
    /// credit row).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_conflict())
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::Sqlx(err))
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
