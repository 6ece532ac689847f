//! Identifier newtypes shared across the SiteScope crates.

use crate::error::SiteScopeError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Newtype for task identifiers with validation.
///
/// Task IDs are UUID v4 strings; they are generated when a task is created and
/// validated whenever one comes back in from outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new `TaskId` from a string.
    ///
    /// # Errors
    /// Returns error if the ID is not a valid UUID v4.
    pub fn new(id: impl Into<String>) -> Result<Self, SiteScopeError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a new random `TaskId` using UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), SiteScopeError> {
        static UUID_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = UUID_REGEX.get_or_init(|| {
            Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
                .expect("valid regex")
        });

        if regex.is_match(id) {
            Ok(())
        } else {
            Err(SiteScopeError::Validation(format!(
                "invalid task ID: must be a valid UUID v4, got '{id}'"
            )))
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for the owning user of a task or ledger entry.
///
/// User IDs are issued by the (external) account layer; the engine only
/// requires them to be non-blank and at most 128 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new `UserId`.
    ///
    /// # Errors
    /// Returns error if the ID is blank or longer than 128 characters.
    pub fn new(id: impl Into<String>) -> Result<Self, SiteScopeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SiteScopeError::Validation(
                "invalid user ID: must not be blank".to_string(),
            ));
        }
        if id.len() > 128 {
            return Err(SiteScopeError::Validation(format!(
                "invalid user ID: must be at most 128 characters, got {}",
                id.len()
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
