//! Core error types for the SiteScope engine.
//!
//! This module defines the central error type shared by the foundation types
//! plus the configuration error used while loading `AppConfig`.

use crate::task::RunStatus;
use thiserror::Error;

/// Central error type for core operations.
#[derive(Error, Debug)]
pub enum SiteScopeError {
    /// Configuration errors (file loading, parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors (invalid input, constraints)
    #[error("validation error: {0}")]
    Validation(String),

    /// A status change that the state machine does not allow
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),

    /// Serialization errors (JSON payloads, stored columns)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned when a Task or Module is asked to move to a status that is
/// not reachable from its current one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition from {from} to {to}")]
pub struct StatusTransitionError {
    /// Current status
    pub from: RunStatus,
    /// Requested status
    pub to: RunStatus,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to determine config directory path
    #[error("could not determine config directory (platform base directories not available)")]
    NoConfigDir,

    /// Failed to parse TOML
    #[error("failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading/writing config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Reason for invalidity
        reason: String,
    },
}

/// Result type alias using `SiteScopeError`.
pub type Result<T> = std::result::Result<T, SiteScopeError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
