//! Plugin and registry errors, and the classification the executor acts on.

use std::time::Duration;
use thiserror::Error;

/// How the executor reacts to a plugin failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient (timeout, connection reset). The module still fails; the
    /// class is recorded for operators.
    Retryable,
    /// Nothing to report for this target. The module completes and keeps the
    /// message as a warning.
    Ignorable,
    /// Bad input or broken contract. The module fails.
    Fatal,
    /// An upstream output the plugin needs is absent. The module fails and the
    /// task carries on.
    Dependency,
}

/// Errors a plugin invocation can end with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// The plugin did not finish within its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transient network failure
    #[error("connection error: {0}")]
    Connection(String),

    /// The target has nothing this plugin can report on
    #[error("not found: {0}")]
    NotFound(String),

    /// The plugin does not apply to this target
    #[error("not applicable: {0}")]
    NotApplicable(String),

    /// The input failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The output broke the plugin contract
    #[error("contract violation: {0}")]
    Contract(String),

    /// A required upstream result is absent
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// The task was cancelled or hit its deadline
    #[error("cancelled")]
    Cancelled,

    /// The plugin panicked
    #[error("plugin panicked: {0}")]
    Panicked(String),

    /// Untyped failure reported by the plugin
    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    /// Classification of this error.
    ///
    /// Untyped failures are classified from their message.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Connection(_) => ErrorClass::Retryable,
            Self::NotFound(_) | Self::NotApplicable(_) => ErrorClass::Ignorable,
            Self::MissingDependency(_) => ErrorClass::Dependency,
            Self::InvalidInput(_) | Self::Contract(_) | Self::Cancelled | Self::Panicked(_) => {
                ErrorClass::Fatal
            }
            Self::Failed(message) => classify_message(message),
        }
    }
}

/// Classify an error string that came without a typed error.
#[must_use]
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if contains_any(&["timeout", "timed out", "deadline exceeded"]) {
        ErrorClass::Retryable
    } else if contains_any(&[
        "connection refused",
        "connection reset",
        "connection closed",
        "network",
        "temporarily unavailable",
        "dns",
        "econnrefused",
        "econnreset",
    ]) {
        ErrorClass::Retryable
    } else if contains_any(&[
        "not found",
        "404",
        "not applicable",
        "no data",
        "unsupported",
        "nxdomain",
    ]) {
        ErrorClass::Ignorable
    } else if contains_any(&["missing dependency", "requires output", "upstream"]) {
        ErrorClass::Dependency
    } else {
        ErrorClass::Fatal
    }
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A plugin with this name is already registered
    #[error("plugin already registered: {0}")]
    Duplicate(String),

    /// No plugin with this name is registered
    #[error("plugin not found: {0}")]
    NotFound(String),
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
