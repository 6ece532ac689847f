//! Configuration management for SiteScope.
//!
//! Provides TOML-based configuration with platform-specific paths and
//! environment variable overrides.

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main engine configuration.
///
/// This is loaded from `~/.config/sitescope/config.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Executor scheduling and timeouts
    pub executor: ExecutorConfig,
    /// Database connection settings
    pub database: DatabaseConfig,
    /// Credit ledger settings
    pub ledger: LedgerConfig,
}

impl AppConfig {
    /// Load configuration from the platform config path, falling back to
    /// defaults if the file does not exist.
    ///
    /// # Errors
    /// Returns error if:
    /// - Config directory cannot be determined
    /// - File exists but cannot be read
    /// - File contents are not valid TOML or fail validation
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, falling back to defaults if
    /// the file does not exist.
    pub fn load_from(config_path: &Path) -> ConfigResult<Self> {
        let config: Self = if config_path.exists() {
            tracing::debug!("Loading config from {}", config_path.display());
            let contents = fs::read_to_string(config_path)?;
            toml::from_str(&contents)?
        } else {
            tracing::debug!("Config file not found, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Supports the following environment variables:
    /// - `SITESCOPE_WORKER_POOL_SIZE`: Override the number of concurrent tasks
    /// - `SITESCOPE_TASK_DEADLINE_SECS`: Override the overall task deadline
    /// - `SITESCOPE_DATABASE_PATH`: Override the database file path
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SITESCOPE_*` environment overrides in place.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SITESCOPE_WORKER_POOL_SIZE") {
            if let Ok(size) = val.parse() {
                self.executor.worker_pool_size = size;
                tracing::debug!("Override executor.worker_pool_size from env: {}", size);
            }
        }

        if let Ok(val) = std::env::var("SITESCOPE_TASK_DEADLINE_SECS") {
            if let Ok(secs) = val.parse() {
                self.executor.task_deadline_secs = secs;
                tracing::debug!("Override executor.task_deadline_secs from env: {}", secs);
            }
        }

        if let Ok(val) = std::env::var("SITESCOPE_DATABASE_PATH") {
            if !val.is_empty() {
                tracing::debug!("Override database.path from env: {}", val);
                self.database.path = val;
            }
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let non_zero = [
            ("executor.worker_pool_size", self.executor.worker_pool_size as u64),
            (
                "executor.worker_acquire_timeout_secs",
                self.executor.worker_acquire_timeout_secs,
            ),
            ("executor.task_deadline_secs", self.executor.task_deadline_secs),
            (
                "executor.default_plugin_timeout_secs",
                self.executor.default_plugin_timeout_secs,
            ),
            ("executor.audit_timeout_secs", self.executor.audit_timeout_secs),
            (
                "executor.synthesis_timeout_secs",
                self.executor.synthesis_timeout_secs,
            ),
            ("executor.event_buffer", self.executor.event_buffer as u64),
            ("database.max_connections", u64::from(self.database.max_connections)),
            ("ledger.reservation_attempts", u64::from(self.ledger.reservation_attempts)),
        ];

        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "database.path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Save configuration to the platform config path.
    ///
    /// Creates the config directory if it doesn't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, config_path: &Path) -> ConfigResult<()> {
        let config_dir = config_path
            .parent()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "config_path".to_string(),
                reason: "no parent directory".to_string(),
            })?;

        fs::create_dir_all(config_dir)?;
        tracing::debug!("Saving config to {}", config_path.display());

        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses platform base directories: `~/.config/sitescope/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs =
            ProjectDirs::from("com", "sitescope", "sitescope").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path.
    ///
    /// Uses platform base directories: `~/.local/share/sitescope`
    pub fn data_dir() -> ConfigResult<PathBuf> {
        let dirs =
            ProjectDirs::from("com", "sitescope", "sitescope").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

/// Executor scheduling and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of tasks that may execute at the same time
    pub worker_pool_size: usize,
    /// How long a task may wait for a worker slot before failing
    pub worker_acquire_timeout_secs: u64,
    /// Overall deadline for one task execution
    pub task_deadline_secs: u64,
    /// Timeout for plugins that do not declare their own
    pub default_plugin_timeout_secs: u64,
    /// Timeout for the page-audit run
    pub audit_timeout_secs: u64,
    /// Timeout for the AI synthesis run
    pub synthesis_timeout_secs: u64,
    /// How long synthesis waits for sibling modules to finish
    pub synthesis_wait_secs: u64,
    /// Maximum URLs handed to the link-health check
    pub max_link_health_urls: usize,
    /// Capacity of the task event broadcast channel
    pub event_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 3,
            worker_acquire_timeout_secs: 30,
            task_deadline_secs: 300,
            default_plugin_timeout_secs: 60,
            audit_timeout_secs: 120,
            synthesis_timeout_secs: 120,
            synthesis_wait_secs: 300,
            max_link_health_urls: 1000,
            event_buffer: 256,
        }
    }
}

impl ExecutorConfig {
    /// Worker slot acquisition bound.
    #[must_use]
    pub fn worker_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_acquire_timeout_secs)
    }

    /// Overall task deadline.
    #[must_use]
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }

    /// Default per-plugin timeout.
    #[must_use]
    pub fn default_plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.default_plugin_timeout_secs)
    }

    /// Page-audit timeout.
    #[must_use]
    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }

    /// AI synthesis timeout.
    #[must_use]
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    /// Bound on the synthesis wait for sibling modules.
    #[must_use]
    pub fn synthesis_wait(&self) -> Duration {
        Duration::from_secs(self.synthesis_wait_secs)
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file (or `:memory:`)
    pub path: String,
    /// Maximum pooled connections (forced to 1 for `:memory:`)
    pub max_connections: u32,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "sitescope.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// Credit ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Attempts for a reservation that hits a write conflict
    pub reservation_attempts: u32,
    /// Base backoff between reservation attempts
    pub reservation_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_attempts: 3,
            reservation_backoff_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.executor.worker_pool_size, 3);
        assert_eq!(config.executor.worker_acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.executor.task_deadline(), Duration::from_secs(300));
        assert_eq!(config.executor.default_plugin_timeout(), Duration::from_secs(60));
        assert_eq!(config.executor.audit_timeout(), Duration::from_secs(120));
        assert_eq!(config.executor.synthesis_wait(), Duration::from_secs(300));
        assert_eq!(config.ledger.reservation_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("[executor]"));
        assert!(toml_str.contains("[database]"));
        assert!(toml_str.contains("[ledger]"));

        let parsed: AppConfig = toml::from_str(&toml_str).expect("parse serialized config");
        assert_eq!(parsed.database.path, config.database.path);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().expect("create temp dir");
        let config_path = tmp.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.executor.worker_pool_size = 8;
        config.database.path = "/var/lib/sitescope/data.db".to_string();
        config.save_to(&config_path).expect("save config");

        let loaded = AppConfig::load_from(&config_path).expect("load config");
        assert_eq!(loaded.executor.worker_pool_size, 8);
        assert_eq!(loaded.database.path, "/var/lib/sitescope/data.db");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = TempDir::new().expect("create temp dir");
        let loaded = AppConfig::load_from(&tmp.path().join("absent.toml")).expect("defaults");
        assert_eq!(loaded.executor.task_deadline_secs, 300);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[executor]
worker_pool_size = 5

[ledger]
reservation_attempts = 7
"#;

        let config: AppConfig = toml::from_str(toml_str).expect("parse partial config");
        assert_eq!(config.executor.worker_pool_size, 5);
        assert_eq!(config.ledger.reservation_attempts, 7);
        // These should be defaults
        assert_eq!(config.executor.task_deadline_secs, 300);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let tmp = TempDir::new().expect("create temp dir");
        let config_path = tmp.path().join("config.toml");
        fs::write(&config_path, "[executor]\nworker_pool_size = 0\n").expect("write config");

        let err = AppConfig::load_from(&config_path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "executor.worker_pool_size"
        ));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SITESCOPE_WORKER_POOL_SIZE", "6");
        std::env::set_var("SITESCOPE_TASK_DEADLINE_SECS", "not-a-number");
        std::env::set_var("SITESCOPE_DATABASE_PATH", "/tmp/override.db");

        let mut config = AppConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.executor.worker_pool_size, 6);
        assert_eq!(config.executor.task_deadline_secs, 300);
        assert_eq!(config.database.path, "/tmp/override.db");

        std::env::remove_var("SITESCOPE_WORKER_POOL_SIZE");
        std::env::remove_var("SITESCOPE_TASK_DEADLINE_SECS");
        std::env::remove_var("SITESCOPE_DATABASE_PATH");
    }
}
