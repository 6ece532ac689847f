//! SiteScope Core - Foundation crate for the SiteScope analysis engine.
//!
//! This crate provides the shared vocabulary every other SiteScope crate
//! depends on: identifiers, the Task/Module state model, the additive result
//! aggregate, configuration and error types.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with platform paths and env overrides
//! - [`types`] - Validated identifier newtypes (`TaskId`, `UserId`)
//! - [`task`] - Task and Module records, status state machine, analysis options
//! - [`results`] - The per-task result aggregate and the typed slices merged into it
//! - [`logging`] - `tracing` subscriber initialisation
//!
//! # Example
//!
//! ```rust
//! use sitescope_core::{AnalysisOption, RunStatus, TaskResults, ResultSlice};
//!
//! let mut results = TaskResults::default();
//! results.apply(ResultSlice::WebsiteInfo(serde_json::json!({"title": "Example"})));
//! assert!(results.website_info.is_some());
//! assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
//! assert!(AnalysisOption::Seo.is_audit_facet());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod logging;
pub mod results;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, DatabaseConfig, ExecutorConfig, LedgerConfig};
pub use error::{ConfigError, ConfigResult, Result, SiteScopeError, StatusTransitionError};
pub use results::{
    AuditFacet, AuditReport, CrawlFragment, CrawlReport, CrawledPage, LinkCheck,
    LinkHealthReport, LinkSummary, ResultSlice, TaskResults,
};
pub use task::{AiMode, AnalysisOption, Module, NewTask, Progress, RunStatus, Task};
pub use types::{TaskId, UserId};
