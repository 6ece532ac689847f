//! SiteScope Executor
//!
//! Runs analysis tasks: plans the plugins a task needs, reserves credits,
//! executes the four phases on a bounded worker pool, merges partial results
//! as they arrive and settles credits once the task is terminal.
//!
//! # Example
//!
//! ```rust,no_run
//! use sitescope_core::{AnalysisOption, AppConfig, NewTask};
//! use sitescope_db::Database;
//! use sitescope_executor::TaskService;
//! use sitescope_plugin::PluginRegistry;
//!
//! # async fn example(registry: PluginRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_with_env()?;
//! let db = Database::open(&config.database).await?;
//! let service = TaskService::new(&db, registry, &config);
//!
//! let request = NewTask::new("https://example.com", [AnalysisOption::WebsiteInfo]);
//! let task = service.submit_and_wait(request).await?;
//! println!("{}: {}", task.id, task.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod events;
pub mod executor;
mod invoke;
pub mod plan;
pub mod service;
pub mod synthesis;
pub mod task_manager;
pub mod worker_pool;

pub use error::{ExecutorError, Result};
pub use events::TaskEvent;
pub use executor::{Executor, NO_URLS_FOUND};
pub use plan::ExecutionPlan;
pub use service::{SubmittedTask, TaskService};
pub use task_manager::TaskManager;
pub use worker_pool::WorkerPool;
