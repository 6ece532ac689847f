//! Real-time task events.
//!
//! Every state change the [`TaskManager`](crate::TaskManager) commits is
//! published on a `tokio::sync::broadcast` channel. Events are sent after the
//! write commits, so a subscriber that re-reads the task always sees at least
//! the state the event describes.

use serde::Serialize;
use sitescope_core::{Progress, RunStatus, TaskId};

/// A committed change to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The task moved to a new status
    TaskStatusChanged {
        /// Task
        task_id: TaskId,
        /// New status
        status: RunStatus,
        /// Task error, when it failed
        error: Option<String>,
    },
    /// A module moved to a new status
    ModuleStatusChanged {
        /// Task
        task_id: TaskId,
        /// Module name
        module: String,
        /// New status
        status: RunStatus,
        /// Failure message or absorbed warning
        error: Option<String>,
    },
    /// A module reported progress
    ModuleProgress {
        /// Task
        task_id: TaskId,
        /// Module name
        module: String,
        /// Latest counters
        progress: Progress,
    },
    /// A module's result slice was merged
    PartialResult {
        /// Task
        task_id: TaskId,
        /// Module that produced the slice
        module: String,
        /// Result fields written
        fields: Vec<String>,
    },
    /// Streamed crawl pages were appended
    FragmentAppended {
        /// Task
        task_id: TaskId,
        /// Pages in the fragment
        pages: usize,
        /// Distinct URLs known so far
        total_urls: usize,
    },
}

impl TaskEvent {
    /// The task this event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskStatusChanged { task_id, .. }
            | Self::ModuleStatusChanged { task_id, .. }
            | Self::ModuleProgress { task_id, .. }
            | Self::PartialResult { task_id, .. }
            | Self::FragmentAppended { task_id, .. } => task_id,
        }
    }

    /// Whether this is a module status change for `task_id`.
    #[must_use]
    pub fn is_module_status_of(&self, task_id: &TaskId) -> bool {
        matches!(self, Self::ModuleStatusChanged { task_id: id, .. } if id == task_id)
    }
}
