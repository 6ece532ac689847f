//! Running a single plugin invocation.
//!
//! The plugin runs on its own tokio task so that a panic surfaces as a
//! `JoinError` instead of unwinding through the executor. While it runs, its
//! progress reports and crawl fragments are drained into the task.

use crate::task_manager::TaskManager;
use sitescope_core::TaskId;
use sitescope_plugin::{
    Plugin, PluginContext, PluginError, PluginInput, PluginOutput, PluginReport, Reporter,
};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Where a running plugin's reports land.
pub(crate) struct ReportSink<'a> {
    pub tasks: &'a TaskManager,
    pub task_id: &'a TaskId,
    /// Modules whose progress the reports update
    pub modules: &'a [String],
}

impl ReportSink<'_> {
    async fn apply(&self, report: PluginReport) {
        match report {
            PluginReport::Progress(progress) => {
                for module in self.modules {
                    let (current, total) = (progress.current, progress.total);
                    if let Err(e) = self
                        .tasks
                        .update_module_progress(self.task_id, module, current, total)
                        .await
                    {
                        debug!(task_id = %self.task_id, module, error = %e, "Progress not recorded");
                    }
                }
            }
            PluginReport::Fragment(fragment) => {
                if let Err(e) = self
                    .tasks
                    .append_streaming_fragment(self.task_id, &fragment)
                    .await
                {
                    error!(task_id = %self.task_id, error = %e, "Failed to append crawl fragment");
                }
            }
        }
    }
}

/// Cancellation and deadline shared by every invocation of one task run.
pub(crate) struct TaskScope {
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl TaskScope {
    pub fn new(budget: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Instant::now() + budget,
        }
    }
}

/// Aborts the plugin task if the invocation is dropped or gives up on it.
struct AbortOnDrop(JoinHandle<Result<PluginOutput, PluginError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `plugin` once with `input`.
///
/// The call ends with the plugin's output, or with a [`PluginError`] when the
/// input is invalid, the plugin fails, breaks the output contract, panics,
/// exceeds `timeout`, or the scope is cancelled. The plugin sees the earlier
/// of its own timeout and the task deadline as its deadline.
pub(crate) async fn invoke(
    plugin: Arc<dyn Plugin>,
    input: PluginInput,
    timeout: Duration,
    scope: &TaskScope,
    sink: &ReportSink<'_>,
) -> Result<PluginOutput, PluginError> {
    input.validate()?;

    let name = plugin.name().to_string();
    debug!(
        plugin = %name,
        timeout = ?timeout,
        is_async = plugin.is_async(),
        dependencies = ?plugin.dependencies(),
        "Invoking plugin"
    );

    let token = scope.cancel.child_token();
    let (reporter, mut reports) = Reporter::channel();
    let deadline = (Instant::now() + timeout).min(scope.deadline);
    let ctx = PluginContext::new(token.clone(), deadline, reporter);
    let mut handle = AbortOnDrop(tokio::spawn(async move {
        plugin.execute(&ctx, input).await
    }));

    let expiry = tokio::time::sleep(timeout);
    tokio::pin!(expiry);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(report) = reports.recv() => sink.apply(report).await,
            joined = &mut handle.0 => break joined_outcome(joined),
            () = scope.cancel.cancelled() => break Err(PluginError::Cancelled),
            () = &mut expiry => break Err(PluginError::Timeout(timeout)),
        }
    };
    token.cancel();
    drop(handle);

    // Reports sent before the plugin finished still count.
    reports.close();
    while let Ok(report) = reports.try_recv() {
        sink.apply(report).await;
    }

    match &outcome {
        Ok(_) => debug!(plugin = %name, "Plugin returned"),
        Err(e) => debug!(plugin = %name, error = %e, class = ?e.class(), "Plugin failed"),
    }
    outcome.and_then(PluginOutput::into_result)
}

fn joined_outcome(
    joined: Result<Result<PluginOutput, PluginError>, JoinError>,
) -> Result<PluginOutput, PluginError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PluginError::Panicked(panic_message(&*e.into_panic()))),
        Err(_) => Err(PluginError::Cancelled),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
