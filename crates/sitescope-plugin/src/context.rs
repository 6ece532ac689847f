//! Per-invocation context handed to a plugin.

use sitescope_core::{CrawlFragment, Progress};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Something a running plugin publishes before it returns.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginReport {
    /// Advisory progress counters
    Progress(Progress),
    /// Incremental crawl output
    Fragment(CrawlFragment),
}

/// Sending half of a plugin's report channel.
///
/// Sends never block and never fail from the plugin's point of view: once the
/// receiver is gone, reports are dropped.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<PluginReport>>,
}

impl Reporter {
    /// Create a reporter and the receiver the executor drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PluginReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that discards everything.
    #[must_use]
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Publish progress.
    pub fn progress(&self, current: u64, total: Option<u64>) {
        self.send(PluginReport::Progress(Progress {
            current: Some(current),
            total,
        }));
    }

    /// Publish a crawl fragment.
    pub fn fragment(&self, fragment: CrawlFragment) {
        self.send(PluginReport::Fragment(fragment));
    }

    fn send(&self, report: PluginReport) {
        if let Some(tx) = &self.tx {
            if tx.send(report).is_err() {
                tracing::trace!("plugin report dropped: receiver closed");
            }
        }
    }
}

/// Cancellation, deadline and reporting for one plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginContext {
    cancellation: CancellationToken,
    deadline: Instant,
    reporter: Reporter,
}

impl PluginContext {
    /// Build a context.
    #[must_use]
    pub fn new(cancellation: CancellationToken, deadline: Instant, reporter: Reporter) -> Self {
        Self {
            cancellation,
            deadline,
            reporter,
        }
    }

    /// A context with its own token, a deadline `timeout` from now and no reporter.
    #[must_use]
    pub fn detached(timeout: Duration) -> Self {
        Self::new(
            CancellationToken::new(),
            Instant::now() + timeout,
            Reporter::disconnected(),
        )
    }

    /// Token that fires when the task is cancelled or hits its deadline.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the invocation has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Effective deadline: the earlier of the plugin timeout and the task deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Reporter for progress and fragments.
    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}
