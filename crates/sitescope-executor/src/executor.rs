//! Phased task execution.
//!
//! A task runs in four fixed phases:
//!
//! 1. **Base**: `website_info`, `domain_info`, `ssl_info`, `tech_stack` and
//!    the `crawler`, all concurrently, joined before phase 2
//! 2. **Audit**: one `lighthouse` run fanned out into one module per facet
//! 3. **Link health**: checks the URLs the crawler found
//! 4. **Synthesis**: `ai_analysis` over the completed modules, once every
//!    other module is terminal
//!
//! Every plugin failure stays inside its module. The task completes if at
//! least one module completed and fails otherwise; credits for the work that
//! was delivered are settled, everything else is discarded.

use crate::error::Result;
use crate::invoke::{invoke, ReportSink, TaskScope};
use crate::plan::ExecutionPlan;
use crate::synthesis::build_context;
use crate::task_manager::TaskManager;
use futures::future::join_all;
use sitescope_core::{
    AuditFacet, AuditReport, CrawlReport, ExecutorConfig, LinkHealthReport, LinkSummary, Module,
    Progress, ResultSlice, RunStatus, Task, TaskId,
};
use sitescope_ledger::CreditLedger;
use sitescope_plugin::{
    names, ErrorClass, PhaseInput, PluginError, PluginInput, PluginOutput, PluginRegistry,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Message recorded on `link_health` when there is nothing to check.
pub const NO_URLS_FOUND: &str = "no URLs found";

/// Runs tasks through the four analysis phases.
pub struct Executor {
    registry: PluginRegistry,
    tasks: Arc<TaskManager>,
    ledger: Arc<CreditLedger>,
    config: ExecutorConfig,
}

impl Executor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        registry: PluginRegistry,
        tasks: Arc<TaskManager>,
        ledger: Arc<CreditLedger>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            tasks,
            ledger,
            config,
        }
    }

    /// Task state used by this executor.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Run a pending task to a terminal status and settle its credits.
    ///
    /// Tasks that are already terminal are returned unchanged.
    ///
    /// # Errors
    /// Only persistence failures at the start or end of the run surface here;
    /// plugin failures are recorded on their modules.
    pub async fn execute(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.tasks.get_task(task_id).await?;
        if task.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "Task already finished");
            return Ok(task);
        }

        let task = self
            .tasks
            .update_status(task_id, RunStatus::Running, None)
            .await?;
        let plan = ExecutionPlan::from_options(&task.options);
        info!(
            task_id = %task_id,
            target_url = %task.target_url,
            modules = ?plan.module_names(),
            "Starting task"
        );

        let deadline = self.config.task_deadline();
        let scope = TaskScope::new(deadline);
        let run = self.run_phases(&task, &plan, &scope);
        if tokio::time::timeout(deadline, run).await.is_err() {
            scope.cancel.cancel();
            warn!(task_id = %task_id, deadline = ?deadline, "Task deadline exceeded");
            let reason = format!("task deadline exceeded after {}s", deadline.as_secs());
            return self.abort(task_id, &reason).await;
        }

        self.finalize(task_id, &plan).await
    }

    /// Fail a task that cannot run to completion: every unfinished module
    /// fails with `reason`, the task fails, and its reservations are
    /// discarded.
    pub async fn abort(&self, task_id: &TaskId, reason: &str) -> Result<Task> {
        for module in self.tasks.list_modules(task_id).await? {
            if !module.status.is_terminal() {
                self.set_module(task_id, &module.name, RunStatus::Failed, Some(reason))
                    .await;
            }
        }

        let task = self
            .tasks
            .update_status(task_id, RunStatus::Failed, Some(reason.to_string()))
            .await?;
        self.discard(task_id, None).await;
        Ok(task)
    }

    async fn run_phases(&self, task: &Task, plan: &ExecutionPlan, scope: &TaskScope) {
        // Phase 1: base, concurrently
        let mut units: Vec<_> = plan
            .base
            .iter()
            .map(|plugin| {
                self.run_module(
                    task,
                    *plugin,
                    PhaseInput::Base,
                    self.config.default_plugin_timeout(),
                    scope,
                )
            })
            .collect();
        if let Some(deep) = plan.crawl {
            units.push(self.run_module(
                task,
                names::CRAWLER,
                PhaseInput::Crawl { deep },
                self.config.default_plugin_timeout(),
                scope,
            ));
        }
        let completed = join_all(units).await.into_iter().filter(|ok| *ok).count();
        debug!(task_id = %task.id, completed, "Base phase finished");

        // Phase 2: audit
        if !plan.audit_facets.is_empty() {
            self.run_audit(task, &plan.audit_facets, scope).await;
        }

        // Phase 3: link health
        if plan.link_health {
            self.run_link_health(task, scope).await;
        }

        // Phase 4: synthesis
        if plan.synthesis {
            self.run_synthesis(task, plan, scope).await;
        }
    }

    /// Run a plugin that owns exactly one module of the same name. Returns
    /// whether the module completed.
    async fn run_module(
        &self,
        task: &Task,
        plugin_name: &'static str,
        phase: PhaseInput,
        default_timeout: Duration,
        scope: &TaskScope,
    ) -> bool {
        let task_id = &task.id;
        let modules = [plugin_name.to_string()];
        if !self
            .set_module(task_id, plugin_name, RunStatus::Running, None)
            .await
        {
            return false;
        }

        let plugin = match self.registry.get(plugin_name) {
            Ok(plugin) => plugin,
            Err(e) => {
                let message = e.to_string();
                self.set_module(task_id, plugin_name, RunStatus::Failed, Some(&message))
                    .await;
                return false;
            }
        };

        let deep = matches!(phase, PhaseInput::Crawl { deep: true });
        let timeout = plugin.timeout().unwrap_or(default_timeout);
        let sink = ReportSink {
            tasks: &self.tasks,
            task_id,
            modules: &modules,
        };
        let outcome = invoke(plugin, plugin_input(task, phase), timeout, scope, &sink).await;

        match outcome.and_then(|output| {
            let progress = output.progress;
            slice_for(plugin_name, output, deep).map(|slice| (slice, progress))
        }) {
            Ok((slice, progress)) => {
                self.complete_with(task_id, plugin_name, slice, progress)
                    .await
            }
            Err(e) => self.absorb_failure(task_id, plugin_name, &e).await,
        }
    }

    async fn run_audit(
        &self,
        task: &Task,
        facets: &BTreeSet<AuditFacet>,
        scope: &TaskScope,
    ) {
        let task_id = &task.id;
        let modules: Vec<String> = facets.iter().map(|f| f.as_str().to_string()).collect();
        for module in &modules {
            self.set_module(task_id, module, RunStatus::Running, None)
                .await;
        }

        let plugin = match self.registry.get(names::LIGHTHOUSE) {
            Ok(plugin) => plugin,
            Err(e) => {
                let message = e.to_string();
                for module in &modules {
                    self.set_module(task_id, module, RunStatus::Failed, Some(&message))
                        .await;
                }
                return;
            }
        };

        let timeout = plugin.timeout().unwrap_or(self.config.audit_timeout());
        let sink = ReportSink {
            tasks: &self.tasks,
            task_id,
            modules: &modules,
        };
        let phase = PhaseInput::Audit {
            facets: facets.clone(),
        };
        let outcome = invoke(plugin, plugin_input(task, phase), timeout, scope, &sink)
            .await
            .and_then(|output| {
                let progress = output.progress;
                output
                    .decode::<AuditReport>()
                    .map(|report| (report, progress))
            });

        match outcome {
            Ok((report, progress)) => {
                for facet in facets {
                    let name = facet.as_str();
                    match report.facet(*facet) {
                        Some(value) => {
                            let slice = ResultSlice::Audit {
                                facet: *facet,
                                report: value.clone(),
                            };
                            self.complete_with(task_id, name, slice, progress).await;
                        }
                        None => {
                            let err =
                                PluginError::Contract(format!("audit returned no {name} report"));
                            self.absorb_failure(task_id, name, &err).await;
                        }
                    }
                }
            }
            Err(e) => {
                for module in &modules {
                    self.absorb_failure(task_id, module, &e).await;
                }
            }
        }
    }

    async fn run_link_health(&self, task: &Task, scope: &TaskScope) {
        let task_id = &task.id;
        let current = match self.tasks.get_task(task_id).await {
            Ok(current) => current,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load crawl results");
                let message = e.to_string();
                self.set_module(task_id, names::LINK_HEALTH, RunStatus::Failed, Some(&message))
                    .await;
                return;
            }
        };

        let crawled = current
            .module(names::CRAWLER)
            .is_some_and(|m| m.status == RunStatus::Completed);
        let mut urls = match (crawled, current.results.crawl) {
            (true, Some(crawl)) => crawl.urls,
            _ => Vec::new(),
        };
        if urls.is_empty() {
            warn!(task_id = %task_id, "No URLs to check for link health");
            self.set_module(
                task_id,
                names::LINK_HEALTH,
                RunStatus::Failed,
                Some(NO_URLS_FOUND),
            )
            .await;
            return;
        }

        let cap = self.config.max_link_health_urls;
        if urls.len() > cap {
            info!(task_id = %task_id, found = urls.len(), cap, "Capping link health URLs");
            urls.truncate(cap);
        }

        self.run_module(
            task,
            names::LINK_HEALTH,
            PhaseInput::LinkHealth { urls },
            self.config.default_plugin_timeout(),
            scope,
        )
        .await;
    }

    async fn run_synthesis(&self, task: &Task, plan: &ExecutionPlan, scope: &TaskScope) {
        let task_id = &task.id;
        let others: Vec<String> = plan
            .module_names()
            .into_iter()
            .filter(|m| m != names::AI_ANALYSIS)
            .collect();

        match self
            .tasks
            .wait_for_modules(task_id, &others, self.config.synthesis_wait(), &scope.cancel)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(task_id = %task_id, "Synthesis starting before every module finished");
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Synthesis barrier failed"),
        }

        let current = match self.tasks.get_task(task_id).await {
            Ok(current) => current,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load results for synthesis");
                let message = e.to_string();
                self.set_module(task_id, names::AI_ANALYSIS, RunStatus::Failed, Some(&message))
                    .await;
                return;
            }
        };

        if others.iter().all(|m| {
            current
                .module(m)
                .map_or(true, |module| module.status != RunStatus::Completed)
        }) {
            let err =
                PluginError::MissingDependency("no completed modules to synthesize".to_string());
            self.set_module(task_id, names::AI_ANALYSIS, RunStatus::Running, None)
                .await;
            self.absorb_failure(task_id, names::AI_ANALYSIS, &err).await;
            return;
        }

        let phase = PhaseInput::Synthesis {
            ai_mode: current.ai_mode,
            context: build_context(&current),
        };
        self.run_module(
            task,
            names::AI_ANALYSIS,
            phase,
            self.config.synthesis_timeout(),
            scope,
        )
        .await;
    }

    /// Drive the task to its terminal status and settle or discard credits.
    async fn finalize(&self, task_id: &TaskId, plan: &ExecutionPlan) -> Result<Task> {
        let task = self.tasks.get_task(task_id).await?;

        let mut modules: Vec<&Module> = task.modules.values().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        for module in modules.iter().filter(|m| !m.status.is_terminal()) {
            self.set_module(
                task_id,
                &module.name,
                RunStatus::Failed,
                Some("module did not finish"),
            )
            .await;
        }

        let failed: Vec<&Module> = modules
            .iter()
            .copied()
            .filter(|m| m.status != RunStatus::Completed)
            .collect();
        let completed = modules.len() - failed.len();

        if completed > 0 {
            let task = self
                .tasks
                .update_status(task_id, RunStatus::Completed, None)
                .await?;

            let unearned: Vec<String> = failed
                .iter()
                .filter_map(|m| plan.feature_for_module(&m.name))
                .map(|feature| feature.as_str().to_string())
                .collect();
            if !unearned.is_empty() {
                self.discard(task_id, Some(unearned.as_slice())).await;
            }
            match self.ledger.settle_task_credits(task_id).await {
                Ok(settlement) => debug!(
                    task_id = %task_id,
                    records = settlement.records_settled,
                    debited = settlement.balance_debited,
                    "Credits settled"
                ),
                Err(e) => error!(task_id = %task_id, error = %e, "Failed to settle credits"),
            }

            info!(task_id = %task_id, completed, failed = failed.len(), "Task completed");
            Ok(task)
        } else {
            let message = failed
                .iter()
                .map(|m| {
                    format!(
                        "{}: {}",
                        m.name,
                        m.error.as_deref().unwrap_or("module did not finish")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            let task = self
                .tasks
                .update_status(task_id, RunStatus::Failed, Some(message))
                .await?;
            self.discard(task_id, None).await;

            info!(task_id = %task_id, "Task failed: every module failed");
            Ok(task)
        }
    }

    async fn complete_with(
        &self,
        task_id: &TaskId,
        module: &str,
        slice: ResultSlice,
        progress: Option<Progress>,
    ) -> bool {
        if let Err(e) = self.tasks.merge_partial_results(task_id, module, slice).await {
            error!(task_id = %task_id, module, error = %e, "Failed to merge result");
            let message = format!("failed to store result: {e}");
            self.set_module(task_id, module, RunStatus::Failed, Some(&message))
                .await;
            return false;
        }
        if let Some(progress) = progress {
            if let Err(e) = self
                .tasks
                .update_module_progress(task_id, module, progress.current, progress.total)
                .await
            {
                debug!(task_id = %task_id, module, error = %e, "Final progress not recorded");
            }
        }
        self.set_module(task_id, module, RunStatus::Completed, None)
            .await
    }

    /// Record a plugin failure on its module according to its class.
    /// Returns whether the module counts as completed.
    async fn absorb_failure(&self, task_id: &TaskId, module: &str, err: &PluginError) -> bool {
        let message = err.to_string();
        match err.class() {
            ErrorClass::Ignorable => {
                warn!(
                    task_id = %task_id,
                    module,
                    error = %message,
                    "Nothing to report; completing module"
                );
                self.set_module(task_id, module, RunStatus::Completed, Some(&message))
                    .await
            }
            class => {
                warn!(task_id = %task_id, module, class = ?class, error = %message, "Module failed");
                self.set_module(task_id, module, RunStatus::Failed, Some(&message))
                    .await;
                false
            }
        }
    }

    /// Update a module's status, logging instead of propagating failures.
    /// Returns whether the module now has `status`.
    async fn set_module(
        &self,
        task_id: &TaskId,
        module: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> bool {
        match self
            .tasks
            .update_module_status(task_id, module, status, error.map(str::to_string))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(
                    task_id = %task_id,
                    module,
                    status = %status,
                    error = %e,
                    "Failed to update module"
                );
                false
            }
        }
    }

    async fn discard(&self, task_id: &TaskId, features: Option<&[String]>) {
        match self.ledger.delete_unsettled_records(task_id, features).await {
            Ok(0) => {}
            Ok(discarded) => info!(task_id = %task_id, discarded, "Discarded reservations"),
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to discard reservations"),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn plugin_input(task: &Task, phase: PhaseInput) -> PluginInput {
    PluginInput {
        task_id: task.id.clone(),
        target_url: task.target_url.clone(),
        language: task.language.clone(),
        phase,
    }
}

/// Turn a single-module plugin's output into the slice it owns.
fn slice_for(
    plugin: &str,
    output: PluginOutput,
    deep: bool,
) -> std::result::Result<ResultSlice, PluginError> {
    let slice = match plugin {
        names::WEBSITE_INFO => ResultSlice::WebsiteInfo(output.payload),
        names::DOMAIN_INFO => ResultSlice::DomainInfo(output.payload),
        names::SSL_INFO => ResultSlice::SslInfo(output.payload),
        names::TECH_STACK => ResultSlice::TechStack(output.payload),
        names::AI_ANALYSIS => ResultSlice::AiAnalysis(output.payload),
        names::CRAWLER => {
            let report: CrawlReport = output.decode()?;
            let summary = if deep {
                LinkSummary::from_pages(&report.pages)
            } else {
                None
            };
            ResultSlice::Crawl { report, summary }
        }
        names::LINK_HEALTH => {
            let report: LinkHealthReport = output.decode()?;
            ResultSlice::LinkHealth {
                summary: LinkSummary::from_checks(&report.links),
                report,
            }
        }
        other => {
            return Err(PluginError::Contract(format!(
                "plugin {other} has no result slice"
            )))
        }
    };
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slice_for_crawler_summarizes_deep_pages_only() {
        let output = PluginOutput::success(json!({
            "urls": ["https://example.com/a"],
            "pages": [{"url": "https://example.com/a", "status_code": 200, "latency_ms": 12}],
        }));

        match slice_for(names::CRAWLER, output.clone(), true).unwrap() {
            ResultSlice::Crawl { summary, .. } => assert_eq!(summary.unwrap().alive, 1),
            other => panic!("unexpected slice {other:?}"),
        }
        match slice_for(names::CRAWLER, output, false).unwrap() {
            ResultSlice::Crawl { summary, .. } => assert!(summary.is_none()),
            other => panic!("unexpected slice {other:?}"),
        }
    }

    #[test]
    fn test_slice_for_rejects_bad_shapes() {
        let output = PluginOutput::success(json!({"links": "not a list"}));
        assert!(matches!(
            slice_for(names::LINK_HEALTH, output, false),
            Err(PluginError::Contract(_))
        ));
        assert!(matches!(
            slice_for(names::LIGHTHOUSE, PluginOutput::success(json!({})), false),
            Err(PluginError::Contract(_))
        ));
    }
}
