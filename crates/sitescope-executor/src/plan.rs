//! Mapping from a task's analysis options to the plugins each phase runs.

use sitescope_core::{AnalysisOption, AuditFacet};
use sitescope_plugin::names;
use std::collections::BTreeSet;

/// What the executor will run for one task, phase by phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Base-phase plugins other than the crawler; each owns a module of the
    /// same name
    pub base: Vec<&'static str>,
    /// Link discovery: `Some(deep)` when the crawler runs
    pub crawl: Option<bool>,
    /// Audit facets; each owns a module named after the facet
    pub audit_facets: BTreeSet<AuditFacet>,
    /// Whether the link-health phase runs
    pub link_health: bool,
    /// Whether the synthesis phase runs
    pub synthesis: bool,
}

impl ExecutionPlan {
    /// Plan the phases for `options`.
    ///
    /// A deep crawl already measures every page it visits, so a separate
    /// link-health run is planned only when `deep_crawl` was not selected.
    #[must_use]
    pub fn from_options(options: &BTreeSet<AnalysisOption>) -> Self {
        let has = |option| options.contains(&option);

        let base = [
            (AnalysisOption::WebsiteInfo, names::WEBSITE_INFO),
            (AnalysisOption::DomainInfo, names::DOMAIN_INFO),
            (AnalysisOption::SslInfo, names::SSL_INFO),
            (AnalysisOption::TechStack, names::TECH_STACK),
        ]
        .into_iter()
        .filter(|(option, _)| has(*option))
        .map(|(_, plugin)| plugin)
        .collect();

        let deep = has(AnalysisOption::DeepCrawl);
        let crawl = (deep || has(AnalysisOption::LinkHealth)).then_some(deep);

        Self {
            base,
            crawl,
            audit_facets: options.iter().filter_map(|o| o.audit_facet()).collect(),
            link_health: has(AnalysisOption::LinkHealth) && !deep,
            synthesis: has(AnalysisOption::AiAnalysis),
        }
    }

    /// Whether the crawler runs in deep mode.
    #[must_use]
    pub fn is_deep_crawl(&self) -> bool {
        self.crawl == Some(true)
    }

    /// Every module the task tracks, in phase order.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.base.iter().map(|p| (*p).to_string()).collect();
        if self.crawl.is_some() {
            modules.push(names::CRAWLER.to_string());
        }
        modules.extend(self.audit_facets.iter().map(|f| f.as_str().to_string()));
        if self.link_health {
            modules.push(names::LINK_HEALTH.to_string());
        }
        if self.synthesis {
            modules.push(names::AI_ANALYSIS.to_string());
        }
        modules
    }

    /// Plugins that must be registered to run this plan.
    #[must_use]
    pub fn required_plugins(&self) -> Vec<&'static str> {
        let mut plugins = self.base.clone();
        if self.crawl.is_some() {
            plugins.push(names::CRAWLER);
        }
        if !self.audit_facets.is_empty() {
            plugins.push(names::LIGHTHOUSE);
        }
        if self.link_health {
            plugins.push(names::LINK_HEALTH);
        }
        if self.synthesis {
            plugins.push(names::AI_ANALYSIS);
        }
        plugins
    }

    /// Feature codes to reserve credits for: one per planned module that
    /// maps to a feature.
    #[must_use]
    pub fn billable_features(&self) -> Vec<String> {
        self.module_names()
            .iter()
            .filter_map(|module| self.feature_for_module(module))
            .map(|option| option.as_str().to_string())
            .collect()
    }

    /// The billing feature a module's work is charged under.
    ///
    /// A plain link-discovery crawl is part of `link_health` and has no
    /// feature of its own.
    #[must_use]
    pub fn feature_for_module(&self, module: &str) -> Option<AnalysisOption> {
        match module {
            names::CRAWLER => self.is_deep_crawl().then_some(AnalysisOption::DeepCrawl),
            other => other.parse().ok(),
        }
    }
}
