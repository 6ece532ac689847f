//! Task and Module records and the status state machine they share.
//!
//! A [`Task`] is one scan job against a target website. Every plugin that runs
//! for the task owns a [`Module`] entry tracking its own status, progress and
//! error. Both use [`RunStatus`]:
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │           │
//!    │           └──────► Failed
//!    └──► Completed | Failed   (skipped / aborted before starting)
//! ```
//!
//! `Completed` and `Failed` are terminal.

use crate::error::{SiteScopeError, StatusTransitionError};
use crate::results::{AuditFacet, TaskResults};
use crate::types::{TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a Task or a Module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started yet
    Pending,
    /// Work in progress
    Running,
    /// Finished with a usable result
    Completed,
    /// Finished without a usable result
    Failed,
}

impl RunStatus {
    /// Returns the set of statuses reachable from the current one.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Completed, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Check whether moving to `target` is allowed.
    #[must_use]
    pub fn can_transition_to(self, target: RunStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Validate a transition, returning the typed error when it is not allowed.
    pub fn transition_to(self, target: RunStatus) -> Result<RunStatus, StatusTransitionError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(StatusTransitionError {
                from: self,
                to: target,
            })
        }
    }

    /// Whether this status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SiteScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SiteScopeError::Validation(format!(
                "unknown status '{other}'"
            ))),
        }
    }
}

/// An analysis a caller can request for a target.
///
/// The snake-case name doubles as the billing feature code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOption {
    /// HTML metadata: title, description, headings, social tags
    WebsiteInfo,
    /// DNS records, WHOIS, network facts
    DomainInfo,
    /// TLS certificate inspection
    SslInfo,
    /// Technology fingerprinting
    TechStack,
    /// Page audit: performance metrics
    Performance,
    /// Page audit: SEO checks
    Seo,
    /// Page audit: security checks
    Security,
    /// Page audit: accessibility checks
    Accessibility,
    /// Availability check of the URLs the crawler discovered
    LinkHealth,
    /// Deep crawl that streams pages and their status as it goes
    DeepCrawl,
    /// AI synthesis over every other module's output
    AiAnalysis,
}

impl AnalysisOption {
    /// Every option, in declaration order.
    pub const ALL: [AnalysisOption; 11] = [
        Self::WebsiteInfo,
        Self::DomainInfo,
        Self::SslInfo,
        Self::TechStack,
        Self::Performance,
        Self::Seo,
        Self::Security,
        Self::Accessibility,
        Self::LinkHealth,
        Self::DeepCrawl,
        Self::AiAnalysis,
    ];

    /// Feature code used for pricing and usage records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebsiteInfo => "website_info",
            Self::DomainInfo => "domain_info",
            Self::SslInfo => "ssl_info",
            Self::TechStack => "tech_stack",
            Self::Performance => "performance",
            Self::Seo => "seo",
            Self::Security => "security",
            Self::Accessibility => "accessibility",
            Self::LinkHealth => "link_health",
            Self::DeepCrawl => "deep_crawl",
            Self::AiAnalysis => "ai_analysis",
        }
    }

    /// The audit sub-facet this option selects, if it is one.
    #[must_use]
    pub fn audit_facet(self) -> Option<AuditFacet> {
        match self {
            Self::Performance => Some(AuditFacet::Performance),
            Self::Seo => Some(AuditFacet::Seo),
            Self::Security => Some(AuditFacet::Security),
            Self::Accessibility => Some(AuditFacet::Accessibility),
            _ => None,
        }
    }

    /// Whether this option is served by the shared page-audit run.
    #[must_use]
    pub fn is_audit_facet(self) -> bool {
        self.audit_facet().is_some()
    }
}

impl fmt::Display for AnalysisOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisOption {
    type Err = SiteScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|option| option.as_str() == s)
            .ok_or_else(|| SiteScopeError::Validation(format!("unknown analysis option '{s}'")))
    }
}

/// How much effort the AI synthesis should spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    /// Short summary and scores
    #[default]
    Standard,
    /// Long-form report with recommendations
    Detailed,
}

impl AiMode {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Detailed => "detailed",
        }
    }
}

impl FromStr for AiMode {
    type Err = SiteScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "detailed" => Ok(Self::Detailed),
            other => Err(SiteScopeError::Validation(format!("unknown AI mode '{other}'"))),
        }
    }
}

/// Advisory progress counters reported by a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Units of work done so far
    pub current: Option<u64>,
    /// Expected units of work
    pub total: Option<u64>,
}

/// Per-plugin sub-state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name (the plugin name, or the audit facet name)
    pub name: String,
    /// Current status
    pub status: RunStatus,
    /// Advisory progress
    pub progress: Progress,
    /// Failure message, or the warning kept when an ignorable error was absorbed
    pub error: Option<String>,
    /// When the module started running
    pub started_at: Option<DateTime<Utc>>,
    /// When the module reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Module {
    /// A fresh pending module.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RunStatus::Pending,
            progress: Progress::default(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Request payload for a new task, as handed over by the request layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Website to analyze (http or https)
    pub target_url: String,
    /// Requested analyses
    pub options: BTreeSet<AnalysisOption>,
    /// Report language (BCP 47 tag, e.g. `en`)
    pub language: String,
    /// AI synthesis mode
    #[serde(default)]
    pub ai_mode: AiMode,
    /// Owning user; `None` for anonymous scans
    pub user_id: Option<UserId>,
    /// Whether the report may be shared publicly
    #[serde(default)]
    pub is_public: bool,
}

impl NewTask {
    /// Build a request with default language, AI mode and visibility.
    #[must_use]
    pub fn new(
        target_url: impl Into<String>,
        options: impl IntoIterator<Item = AnalysisOption>,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            options: options.into_iter().collect(),
            language: "en".to_string(),
            ai_mode: AiMode::default(),
            user_id: None,
            is_public: false,
        }
    }

    /// Set the owning user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Validate the request.
    ///
    /// # Errors
    /// Returns `SiteScopeError::Validation` if the URL is not an absolute
    /// http(s) URL with a host, no option was selected, or the language is blank.
    pub fn validate(&self) -> Result<(), SiteScopeError> {
        validate_target_url(&self.target_url)?;

        if self.options.is_empty() {
            return Err(SiteScopeError::Validation(
                "at least one analysis option must be selected".to_string(),
            ));
        }

        if self.language.trim().is_empty() {
            return Err(SiteScopeError::Validation(
                "language must not be blank".to_string(),
            ));
        }

        Ok(())
    }
}

/// Check that `target` is an absolute http(s) URL with a host.
pub fn validate_target_url(target: &str) -> Result<url::Url, SiteScopeError> {
    let parsed = url::Url::parse(target)
        .map_err(|e| SiteScopeError::Validation(format!("invalid target URL '{target}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SiteScopeError::Validation(format!(
            "invalid target URL '{target}': scheme must be http or https"
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(SiteScopeError::Validation(format!(
            "invalid target URL '{target}': missing host"
        )));
    }

    Ok(parsed)
}

/// One scan job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Website under analysis
    pub target_url: String,
    /// Requested analyses
    pub options: BTreeSet<AnalysisOption>,
    /// Report language
    pub language: String,
    /// AI synthesis mode
    pub ai_mode: AiMode,
    /// Owning user, if any
    pub user_id: Option<UserId>,
    /// Whether the report may be shared publicly
    pub is_public: bool,
    /// Current status
    pub status: RunStatus,
    /// Additive result aggregate
    pub results: TaskResults,
    /// Per-module state, keyed by module name
    pub modules: HashMap<String, Module>,
    /// Last error (the joined module errors when the task failed)
    pub error_message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Look up a module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Names of modules that finished with `Completed`, sorted.
    #[must_use]
    pub fn completed_modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .modules
            .values()
            .filter(|m| m.status == RunStatus::Completed)
            .map(|m| m.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}
