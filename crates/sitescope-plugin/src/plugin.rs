//! The plugin contract.

use crate::context::PluginContext;
use crate::error::PluginError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sitescope_core::{AiMode, AuditFacet, Progress, TaskId};
use std::collections::BTreeSet;
use std::time::Duration;

/// Names of the plugins the executor schedules.
pub mod names {
    /// HTML metadata
    pub const WEBSITE_INFO: &str = "website_info";
    /// DNS / WHOIS facts
    pub const DOMAIN_INFO: &str = "domain_info";
    /// TLS certificate inspection
    pub const SSL_INFO: &str = "ssl_info";
    /// Technology fingerprinting
    pub const TECH_STACK: &str = "tech_stack";
    /// Link discovery, and the streaming deep crawl
    pub const CRAWLER: &str = "crawler";
    /// Page audit producing the four audit facets
    pub const LIGHTHOUSE: &str = "lighthouse";
    /// Availability check of discovered URLs
    pub const LINK_HEALTH: &str = "link_health";
    /// AI synthesis
    pub const AI_ANALYSIS: &str = "ai_analysis";
}

/// A named unit of analysis work.
///
/// Implementations must be thread-safe: the executor shares one instance
/// across every task and runs it on its own tokio task per invocation.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Run the plugin once.
    ///
    /// Implementations should watch `ctx.cancellation()` during long waits and
    /// publish progress or crawl fragments through `ctx.reporter()`.
    ///
    /// # Errors
    /// Returns a [`PluginError`] describing why no result was produced.
    async fn execute(
        &self,
        ctx: &PluginContext,
        input: PluginInput,
    ) -> Result<PluginOutput, PluginError>;

    /// Advisory: the plugin mostly waits on I/O.
    fn is_async(&self) -> bool {
        true
    }

    /// Plugin-declared timeout; `None` uses the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Names of plugins whose output this one consumes (informational).
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }
}

/// Phase-specific input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseInput {
    /// Base-phase plugins need only the target
    Base,
    /// Link discovery; `deep` streams pages with status and latency
    Crawl {
        /// Deep-crawl mode
        deep: bool,
    },
    /// One audit run for the requested facets
    Audit {
        /// Facets to produce
        facets: BTreeSet<AuditFacet>,
    },
    /// Availability check of the given URLs
    LinkHealth {
        /// URLs to check
        urls: Vec<String>,
    },
    /// AI synthesis over the completed modules' outputs
    Synthesis {
        /// Synthesis depth
        ai_mode: AiMode,
        /// Completed module outputs, keyed by result field
        context: JsonValue,
    },
}

/// Input to one plugin invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    /// Task being executed
    pub task_id: TaskId,
    /// Website under analysis
    pub target_url: String,
    /// Report language
    pub language: String,
    /// Phase-specific input
    pub phase: PhaseInput,
}

impl PluginInput {
    /// Check the input before it reaches a plugin.
    ///
    /// # Errors
    /// Returns `PluginError::InvalidInput` if the target URL is not an http(s)
    /// URL, the language is blank, or the phase input is empty.
    pub fn validate(&self) -> Result<(), PluginError> {
        sitescope_core::task::validate_target_url(&self.target_url)
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;

        if self.language.trim().is_empty() {
            return Err(PluginError::InvalidInput(
                "language must not be blank".to_string(),
            ));
        }

        match &self.phase {
            PhaseInput::Audit { facets } if facets.is_empty() => Err(PluginError::InvalidInput(
                "audit requires at least one facet".to_string(),
            )),
            PhaseInput::LinkHealth { urls } if urls.is_empty() => Err(
                PluginError::InvalidInput("link health requires at least one URL".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Output of one plugin invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    /// Whether the plugin produced a usable result
    pub success: bool,
    /// Result payload
    #[serde(default)]
    pub payload: JsonValue,
    /// Failure message; required when `success` is false
    #[serde(default)]
    pub error: Option<String>,
    /// Final progress snapshot
    #[serde(default)]
    pub progress: Option<Progress>,
}

impl PluginOutput {
    /// A successful output.
    #[must_use]
    pub fn success(payload: JsonValue) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            progress: None,
        }
    }

    /// An unsuccessful output carrying `error`.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: JsonValue::Null,
            error: Some(error.into()),
            progress: None,
        }
    }

    /// Attach a progress snapshot.
    #[must_use]
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Enforce the output contract and turn an unsuccessful output into its error.
    ///
    /// # Errors
    /// - `PluginError::Contract` for `success = false` without an error message
    /// - `PluginError::Failed` carrying the plugin's message otherwise
    pub fn into_result(self) -> Result<Self, PluginError> {
        if self.success {
            return Ok(self);
        }
        match self.error.as_deref().map(str::trim) {
            Some(message) if !message.is_empty() => Err(PluginError::Failed(message.to_string())),
            _ => Err(PluginError::Contract(
                "unsuccessful output without an error message".to_string(),
            )),
        }
    }

    /// Decode the payload into the type downstream aggregation expects.
    ///
    /// # Errors
    /// Returns `PluginError::Contract` if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| PluginError::Contract(format!("unexpected payload shape: {e}")))
    }
}
