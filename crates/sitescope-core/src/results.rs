//! The per-task result aggregate.
//!
//! [`TaskResults`] is sparse and additive: every module owns one field (the
//! audit owns one field per facet, link health and the deep crawl also own the
//! rolled-up [`LinkSummary`]). Writers hand in a typed [`ResultSlice`] and
//! [`TaskResults::apply`] overwrites only the fields that slice owns, so
//! slices from different modules can be applied in any order without losing
//! each other's data.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;

/// One of the four facets produced by a single page-audit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFacet {
    /// Performance metrics
    Performance,
    /// SEO checks
    Seo,
    /// Security checks
    Security,
    /// Accessibility checks
    Accessibility,
}

impl AuditFacet {
    /// Module and result-field name of the facet.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Seo => "seo",
            Self::Security => "security",
            Self::Accessibility => "accessibility",
        }
    }
}

impl fmt::Display for AuditFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A page seen by the crawler. Status and latency are only known in deep mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawledPage {
    /// Absolute URL
    pub url: String,
    /// HTTP status, when the crawler fetched the page
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Response latency in milliseconds
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Output of the crawler plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlReport {
    /// Distinct URLs discovered
    #[serde(default)]
    pub urls: Vec<String>,
    /// Pages with fetch details (deep mode)
    #[serde(default)]
    pub pages: Vec<CrawledPage>,
    /// Set once the crawler returned its final report
    #[serde(default)]
    pub complete: bool,
}

impl CrawlReport {
    fn push_url(&mut self, seen: &mut HashSet<String>, url: &str) {
        if seen.insert(url.to_string()) {
            self.urls.push(url.to_string());
        }
    }
}

/// An incremental chunk of crawl output appended while the crawler runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlFragment {
    /// Newly crawled pages
    pub pages: Vec<CrawledPage>,
}

/// Availability result for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCheck {
    /// Checked URL
    pub url: String,
    /// Whether the URL answered with a non-error status
    pub alive: bool,
    /// HTTP status, if any response arrived
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Response latency in milliseconds
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Failure reason for dead links
    #[serde(default)]
    pub error: Option<String>,
}

/// Output of the link-health plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkHealthReport {
    /// One entry per checked URL
    #[serde(default)]
    pub links: Vec<LinkCheck>,
}

/// Rolled-up link statistics shared by link health and the deep crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSummary {
    /// Links counted
    pub total: u64,
    /// Links answering with a non-error status
    pub alive: u64,
    /// Links that failed or answered with an error status
    pub dead: u64,
    /// Mean latency over links that reported one
    pub average_latency_ms: f64,
    /// Number of latency samples behind the average
    #[serde(default)]
    pub latency_samples: u64,
}

impl LinkSummary {
    /// Build a summary from a full link-health report.
    #[must_use]
    pub fn from_checks(checks: &[LinkCheck]) -> Self {
        let mut summary = Self::default();
        for check in checks {
            summary.record(check.alive, check.latency_ms);
        }
        summary
    }

    /// Build a summary from the pages of a deep crawl that carry a status.
    #[must_use]
    pub fn from_pages(pages: &[CrawledPage]) -> Option<Self> {
        let mut summary = Self::default();
        for page in pages {
            summary.absorb_page(page);
        }
        (summary.total > 0).then_some(summary)
    }

    /// Fold one crawled page into the summary. Pages without a status are ignored.
    pub fn absorb_page(&mut self, page: &CrawledPage) {
        if let Some(status) = page.status_code {
            self.record(is_alive_status(status), page.latency_ms);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, alive: bool, latency_ms: Option<u64>) {
        self.total += 1;
        if alive {
            self.alive += 1;
        } else {
            self.dead += 1;
        }
        if let Some(latency) = latency_ms {
            let samples = self.latency_samples as f64;
            self.average_latency_ms =
                (self.average_latency_ms * samples + latency as f64) / (samples + 1.0);
            self.latency_samples += 1;
        }
    }
}

/// 2xx and 3xx count as alive.
#[must_use]
pub fn is_alive_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Output of the page-audit plugin: one report per requested facet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Performance facet
    #[serde(default)]
    pub performance: Option<JsonValue>,
    /// SEO facet
    #[serde(default)]
    pub seo: Option<JsonValue>,
    /// Security facet
    #[serde(default)]
    pub security: Option<JsonValue>,
    /// Accessibility facet
    #[serde(default)]
    pub accessibility: Option<JsonValue>,
}

impl AuditReport {
    /// The report for one facet, if the audit produced it.
    #[must_use]
    pub fn facet(&self, facet: AuditFacet) -> Option<&JsonValue> {
        match facet {
            AuditFacet::Performance => self.performance.as_ref(),
            AuditFacet::Seo => self.seo.as_ref(),
            AuditFacet::Security => self.security.as_ref(),
            AuditFacet::Accessibility => self.accessibility.as_ref(),
        }
    }
}

/// The typed partial result one module owns.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSlice {
    /// HTML metadata
    WebsiteInfo(JsonValue),
    /// DNS / WHOIS facts
    DomainInfo(JsonValue),
    /// TLS certificate facts
    SslInfo(JsonValue),
    /// Technology fingerprint
    TechStack(JsonValue),
    /// Final crawler report; the summary is present for deep crawls
    Crawl {
        /// Crawler report
        report: CrawlReport,
        /// Roll-up over crawled pages
        summary: Option<LinkSummary>,
    },
    /// One facet of the page audit
    Audit {
        /// Which facet
        facet: AuditFacet,
        /// Facet report
        report: JsonValue,
    },
    /// Link health details plus roll-up
    LinkHealth {
        /// Per-link results
        report: LinkHealthReport,
        /// Roll-up
        summary: LinkSummary,
    },
    /// AI synthesis report
    AiAnalysis(JsonValue),
}

impl ResultSlice {
    /// Names of the `TaskResults` fields this slice overwrites.
    #[must_use]
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::WebsiteInfo(_) => &["website_info"],
            Self::DomainInfo(_) => &["domain_info"],
            Self::SslInfo(_) => &["ssl_info"],
            Self::TechStack(_) => &["tech_stack"],
            Self::Crawl { summary: None, .. } => &["crawl"],
            Self::Crawl { .. } => &["crawl", "link_summary"],
            Self::Audit { facet, .. } => match facet {
                AuditFacet::Performance => &["performance"],
                AuditFacet::Seo => &["seo"],
                AuditFacet::Security => &["security"],
                AuditFacet::Accessibility => &["accessibility"],
            },
            Self::LinkHealth { .. } => &["link_health", "link_summary"],
            Self::AiAnalysis(_) => &["ai_analysis"],
        }
    }
}

/// Sparse, additive aggregate of every module's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    /// HTML metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_info: Option<JsonValue>,
    /// DNS / WHOIS facts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_info: Option<JsonValue>,
    /// TLS certificate facts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_info: Option<JsonValue>,
    /// Technology fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<JsonValue>,
    /// Crawler output, including streamed pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl: Option<CrawlReport>,
    /// Audit: performance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<JsonValue>,
    /// Audit: SEO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo: Option<JsonValue>,
    /// Audit: security
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<JsonValue>,
    /// Audit: accessibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<JsonValue>,
    /// Link health details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_health: Option<LinkHealthReport>,
    /// Rolled-up link statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_summary: Option<LinkSummary>,
    /// AI synthesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<JsonValue>,
}

impl TaskResults {
    /// Overwrite the field(s) owned by `slice`, leaving every other field untouched.
    pub fn apply(&mut self, slice: ResultSlice) {
        match slice {
            ResultSlice::WebsiteInfo(value) => self.website_info = Some(value),
            ResultSlice::DomainInfo(value) => self.domain_info = Some(value),
            ResultSlice::SslInfo(value) => self.ssl_info = Some(value),
            ResultSlice::TechStack(value) => self.tech_stack = Some(value),
            ResultSlice::Crawl { report, summary } => {
                self.crawl = Some(self.finish_crawl(report));
                if summary.is_some() {
                    self.link_summary = summary;
                }
            }
            ResultSlice::Audit { facet, report } => match facet {
                AuditFacet::Performance => self.performance = Some(report),
                AuditFacet::Seo => self.seo = Some(report),
                AuditFacet::Security => self.security = Some(report),
                AuditFacet::Accessibility => self.accessibility = Some(report),
            },
            ResultSlice::LinkHealth { report, summary } => {
                self.link_health = Some(report);
                self.link_summary = Some(summary);
            }
            ResultSlice::AiAnalysis(value) => self.ai_analysis = Some(value),
        }
    }

    /// Append streamed crawl pages, extending the URL list and the roll-up.
    ///
    /// Only `crawl` and `link_summary` change.
    pub fn append_fragment(&mut self, fragment: &CrawlFragment) {
        let crawl = self.crawl.get_or_insert_with(CrawlReport::default);
        let mut seen: HashSet<String> = crawl.urls.iter().cloned().collect();
        for page in &fragment.pages {
            crawl.push_url(&mut seen, &page.url);
            crawl.pages.push(page.clone());
        }

        for page in fragment.pages.iter().filter(|p| p.status_code.is_some()) {
            self.link_summary
                .get_or_insert_with(LinkSummary::default)
                .absorb_page(page);
        }
    }

    // The final report wins for URLs; streamed pages survive when the final
    // report carries none.
    fn finish_crawl(&self, mut report: CrawlReport) -> CrawlReport {
        if let Some(existing) = &self.crawl {
            let mut seen: HashSet<String> = report.urls.iter().cloned().collect();
            for url in &existing.urls {
                report.push_url(&mut seen, url);
            }
            if report.pages.is_empty() {
                report.pages.clone_from(&existing.pages);
            }
        }
        report.complete = true;
        report
    }

    /// Names of the fields currently set.
    #[must_use]
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let flags = [
            ("website_info", self.website_info.is_some()),
            ("domain_info", self.domain_info.is_some()),
            ("ssl_info", self.ssl_info.is_some()),
            ("tech_stack", self.tech_stack.is_some()),
            ("crawl", self.crawl.is_some()),
            ("performance", self.performance.is_some()),
            ("seo", self.seo.is_some()),
            ("security", self.security.is_some()),
            ("accessibility", self.accessibility.is_some()),
            ("link_health", self.link_health.is_some()),
            ("link_summary", self.link_summary.is_some()),
            ("ai_analysis", self.ai_analysis.is_some()),
        ];
        flags
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}
