//! The view of a task's results handed to the synthesis plugin.

use serde_json::{json, Map, Value as JsonValue};
use sitescope_core::Task;
use sitescope_plugin::names;

/// Cap on URLs and dead links copied into the view.
pub const MAX_CONTEXT_URLS: usize = 50;

/// Build the synthesis input from the modules that completed.
///
/// Only fields owned by a completed module are included, so a failed module's
/// leftovers (for example fragments streamed before a crawler crashed) never
/// reach the report.
#[must_use]
pub fn build_context(task: &Task) -> JsonValue {
    let results = &task.results;
    let mut view = Map::new();
    let completed: Vec<&str> = task
        .completed_modules()
        .into_iter()
        .filter(|name| *name != names::AI_ANALYSIS)
        .collect();

    for module in &completed {
        match *module {
            names::WEBSITE_INFO => insert(&mut view, module, results.website_info.clone()),
            names::DOMAIN_INFO => insert(&mut view, module, results.domain_info.clone()),
            names::SSL_INFO => insert(&mut view, module, results.ssl_info.clone()),
            names::TECH_STACK => insert(&mut view, module, results.tech_stack.clone()),
            names::CRAWLER => {
                if let Some(crawl) = &results.crawl {
                    view.insert(
                        "crawl".to_string(),
                        json!({
                            "url_count": crawl.urls.len(),
                            "urls": crawl.urls.iter().take(MAX_CONTEXT_URLS).collect::<Vec<_>>(),
                        }),
                    );
                }
                insert_summary(&mut view, task);
            }
            names::LINK_HEALTH => {
                if let Some(report) = &results.link_health {
                    let dead: Vec<&str> = report
                        .links
                        .iter()
                        .filter(|l| !l.alive)
                        .map(|l| l.url.as_str())
                        .take(MAX_CONTEXT_URLS)
                        .collect();
                    view.insert("dead_links".to_string(), json!(dead));
                }
                insert_summary(&mut view, task);
            }
            facet => {
                let report = match facet {
                    "performance" => results.performance.clone(),
                    "seo" => results.seo.clone(),
                    "security" => results.security.clone(),
                    "accessibility" => results.accessibility.clone(),
                    _ => None,
                };
                insert(&mut view, facet, report);
            }
        }
    }

    json!({
        "target_url": task.target_url,
        "language": task.language,
        "completed_modules": completed,
        "results": view,
    })
}

fn insert(view: &mut Map<String, JsonValue>, key: &str, value: Option<JsonValue>) {
    if let Some(value) = value {
        view.insert(key.to_string(), value);
    }
}

fn insert_summary(view: &mut Map<String, JsonValue>, task: &Task) {
    if let Some(summary) = &task.results.link_summary {
        if let Ok(value) = serde_json::to_value(summary) {
            view.insert("link_summary".to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sitescope_core::{
        AiMode, AuditFacet, LinkCheck, LinkHealthReport, LinkSummary, Module, ResultSlice,
        RunStatus, TaskId, TaskResults,
    };
    use std::collections::{BTreeSet, HashMap};

    fn task(modules: &[(&str, RunStatus)], results: TaskResults) -> Task {
        Task {
            id: TaskId::generate(),
            target_url: "https://example.com".to_string(),
            options: BTreeSet::new(),
            language: "en".to_string(),
            ai_mode: AiMode::Standard,
            user_id: None,
            is_public: false,
            status: RunStatus::Running,
            results,
            modules: modules
                .iter()
                .map(|(name, status)| {
                    let mut module = Module::pending(*name);
                    module.status = *status;
                    ((*name).to_string(), module)
                })
                .collect::<HashMap<_, _>>(),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_only_completed_modules_are_visible() {
        let mut results = TaskResults::default();
        results.apply(ResultSlice::WebsiteInfo(json!({"title": "Example"})));
        results.apply(ResultSlice::Audit {
            facet: AuditFacet::Seo,
            report: json!({"score": 80}),
        });

        let task = task(
            &[
                ("website_info", RunStatus::Completed),
                ("seo", RunStatus::Failed),
                ("ai_analysis", RunStatus::Running),
            ],
            results,
        );
        let context = build_context(&task);

        assert_eq!(context["completed_modules"], json!(["website_info"]));
        assert_eq!(context["results"]["website_info"]["title"], "Example");
        assert!(context["results"].get("seo").is_none());
    }

    #[test]
    fn test_link_health_lists_dead_links() {
        let checks = vec![
            LinkCheck {
                url: "https://example.com/ok".to_string(),
                alive: true,
                status_code: Some(200),
                latency_ms: Some(20),
                error: None,
            },
            LinkCheck {
                url: "https://example.com/gone".to_string(),
                alive: false,
                status_code: Some(404),
                latency_ms: Some(30),
                error: None,
            },
        ];
        let mut results = TaskResults::default();
        results.apply(ResultSlice::LinkHealth {
            summary: LinkSummary::from_checks(&checks),
            report: LinkHealthReport { links: checks },
        });

        let task = task(&[("link_health", RunStatus::Completed)], results);
        let context = build_context(&task);

        assert_eq!(
            context["results"]["dead_links"],
            json!(["https://example.com/gone"])
        );
        assert_eq!(context["results"]["link_summary"]["dead"], 1);
    }
}
