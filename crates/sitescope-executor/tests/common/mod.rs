//! Shared helpers for executor integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use sitescope_core::{AppConfig, CrawlFragment, CrawledPage, UserId};
use sitescope_db::Database;
use sitescope_executor::TaskService;
use sitescope_plugin::{
    names, PhaseInput, Plugin, PluginContext, PluginError, PluginInput, PluginOutput,
    PluginRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a mock plugin does when executed.
#[derive(Clone)]
pub enum Behavior {
    /// Return this payload
    Succeed(Value),
    /// Return this error
    Fail(PluginError),
    /// Return this output verbatim
    Output(PluginOutput),
    /// Panic with this message
    Panic(&'static str),
    /// Sleep without watching cancellation, then succeed with `{}`
    Sleep(Duration),
    /// Report a check for every URL in the link-health input
    EchoLinks,
    /// Stream one fragment per page, then return the URL list
    Stream(Vec<CrawledPage>),
}

/// A scripted plugin that records its calls.
pub struct MockPlugin {
    name: &'static str,
    behavior: Behavior,
    calls: AtomicUsize,
    inputs: Mutex<Vec<PluginInput>>,
}

impl MockPlugin {
    pub fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<PluginInput> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        ctx: &PluginContext,
        input: PluginInput,
    ) -> Result<PluginOutput, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());

        match &self.behavior {
            Behavior::Succeed(payload) => Ok(PluginOutput::success(payload.clone())),
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Output(output) => Ok(output.clone()),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Sleep(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(PluginOutput::success(json!({})))
            }
            Behavior::EchoLinks => {
                let PhaseInput::LinkHealth { urls } = input.phase else {
                    return Err(PluginError::InvalidInput("expected URLs".to_string()));
                };
                let links: Vec<Value> = urls
                    .iter()
                    .map(|url| json!({"url": url, "alive": true, "status_code": 200, "latency_ms": 10}))
                    .collect();
                Ok(PluginOutput::success(json!({ "links": links })))
            }
            Behavior::Stream(pages) => {
                let total = pages.len() as u64;
                for (i, page) in pages.iter().enumerate() {
                    ctx.reporter().fragment(CrawlFragment {
                        pages: vec![page.clone()],
                    });
                    ctx.reporter().progress(i as u64 + 1, Some(total));
                }
                let urls: Vec<&str> = pages.iter().map(|p| p.url.as_str()).collect();
                Ok(PluginOutput::success(json!({ "urls": urls })))
            }
        }
    }
}

pub fn page(url: &str, status: u16, latency_ms: u64) -> CrawledPage {
    CrawledPage {
        url: url.to_string(),
        status_code: Some(status),
        latency_ms: Some(latency_ms),
    }
}

pub fn crawl_payload(urls: &[&str]) -> Value {
    json!({ "urls": urls })
}

pub fn audit_payload() -> Value {
    json!({
        "performance": {"score": 88},
        "seo": {"score": 92},
        "security": {"score": 75},
        "accessibility": {"score": 81},
    })
}

/// A healthy plugin for every name the executor schedules.
pub fn healthy_plugins() -> Vec<Arc<MockPlugin>> {
    vec![
        MockPlugin::new(names::WEBSITE_INFO, Behavior::Succeed(json!({"title": "Example"}))),
        MockPlugin::new(names::DOMAIN_INFO, Behavior::Succeed(json!({"registrar": "IANA"}))),
        MockPlugin::new(names::SSL_INFO, Behavior::Succeed(json!({"valid": true}))),
        MockPlugin::new(names::TECH_STACK, Behavior::Succeed(json!({"server": "nginx"}))),
        MockPlugin::new(
            names::CRAWLER,
            Behavior::Succeed(crawl_payload(&[
                "https://example.com/",
                "https://example.com/about",
            ])),
        ),
        MockPlugin::new(names::LIGHTHOUSE, Behavior::Succeed(audit_payload())),
        MockPlugin::new(names::LINK_HEALTH, Behavior::EchoLinks),
        MockPlugin::new(names::AI_ANALYSIS, Behavior::Succeed(json!({"summary": "ok"}))),
    ]
}

/// Replace the plugin named like `replacement` in `plugins`.
pub fn with_plugin(
    mut plugins: Vec<Arc<MockPlugin>>,
    replacement: Arc<MockPlugin>,
) -> Vec<Arc<MockPlugin>> {
    plugins.retain(|p| p.name != replacement.name);
    plugins.push(replacement);
    plugins
}

pub fn find(plugins: &[Arc<MockPlugin>], name: &str) -> Arc<MockPlugin> {
    plugins
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .expect("plugin present")
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = ":memory:".to_string();
    config.ledger.reservation_backoff_ms = 1;
    config
}

pub async fn setup_service(
    plugins: &[Arc<MockPlugin>],
    config: AppConfig,
) -> (Database, TaskService) {
    let db = Database::open(&config.database)
        .await
        .expect("open test database");

    let registry = plugins
        .iter()
        .fold(PluginRegistry::builder(), |builder, plugin| {
            builder.with_plugin(plugin.clone())
        })
        .build()
        .expect("build registry");

    let service = TaskService::new(&db, registry, &config);
    (db, service)
}

pub async fn funded_user(service: &TaskService, name: &str, balance: i64) -> UserId {
    let user = UserId::new(name).unwrap();
    if balance > 0 {
        service.ledger().grant_credits(&user, balance).await.unwrap();
    }
    user
}
