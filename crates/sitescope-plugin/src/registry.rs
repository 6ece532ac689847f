//! Plugin registry: name to implementation lookup.

use crate::error::{RegistryError, Result};
use crate::plugin::Plugin;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Shared lookup from plugin name to implementation.
///
/// Built once at startup through [`PluginRegistryBuilder`] and handed to the
/// executor by `Arc`; after that, lookups only take the read lock.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<HashMap<String, Arc<dyn Plugin>>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a registry.
    #[must_use]
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Register a plugin under its own name.
    ///
    /// # Errors
    /// Returns `RegistryError::Duplicate` if the name is taken.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        let mut plugins = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if plugins.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        debug!(plugin = %name, "registered plugin");
        plugins.insert(name, plugin);
        Ok(())
    }

    /// Look up a plugin.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if no plugin has this name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Whether a plugin with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects plugins and produces a [`PluginRegistry`].
#[derive(Default)]
pub struct PluginRegistryBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistryBuilder {
    /// Add a plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Build the registry.
    ///
    /// # Errors
    /// Returns `RegistryError::Duplicate` if two plugins share a name.
    pub fn build(self) -> Result<PluginRegistry> {
        let registry = PluginRegistry::new();
        for plugin in self.plugins {
            registry.register(plugin)?;
        }
        info!(count = registry.len(), "plugin registry built");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::error::PluginError;
    use crate::plugin::{PluginInput, PluginOutput};
    use async_trait::async_trait;

    struct NamedPlugin(&'static str);

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _ctx: &PluginContext,
            _input: PluginInput,
        ) -> std::result::Result<PluginOutput, PluginError> {
            Ok(PluginOutput::success(serde_json::json!({ "from": self.0 })))
        }
    }

    #[test]
    fn test_builder_and_lookup() {
        let registry = PluginRegistry::builder()
            .with_plugin(Arc::new(NamedPlugin("ssl_info")))
            .with_plugin(Arc::new(NamedPlugin("domain_info")))
            .build()
            .expect("build registry");

        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert!(registry.contains("ssl_info"));
        assert_eq!(registry.list(), vec!["domain_info", "ssl_info"]);
        assert_eq!(registry.get("domain_info").unwrap().name(), "domain_info");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = PluginRegistry::builder()
            .with_plugin(Arc::new(NamedPlugin("crawler")))
            .with_plugin(Arc::new(NamedPlugin("crawler")))
            .build();
        assert_eq!(
            result.unwrap_err(),
            RegistryError::Duplicate("crawler".to_string())
        );
    }

    #[test]
    fn test_missing_plugin() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("lighthouse"),
            Err(RegistryError::NotFound(name)) if name == "lighthouse"
        ));
    }

    #[tokio::test]
    async fn test_concurrent_lookups() {
        let registry = PluginRegistry::builder()
            .with_plugin(Arc::new(NamedPlugin("tech_stack")))
            .build()
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get("tech_stack").map(|p| p.name().to_string()) })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "tech_stack");
        }
    }
}
