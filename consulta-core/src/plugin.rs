//! Registry for all provider plugins and their activation state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::model::{PluginDescriptor, PluginId, ServiceInfo};
use crate::ports::{EngineError, Plugin, PluginStatusStore};

/// Registry that resolves plugins by key or declared identifier.
///
/// Activation is a single process-wide switch per plugin; it is not keyed by tenant.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    active: RwLock<HashSet<PluginId>>,
}

impl PluginRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the provided plugin list.
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError`] raised by a plugin's `install` hook.
    pub fn from_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, EngineError> {
        let registry = Self::new();
        for plugin in plugins {
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    /// Register a plugin under its declared identifier.
    ///
    /// # Errors
    ///
    /// Returns the [`EngineError`] raised by the plugin's `install` hook.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        let key = plugin.descriptor().id.to_string();
        self.register_as(key, plugin)
    }

    /// Register a plugin under an explicit key, e.g. a namespaced one.
    ///
    /// Any previous entry with the same key or the same declared identifier is replaced.
    ///
    /// # Errors
    ///
    /// Returns the [`EngineError`] raised by the plugin's `install` hook.
    pub fn register_as(
        &self,
        key: impl Into<String>,
        plugin: Arc<dyn Plugin>,
    ) -> Result<(), EngineError> {
        plugin.install()?;

        let key = key.into();
        let declared = plugin.descriptor().id.clone();
        let mut plugins = self.plugins.write();
        plugins.retain(|existing_key, existing| {
            existing_key != &key && existing.descriptor().id != declared
        });
        plugins.insert(key.clone(), plugin);

        info!(plugin = %declared, key = %key, "plugin registered");
        Ok(())
    }

    /// Look up a plugin by registry key, falling back to its declared identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PluginNotFound`] when nothing matches.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Plugin>, EngineError> {
        let plugins = self.plugins.read();
        if let Some(plugin) = plugins.get(id) {
            return Ok(Arc::clone(plugin));
        }

        plugins
            .values()
            .find(|plugin| plugin.descriptor().id.as_str() == id)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::PluginNotFound(id.to_owned()))
    }

    /// Descriptors of all registered plugins, sorted by identifier.
    #[must_use]
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<_> = self
            .plugins
            .read()
            .values()
            .map(|plugin| plugin.descriptor().clone())
            .collect();
        descriptors.sort_by(|left, right| left.id.cmp(&right.id));
        descriptors
    }

    /// Catalog of services across all registered plugins.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<_> = self
            .plugins
            .read()
            .values()
            .flat_map(|plugin| plugin.available_services())
            .collect();
        services.sort_by(|left, right| left.id.cmp(&right.id));
        services
    }

    /// Switch a plugin on or off, running its lifecycle hook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PluginNotFound`] for unknown plugins, or the hook's error.
    pub fn set_active(&self, id: &str, active: bool) -> Result<(), EngineError> {
        let plugin = self.resolve(id)?;
        let declared = plugin.descriptor().id.clone();

        if active {
            plugin.enable()?;
            self.active.write().insert(declared.clone());
        } else {
            plugin.disable()?;
            self.active.write().remove(&declared);
        }

        debug!(plugin = %declared, active, "plugin activation changed");
        Ok(())
    }

    /// Whether the plugin with the declared identifier is active.
    #[must_use]
    pub fn is_active(&self, id: &PluginId) -> bool {
        self.active.read().contains(id)
    }
}

/// Activation store kept in process memory.
#[derive(Default)]
pub struct InMemoryPluginStatusStore {
    statuses: RwLock<HashMap<PluginId, bool>>,
}

impl InMemoryPluginStatusStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginStatusStore for InMemoryPluginStatusStore {
    async fn save_status(&self, plugin: &PluginId, active: bool) -> Result<(), EngineError> {
        self.statuses.write().insert(plugin.clone(), active);
        Ok(())
    }

    async fn active_plugins(&self) -> Result<Vec<PluginId>, EngineError> {
        let mut active: Vec<_> = self
            .statuses
            .read()
            .iter()
            .filter(|(_, active)| **active)
            .map(|(plugin, _)| plugin.clone())
            .collect();
        active.sort();
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::model::{ExecutionContext, ExecutionResult, PluginCategory};

    struct StubPlugin {
        descriptor: PluginDescriptor,
        installable: bool,
    }

    impl StubPlugin {
        fn new(id: &str, version: &str) -> Arc<dyn Plugin> {
            Arc::new(Self {
                descriptor: PluginDescriptor {
                    id: PluginId::from(id),
                    name: id.to_owned(),
                    category: PluginCategory::Utility,
                    version: version.to_owned(),
                },
                installable: true,
            })
        }
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        fn install(&self) -> Result<(), EngineError> {
            if self.installable {
                Ok(())
            } else {
                Err(EngineError::Configuration("missing api key".to_owned()))
            }
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionResult, EngineError> {
            Ok(ExecutionResult::failure("stub"))
        }
    }

    #[test]
    fn registering_twice_keeps_latest_definition() {
        let registry = PluginRegistry::new();
        registry.register(StubPlugin::new("viacep", "1.0.0")).expect("register");
        registry.register(StubPlugin::new("viacep", "1.1.0")).expect("register");

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, "1.1.0");
        assert_eq!(
            registry.resolve("viacep").expect("resolves").descriptor().version,
            "1.1.0"
        );
    }

    #[test]
    fn namespaced_key_and_bare_id_both_resolve() {
        let registry = PluginRegistry::new();
        registry
            .register_as("@consulta/viacep", StubPlugin::new("viacep", "1.0.0"))
            .expect("register");

        assert!(registry.resolve("@consulta/viacep").is_ok());
        assert!(registry.resolve("viacep").is_ok());
        assert!(matches!(
            registry.resolve("unknown"),
            Err(EngineError::PluginNotFound(id)) if id == "unknown"
        ));
    }

    #[test]
    fn install_failure_rejects_registration() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(StubPlugin {
            descriptor: PluginDescriptor {
                id: PluginId::from("broken"),
                name: "broken".to_owned(),
                category: PluginCategory::Payment,
                version: "0.1.0".to_owned(),
            },
            installable: false,
        });

        assert!(matches!(
            registry.register(plugin),
            Err(EngineError::Configuration(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn activation_is_a_global_switch() {
        let registry = PluginRegistry::new();
        registry.register(StubPlugin::new("viacep", "1.0.0")).expect("register");
        let id = PluginId::from("viacep");

        assert!(!registry.is_active(&id));
        registry.set_active("viacep", true).expect("activate");
        assert!(registry.is_active(&id));
        registry.set_active("viacep", false).expect("deactivate");
        assert!(!registry.is_active(&id));
    }

    #[tokio::test]
    async fn status_store_lists_only_active_plugins() {
        let store = InMemoryPluginStatusStore::new();
        store.save_status(&PluginId::from("b"), true).await.expect("save");
        store.save_status(&PluginId::from("a"), true).await.expect("save");
        store.save_status(&PluginId::from("c"), false).await.expect("save");

        let active = store.active_plugins().await.expect("load");
        assert_eq!(active, vec![PluginId::from("a"), PluginId::from("b")]);
    }
}
