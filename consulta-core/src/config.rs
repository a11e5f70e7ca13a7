//! Engine configuration loaded from TOML.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{PluginConfig, PluginId, TenantId};
use crate::ports::EngineError;
use crate::resilience::ResilienceConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Full engine configuration; every section falls back to its defaults.
pub struct EngineConfig {
    /// Limits, breakers, retries, deadlines, and fallback chains.
    #[serde(flatten)]
    pub resilience: ResilienceConfig,
    /// Plugin defaults keyed by plugin identifier.
    pub plugins: HashMap<PluginId, PluginConfig>,
    /// Per-tenant plugin overrides.
    pub tenants: HashMap<TenantId, HashMap<PluginId, PluginConfig>>,
}

impl EngineConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the document is malformed.
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|err| EngineError::Configuration(err.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            EngineError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults configured for a plugin.
    #[must_use]
    pub fn plugin_defaults(&self, plugin: &PluginId) -> PluginConfig {
        self.plugins.get(plugin).cloned().unwrap_or_default()
    }

    /// Tenant overrides for a plugin.
    #[must_use]
    pub fn tenant_overrides(&self, tenant: &TenantId, plugin: &PluginId) -> PluginConfig {
        self.tenants
            .get(tenant)
            .and_then(|plugins| plugins.get(plugin))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{ServiceCategory, ServiceId};

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").expect("parse");

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.resilience.rate_limits.window_secs, 60);
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            config
                .resilience
                .timeouts
                .timeout_for(Some(ServiceCategory::Credit)),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [rate_limits]
            window_secs = 30
            min_interval_ms = 250

            [rate_limits.categories]
            vehicle = 3

            [rate_limits.services]
            cpf_serpro = 1

            [circuit_breaker]
            failure_threshold = 3

            [retry]
            retries = 0

            [fallbacks]
            cpf = ["cpf_serpro"]

            [plugins.infosimples]
            apiKey = "default-key"
            base_url = "https://api.example.test"

            [tenants.acme.infosimples]
            api_key = "acme-key"
            "#,
        )
        .expect("parse");

        let limits = &config.resilience.rate_limits;
        assert_eq!(limits.window_secs, 30);
        assert_eq!(limits.min_interval_ms, 250);
        assert_eq!(limits.categories.vehicle, 3);
        assert_eq!(limits.categories.credit, 5);
        assert_eq!(limits.limit_for(&ServiceId::from("cpf_serpro"), None), 1);
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.resilience.circuit_breaker.cooldown_secs, 60);
        assert_eq!(config.resilience.retry.retries, 0);
        assert_eq!(
            config.resilience.fallbacks.get(&ServiceId::from("cpf")),
            Some(&vec![ServiceId::from("cpf_serpro")])
        );

        let plugin = PluginId::from("infosimples");
        let effective = config
            .tenant_overrides(&TenantId::from("acme"), &plugin)
            .merged_over(&config.plugin_defaults(&plugin));
        assert_eq!(effective.api_key.as_deref(), Some("acme-key"));
        assert_eq!(effective.base_url.as_deref(), Some("https://api.example.test"));

        let other = config.tenant_overrides(&TenantId::from("globex"), &plugin);
        assert_eq!(other, PluginConfig::default());
    }

    #[test]
    fn malformed_document_is_a_configuration_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("[retry]\nretries = \"many\""),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/consulta.toml"),
            Err(EngineError::Configuration(message)) if message.contains("cannot read")
        ));
    }
}
