//! Provider implementation for postal code lookups using ViaCEP, with BrasilAPI as fallback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use consulta_core::{
    model::{
        ExecutionContext, ExecutionResult, LookupRequest, PluginCategory, PluginConfig,
        PluginDescriptor, PluginId, ServiceCategory, ServiceId, ServiceInfo,
    },
    ports::{EngineError, Plugin},
    resilience::ResilienceController,
    validation::{normalize_output, sanitize_output, validate_input},
};

const VIACEP_URL: &str = "https://viacep.com.br";
const BRASILAPI_URL: &str = "https://brasilapi.com.br";
const PLUGIN_ID: &str = "viacep";

const CEP: &str = "cep";
const CEP_BRASILAPI: &str = "cep_brasilapi";

/// Default fallback chain: ViaCEP first, then BrasilAPI.
#[must_use]
pub fn fallbacks() -> HashMap<ServiceId, Vec<ServiceId>> {
    HashMap::from([(ServiceId::from(CEP), vec![ServiceId::from(CEP_BRASILAPI)])])
}

/// Postal code adapter.
pub struct ViaCepPlugin {
    client: Client,
    controller: Arc<ResilienceController>,
    descriptor: PluginDescriptor,
    defaults: PluginConfig,
}

impl ViaCepPlugin {
    /// Create a plugin bound to the given HTTP client and resilience controller.
    #[must_use]
    pub fn new(client: Client, controller: Arc<ResilienceController>, defaults: PluginConfig) -> Self {
        controller.register_services(&services());
        Self {
            client,
            controller,
            descriptor: descriptor(),
            defaults,
        }
    }

    async fn lookup(
        &self,
        service: ServiceId,
        config: &PluginConfig,
        cep: &str,
    ) -> Result<Value, EngineError> {
        match service.as_str() {
            CEP => {
                let base = config.base_url.as_deref().unwrap_or(VIACEP_URL);
                let url = format!("{}/ws/{cep}/json/", base.trim_end_matches('/'));
                let body: Value = fetch_json(self.client.get(url)).await?;

                // ViaCEP answers unknown codes with 200 and an error flag.
                if is_not_found(&body) {
                    debug!(service = %service, "postal code not found");
                    return Err(EngineError::validation(CEP, "postal code not found"));
                }
                Ok(body)
            }
            CEP_BRASILAPI => {
                let base = config.fallback_base_url.as_deref().unwrap_or(BRASILAPI_URL);
                let url = format!("{}/api/cep/v1/{cep}", base.trim_end_matches('/'));
                fetch_json(self.client.get(url)).await
            }
            _ => Err(EngineError::UnsupportedService(service)),
        }
    }
}

fn is_not_found(body: &Value) -> bool {
    match body.get("erro") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag == "true",
        _ => false,
    }
}

#[async_trait]
impl Plugin for ViaCepPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn default_config(&self) -> PluginConfig {
        self.defaults.clone()
    }

    fn available_services(&self) -> Vec<ServiceInfo> {
        services()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EngineError> {
        let primary = ctx.input.request.service_id();
        let request =
            validate_input(&primary, &ctx.input.request).map_err(EngineError::Validation)?;
        let LookupRequest::Cep { cep } = request else {
            return Err(EngineError::UnsupportedService(primary));
        };

        let retry = self.controller.retry_policy().with_overrides(&ctx.config);
        let config = &ctx.config;
        let code = cep.as_str();

        let served = self
            .controller
            .call(&primary, &retry, move |service| self.lookup(service, config, code))
            .await?;

        let record = normalize_output(&served.service, served.value);
        let sanitized = sanitize_output(&served.service, record);
        let data = serde_json::to_value(sanitized)
            .map_err(|err| EngineError::Internal(err.to_string()))?;

        Ok(ExecutionResult::success(data, price(), served.service))
    }
}

/// Build the postal code plugin.
#[must_use]
pub fn plugin(
    client: Client,
    controller: Arc<ResilienceController>,
    defaults: PluginConfig,
) -> Arc<dyn Plugin> {
    Arc::new(ViaCepPlugin::new(client, controller, defaults))
}

fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        id: PluginId::from(PLUGIN_ID),
        name: String::from("ViaCEP"),
        category: PluginCategory::Utility,
        version: String::from(env!("CARGO_PKG_VERSION")),
    }
}

fn price() -> Decimal {
    Decimal::new(5, 2)
}

fn services() -> Vec<ServiceInfo> {
    vec![
        ServiceInfo {
            id: ServiceId::from(CEP),
            name: String::from("CEP"),
            description: String::from("Address of a postal code via ViaCEP"),
            category: ServiceCategory::Cadastral,
            price: price(),
        },
        ServiceInfo {
            id: ServiceId::from(CEP_BRASILAPI),
            name: String::from("CEP (BrasilAPI)"),
            description: String::from("Address of a postal code via BrasilAPI"),
            category: ServiceCategory::Cadastral,
            price: price(),
        },
    ]
}

// Small helper to fetch and decode JSON with status handling.
async fn fetch_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, EngineError> {
    req.send()
        .await
        .map_err(EngineError::from)?
        .error_for_status()
        .map_err(EngineError::from)?
        .json()
        .await
        .map_err(EngineError::from)
}
