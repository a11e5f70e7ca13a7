//! Provider implementation for identity, vehicle, and credit lookups via Infosimples.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use consulta_core::{
    model::{
        ExecutionContext, ExecutionResult, PluginCategory, PluginConfig, PluginDescriptor,
        PluginId, ServiceCategory, ServiceId, ServiceInfo,
    },
    ports::{EngineError, Plugin},
    resilience::ResilienceController,
    validation::{normalize_output, sanitize_output, validate_input},
};

const BASE_URL: &str = "https://api.infosimples.com/api/v2/consultas";
const PLUGIN_ID: &str = "infosimples";
const API_KEY_HEADER: &str = "x-api-key";

/// Status code the API puts in the body of a successful answer.
const CODE_OK: u16 = 200;

/// One remote endpoint and how it is sold.
struct Endpoint {
    service: &'static str,
    name: &'static str,
    description: &'static str,
    category: ServiceCategory,
    path: &'static str,
    price_cents: i64,
}

impl Endpoint {
    fn price(&self) -> Decimal {
        Decimal::new(self.price_cents, 2)
    }

    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            id: ServiceId::from(self.service),
            name: self.name.to_owned(),
            description: self.description.to_owned(),
            category: self.category,
            price: self.price(),
        }
    }
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        service: "cpf",
        name: "CPF",
        description: "Taxpayer status from the federal revenue registry",
        category: ServiceCategory::Identity,
        path: "receita-federal/cpf",
        price_cents: 50,
    },
    Endpoint {
        service: "cpf_serpro",
        name: "CPF (Serpro)",
        description: "Taxpayer status from the Serpro data service",
        category: ServiceCategory::Identity,
        path: "serpro/cpf",
        price_cents: 80,
    },
    Endpoint {
        service: "cnpj",
        name: "CNPJ",
        description: "Company registration from the federal revenue registry",
        category: ServiceCategory::Cadastral,
        path: "receita-federal/cnpj",
        price_cents: 40,
    },
    Endpoint {
        service: "vehicle_plate",
        name: "Vehicle by plate",
        description: "Vehicle record from the state traffic department",
        category: ServiceCategory::Vehicle,
        path: "detran/placa",
        price_cents: 120,
    },
    Endpoint {
        service: "vehicle_plate_senatran",
        name: "Vehicle by plate (Senatran)",
        description: "Vehicle record from the national traffic registry",
        category: ServiceCategory::Vehicle,
        path: "senatran/veiculo",
        price_cents: 150,
    },
    Endpoint {
        service: "renavam",
        name: "Vehicle by RENAVAM",
        description: "Vehicle record by national registry number",
        category: ServiceCategory::Vehicle,
        path: "detran/renavam",
        price_cents: 120,
    },
    Endpoint {
        service: "phone",
        name: "Phone owner",
        description: "Carrier and owner of a phone line",
        category: ServiceCategory::Cadastral,
        path: "anatel/telefone",
        price_cents: 60,
    },
    Endpoint {
        service: "credit_score",
        name: "Credit score",
        description: "Credit score and restrictions from Serasa",
        category: ServiceCategory::Credit,
        path: "serasa/score",
        price_cents: 250,
    },
    Endpoint {
        service: "credit_score_boavista",
        name: "Credit score (Boa Vista)",
        description: "Credit score and restrictions from Boa Vista",
        category: ServiceCategory::Credit,
        path: "boavista/score",
        price_cents: 220,
    },
];

fn endpoint(service: &ServiceId) -> Option<&'static Endpoint> {
    ENDPOINTS
        .iter()
        .find(|endpoint| endpoint.service == service.as_str())
}

/// Status fields of the response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: u16,
    #[serde(default)]
    code_message: Option<String>,
}

/// Default fallback chains for the services of this provider.
#[must_use]
pub fn fallbacks() -> HashMap<ServiceId, Vec<ServiceId>> {
    [
        ("cpf", "cpf_serpro"),
        ("vehicle_plate", "vehicle_plate_senatran"),
        ("credit_score", "credit_score_boavista"),
    ]
    .into_iter()
    .map(|(primary, alternate)| (ServiceId::from(primary), vec![ServiceId::from(alternate)]))
    .collect()
}

/// Lookup adapter for the Infosimples API.
pub struct InfosimplesPlugin {
    client: Client,
    controller: Arc<ResilienceController>,
    descriptor: PluginDescriptor,
    defaults: PluginConfig,
}

impl InfosimplesPlugin {
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

    async fn query(
        &self,
        service: ServiceId,
        base_url: &str,
        api_key: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, EngineError> {
        let endpoint =
            endpoint(&service).ok_or_else(|| EngineError::UnsupportedService(service.clone()))?;

        let req = self
            .client
            .post(format!("{base_url}/{}", endpoint.path))
            .header(API_KEY_HEADER, api_key)
            .json(params);

        let body = fetch_json(req).await?;
        let envelope: Envelope = serde_json::from_value(body.clone()).map_err(|err| {
            EngineError::ProviderCallFailed {
                service: service.clone(),
                cause: format!("unexpected response: {err}"),
            }
        })?;

        if envelope.code != CODE_OK {
            debug!(service = %service, code = envelope.code, "provider reported an error");
            return Err(EngineError::ProviderCallFailed {
                service,
                cause: format!(
                    "code {}: {}",
                    envelope.code,
                    envelope.code_message.as_deref().unwrap_or("no message")
                ),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl Plugin for InfosimplesPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn install(&self) -> Result<(), EngineError> {
        match self.defaults.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(EngineError::Configuration(format!(
                "{PLUGIN_ID}: apiKey is required"
            ))),
        }
    }

    fn default_config(&self) -> PluginConfig {
        self.defaults.clone()
    }

    fn available_services(&self) -> Vec<ServiceInfo> {
        services()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EngineError> {
        let primary = ctx.input.request.service_id();
        if endpoint(&primary).is_none() {
            return Err(EngineError::UnsupportedService(primary));
        }

        let request =
            validate_input(&primary, &ctx.input.request).map_err(EngineError::Validation)?;
        let api_key = ctx
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Configuration(format!("{PLUGIN_ID}: apiKey is required")))?;
        let base_url = ctx
            .config
            .base_url
            .as_deref()
            .unwrap_or(BASE_URL)
            .trim_end_matches('/');

        let retry = self.controller.retry_policy().with_overrides(&ctx.config);
        let body = request.to_params();
        let params = &body;

        let served = self
            .controller
            .call(&primary, &retry, move |service| {
                self.query(service, base_url, api_key, params)
            })
            .await?;

        let record = normalize_output(&served.service, served.value);
        let sanitized = sanitize_output(&served.service, record);
        let data = serde_json::to_value(sanitized)
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        let price = endpoint(&served.service).map_or(Decimal::ZERO, Endpoint::price);

        Ok(ExecutionResult::success(data, price, served.service))
    }
}

/// Build the Infosimples plugin.
#[must_use]
pub fn plugin(
    client: Client,
    controller: Arc<ResilienceController>,
    defaults: PluginConfig,
) -> Arc<dyn Plugin> {
    Arc::new(InfosimplesPlugin::new(client, controller, defaults))
}

fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        id: PluginId::from(PLUGIN_ID),
        name: String::from("Infosimples"),
        category: PluginCategory::IdentityLookup,
        version: String::from(env!("CARGO_PKG_VERSION")),
    }
}

fn services() -> Vec<ServiceInfo> {
    ENDPOINTS.iter().map(Endpoint::info).collect()
}

// Small helper to fetch and decode JSON with status handling.
async fn fetch_json(req: RequestBuilder) -> Result<Value, EngineError> {
    req.send()
        .await
        .map_err(EngineError::from)?
        .error_for_status()
        .map_err(EngineError::from)?
        .json()
        .await
        .map_err(EngineError::from)
}
