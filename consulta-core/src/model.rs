//! Domain data structures for plugins, lookups, and execution results.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a tenant owning users and plugin configuration.
    TenantId
);
string_id!(
    /// Identifier of a user holding a credit balance.
    UserId
);
string_id!(
    /// Identifier declared by a plugin.
    PluginId
);
string_id!(
    /// Identifier of a single lookup operation exposed by a plugin.
    ServiceId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Closed set of plugin categories.
pub enum PluginCategory {
    /// Identity, vehicle, and credit bureaus.
    IdentityLookup,
    /// Payment gateways.
    Payment,
    /// Marketplace integrations.
    Marketplace,
    /// Small helpers such as postal code lookups.
    Utility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Category of an individual service, driving its rate limit and timeout.
pub enum ServiceCategory {
    /// Personal identity registries (CPF).
    Identity,
    /// Vehicle registries (plates, RENAVAM).
    Vehicle,
    /// Cadastral data: companies, addresses, phones.
    Cadastral,
    /// Credit bureau scores.
    Credit,
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slug = match self {
            ServiceCategory::Identity => "identity",
            ServiceCategory::Vehicle => "vehicle",
            ServiceCategory::Cadastral => "cadastral",
            ServiceCategory::Credit => "credit",
        };
        formatter.write_str(slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Static identity of a registered plugin.
pub struct PluginDescriptor {
    /// Declared identifier.
    pub id: PluginId,
    /// Human-friendly name.
    pub name: String,
    /// Plugin category.
    pub category: PluginCategory,
    /// Semantic version of the adapter.
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Service exposed by a plugin, as shown in the catalog.
pub struct ServiceInfo {
    /// Service key.
    pub id: ServiceId,
    /// Display name.
    pub name: String,
    /// Short description of the lookup.
    pub description: String,
    /// Category used for limits and timeouts.
    pub category: ServiceCategory,
    /// Price charged per successful lookup.
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
/// A lookup request, one variant per supported service.
pub enum LookupRequest {
    /// Individual taxpayer registry lookup.
    Cpf {
        /// Taxpayer number, with or without punctuation.
        cpf: String,
        /// Optional birth date used by some registries for disambiguation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        birth_date: Option<String>,
    },
    /// Company registry lookup.
    Cnpj {
        /// Company number, with or without punctuation.
        cnpj: String,
    },
    /// Vehicle lookup by licence plate.
    VehiclePlate {
        /// Plate in the old (`ABC1234`) or Mercosul (`ABC1D23`) format.
        plate: String,
    },
    /// Vehicle lookup by national vehicle registry number.
    Renavam {
        /// Eleven digit registry number.
        renavam: String,
    },
    /// Owner lookup by phone number.
    Phone {
        /// Phone number with area code.
        phone: String,
    },
    /// Credit score lookup for a person or a company.
    CreditScore {
        /// CPF or CNPJ.
        document: String,
    },
    /// Postal code lookup.
    Cep {
        /// Eight digit postal code.
        cep: String,
    },
}

impl LookupRequest {
    /// Service key of the primary service answering this request.
    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        let key = match self {
            LookupRequest::Cpf { .. } => "cpf",
            LookupRequest::Cnpj { .. } => "cnpj",
            LookupRequest::VehiclePlate { .. } => "vehicle_plate",
            LookupRequest::Renavam { .. } => "renavam",
            LookupRequest::Phone { .. } => "phone",
            LookupRequest::CreditScore { .. } => "credit_score",
            LookupRequest::Cep { .. } => "cep",
        };
        ServiceId::from(key)
    }

    /// Named fields of the request, used by declarative validation.
    #[must_use]
    pub fn fields(&self) -> Vec<(&'static str, Option<&str>)> {
        match self {
            LookupRequest::Cpf { cpf, birth_date } => {
                vec![("cpf", Some(cpf)), ("birth_date", birth_date.as_deref())]
            }
            LookupRequest::Cnpj { cnpj } => vec![("cnpj", Some(cnpj))],
            LookupRequest::VehiclePlate { plate } => vec![("plate", Some(plate))],
            LookupRequest::Renavam { renavam } => vec![("renavam", Some(renavam))],
            LookupRequest::Phone { phone } => vec![("phone", Some(phone))],
            LookupRequest::CreditScore { document } => vec![("document", Some(document))],
            LookupRequest::Cep { cep } => vec![("cep", Some(cep))],
        }
    }

    /// Copy of the request with identifiers reduced to their canonical form.
    #[must_use]
    pub fn canonicalized(&self) -> Self {
        match self {
            LookupRequest::Cpf { cpf, birth_date } => LookupRequest::Cpf {
                cpf: digits_only(cpf),
                birth_date: birth_date
                    .as_deref()
                    .map(str::trim)
                    .filter(|date| !date.is_empty())
                    .map(str::to_owned),
            },
            LookupRequest::Cnpj { cnpj } => LookupRequest::Cnpj {
                cnpj: digits_only(cnpj),
            },
            LookupRequest::VehiclePlate { plate } => LookupRequest::VehiclePlate {
                plate: plate
                    .chars()
                    .filter(char::is_ascii_alphanumeric)
                    .collect::<String>()
                    .to_ascii_uppercase(),
            },
            LookupRequest::Renavam { renavam } => LookupRequest::Renavam {
                renavam: digits_only(renavam),
            },
            LookupRequest::Phone { phone } => LookupRequest::Phone {
                phone: digits_only(phone),
            },
            LookupRequest::CreditScore { document } => LookupRequest::CreditScore {
                document: digits_only(document),
            },
            LookupRequest::Cep { cep } => LookupRequest::Cep {
                cep: digits_only(cep),
            },
        }
    }

    /// Present fields as a JSON object suitable for a provider request body.
    #[must_use]
    pub fn to_params(&self) -> Map<String, Value> {
        self.fields()
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name.to_owned(), Value::from(value))))
            .collect()
    }
}

fn digits_only(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Per-call input handed to a plugin.
pub struct ExecutionInput {
    /// The lookup to perform.
    #[serde(flatten)]
    pub request: LookupRequest,
    /// Caller-side correlation id for the query.
    #[serde(default, rename = "consultaId", skip_serializing_if = "Option::is_none")]
    pub consulta_id: Option<String>,
    /// Generic request id, used when no `consultaId` is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ExecutionInput {
    /// Wrap a request without correlation ids.
    #[must_use]
    pub fn new(request: LookupRequest) -> Self {
        Self {
            request,
            consulta_id: None,
            id: None,
        }
    }

    /// Correlation id attached to billing events.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.consulta_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Plugin configuration; every field is optional so layers can be merged.
pub struct PluginConfig {
    /// Provider credential.
    #[serde(default, rename = "apiKey", alias = "api_key", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL of the primary provider endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Base URL used by fallback services hosted elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_base_url: Option<String>,
    /// Retries per service after the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Base delay for exponential backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    /// Jitter as a fraction of the computed backoff delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl PluginConfig {
    /// Merge `self` over `defaults`: set fields win, unset fields inherit.
    #[must_use]
    pub fn merged_over(&self, defaults: &PluginConfig) -> PluginConfig {
        PluginConfig {
            api_key: self.api_key.clone().or_else(|| defaults.api_key.clone()),
            base_url: self.base_url.clone().or_else(|| defaults.base_url.clone()),
            fallback_base_url: self
                .fallback_base_url
                .clone()
                .or_else(|| defaults.fallback_base_url.clone()),
            retries: self.retries.or(defaults.retries),
            base_delay_ms: self.base_delay_ms.or(defaults.base_delay_ms),
            jitter: self.jitter.or(defaults.jitter),
        }
    }
}

#[derive(Debug, Clone)]
/// Everything a plugin needs for one execution.
pub struct ExecutionContext {
    /// Tenant issuing the call.
    pub tenant_id: TenantId,
    /// User charged for the call.
    pub user_id: UserId,
    /// Lookup input.
    pub input: ExecutionInput,
    /// Effective configuration: tenant overrides merged over plugin defaults.
    pub config: PluginConfig,
}

#[derive(Debug, Clone)]
/// Caller-facing request to execute a plugin.
pub struct ExecutionRequest {
    /// Tenant issuing the call.
    pub tenant_id: TenantId,
    /// User charged for the call.
    pub user_id: UserId,
    /// Lookup input.
    pub input: ExecutionInput,
    /// Tenant configuration overrides.
    pub config: PluginConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Outcome of a plugin execution.
pub struct ExecutionResult {
    /// Whether the lookup succeeded.
    pub success: bool,
    /// Sanitized, normalized payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Amount charged, two decimal places; zero on failure.
    pub cost: Decimal,
    /// Service that ultimately served the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceId>,
}

impl ExecutionResult {
    /// Successful result with the given payload and cost.
    #[must_use]
    pub fn success(data: Value, cost: Decimal, service: ServiceId) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            cost: cost.round_dp(2),
            service: Some(service),
        }
    }

    /// Failed result carrying `reason`.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(reason.into()),
            cost: Decimal::ZERO,
            service: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms_strip_punctuation() {
        let cpf = LookupRequest::Cpf {
            cpf: "529.982.247-25".to_owned(),
            birth_date: Some("  ".to_owned()),
        };
        assert_eq!(
            cpf.canonicalized(),
            LookupRequest::Cpf {
                cpf: "52998224725".to_owned(),
                birth_date: None,
            }
        );

        let plate = LookupRequest::VehiclePlate {
            plate: "abc-1d23".to_owned(),
        };
        assert_eq!(
            plate.canonicalized(),
            LookupRequest::VehiclePlate {
                plate: "ABC1D23".to_owned(),
            }
        );
    }

    #[test]
    fn input_deserializes_from_tagged_json() {
        let input: ExecutionInput = serde_json::from_value(serde_json::json!({
            "service": "cep",
            "cep": "01001-000",
            "id": "req-1",
        }))
        .expect("valid input");

        assert_eq!(input.request.service_id(), ServiceId::from("cep"));
        assert_eq!(input.correlation_id(), Some("req-1"));
    }

    #[test]
    fn consulta_id_wins_over_id() {
        let input = ExecutionInput {
            request: LookupRequest::Cep {
                cep: "01001000".to_owned(),
            },
            consulta_id: Some("c-9".to_owned()),
            id: Some("req-1".to_owned()),
        };
        assert_eq!(input.correlation_id(), Some("c-9"));
    }

    #[test]
    fn tenant_config_overrides_defaults() {
        let defaults = PluginConfig {
            api_key: Some("default-key".to_owned()),
            base_url: Some("https://api.example".to_owned()),
            retries: Some(2),
            ..PluginConfig::default()
        };
        let tenant = PluginConfig {
            api_key: Some("tenant-key".to_owned()),
            ..PluginConfig::default()
        };

        let merged = tenant.merged_over(&defaults);
        assert_eq!(merged.api_key.as_deref(), Some("tenant-key"));
        assert_eq!(merged.base_url.as_deref(), Some("https://api.example"));
        assert_eq!(merged.retries, Some(2));
    }

    #[test]
    fn failure_costs_nothing() {
        let result = ExecutionResult::failure("boom");
        assert!(!result.success);
        assert_eq!(result.cost, Decimal::ZERO);
    }
}
