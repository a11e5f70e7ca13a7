//! Conversion of provider payloads into canonical records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::ServiceId;

/// Version stamped on every canonical record.
pub const NORMALIZATION_VERSION: &str = "1.0";

/// Provider field names and their canonical counterparts.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("logradouro", "street"),
    ("bairro", "neighborhood"),
    ("localidade", "city"),
    ("cidade", "city"),
    ("municipio", "city"),
    ("uf", "state"),
    ("estado", "state"),
    ("nome", "name"),
    ("razao_social", "company_name"),
    ("nome_fantasia", "trade_name"),
    ("situacao_cadastral", "registration_status"),
    ("data_nascimento", "birth_date"),
    ("placa", "plate"),
    ("marca_modelo", "model"),
    ("ano_fabricacao", "manufacture_year"),
    ("pontuacao", "score"),
    ("telefone", "phone"),
];

/// Fields providers encode as `"1"`/`"0"` strings.
const FLAG_FIELDS: &[&str] = &[
    "restricao",
    "roubo_furto",
    "alienacao_fiduciaria",
    "obito",
    "situacao_regular",
    "protesto",
    "inadimplente",
];

/// Prefixes marking provider flags.
const FLAG_PREFIXES: &[&str] = &["tem_", "possui_", "has_", "is_", "flag_"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Provider-independent view of a lookup answer.
pub struct CanonicalRecord {
    /// Service that produced the answer.
    pub service: ServiceId,
    /// Normalized answer fields.
    pub data: Map<String, Value>,
    /// Parameters the provider echoed back, kept verbatim.
    pub parameters: Map<String, Value>,
    /// Untouched provider payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// When normalization happened.
    pub normalized_at: DateTime<Utc>,
    /// Normalization schema version.
    pub version: String,
}

/// Build a canonical record from a provider payload.
///
/// Envelopes of the form `{"header": {"parameters": ..}, "data": [..]}` are unwrapped;
/// flat payloads are used as the data object directly.
#[must_use]
pub fn normalize_output(service: &ServiceId, raw: Value) -> CanonicalRecord {
    let parameters = raw
        .pointer("/header/parameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let body = match raw.get("data") {
        Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
        Some(object @ Value::Object(_)) => object.clone(),
        _ => raw.clone(),
    };

    let data = match body {
        Value::Object(fields) => fields
            .into_iter()
            .map(|(key, value)| {
                let value = normalize_value(&key, value);
                (canonical_key(&key), value)
            })
            .collect(),
        Value::Null => Map::new(),
        other => Map::from_iter([("value".to_owned(), other)]),
    };

    CanonicalRecord {
        service: service.clone(),
        data,
        parameters,
        raw: Some(raw),
        normalized_at: Utc::now(),
        version: NORMALIZATION_VERSION.to_owned(),
    }
}

fn canonical_key(key: &str) -> String {
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map_or_else(|| key.to_owned(), |(_, canonical)| (*canonical).to_owned())
}

fn is_flag(key: &str) -> bool {
    FLAG_FIELDS.contains(&key) || FLAG_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

fn normalize_value(key: &str, value: Value) -> Value {
    match value {
        Value::String(text) if is_flag(key) => match text.as_str() {
            "1" | "true" | "S" => Value::Bool(true),
            "0" | "false" | "N" => Value::Bool(false),
            _ => Value::String(text),
        },
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(inner_key, inner)| {
                    let inner = normalize_value(&inner_key, inner);
                    (inner_key, inner)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize_value(key, item))
                .collect(),
        ),
        other => other,
    }
}
