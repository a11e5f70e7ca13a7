//! Redaction of canonical records before they are returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::ServiceId;
use crate::validation::documents::{is_valid_document, mask_document, mask_phone, mask_plate};
use crate::validation::normalize::CanonicalRecord;

/// Keys carrying raw provider output.
const RAW_KEYS: &[&str] = &[
    "raw",
    "_raw",
    "raw_response",
    "provider_response",
    "html",
    "site_receipts",
];

/// Key tokens marking regulated identifiers, as in `cpf`, `cpf_cnpj`, or `documento_socio`.
const DOCUMENT_KEYS: &[&str] = &["cpf", "cnpj", "document", "documento", "renavam", "chassi"];

/// Key tokens marking licence plates.
const PLATE_KEYS: &[&str] = &["plate", "placa"];

/// Key tokens marking phone numbers.
const PHONE_KEYS: &[&str] = &["phone", "telefone", "celular"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Canonical record stripped of raw payloads and with identifiers masked.
pub struct SanitizedRecord {
    /// Service that produced the answer.
    pub service: ServiceId,
    /// Masked answer fields.
    pub data: Map<String, Value>,
    /// Parameters the provider echoed back, never masked.
    pub parameters: Map<String, Value>,
    /// When normalization happened.
    pub normalized_at: DateTime<Utc>,
    /// Normalization schema version.
    pub version: String,
}

/// Drop raw payloads and mask identifiers everywhere except under `parameters`.
///
/// Phone lookups additionally mask echoed phone numbers.
#[must_use]
pub fn sanitize_output(service: &ServiceId, record: CanonicalRecord) -> SanitizedRecord {
    let mask_phones = service.as_str() == "phone";
    let data = record
        .data
        .into_iter()
        .filter(|(key, _)| !is_raw_key(key))
        .map(|(key, value)| {
            let value = sanitize_value(&key, value, mask_phones);
            (key, value)
        })
        .collect();

    SanitizedRecord {
        service: record.service,
        data,
        parameters: record.parameters,
        normalized_at: record.normalized_at,
        version: record.version,
    }
}

fn is_raw_key(key: &str) -> bool {
    RAW_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

fn has_token(key: &str, tokens: &[&str]) -> bool {
    key.split(|ch: char| !ch.is_ascii_alphanumeric())
        .any(|token| tokens.contains(&token))
}

/// Whether `text` is a CPF or CNPJ, punctuated or not.
fn is_document_value(text: &str) -> bool {
    if !text
        .chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '/' | ' '))
    {
        return false;
    }
    let numbers: String = text.chars().filter(char::is_ascii_digit).collect();
    is_valid_document(&numbers)
}

/// Mask CPFs and CNPJs embedded in free text, word by word.
fn mask_embedded(text: &str) -> String {
    if is_document_value(text) {
        return mask_document(text);
    }
    text.split(' ')
        .map(|word| {
            let core = word.trim_matches(|ch: char| !ch.is_ascii_alphanumeric());
            if !core.is_empty() && is_document_value(core) {
                word.replacen(core, &mask_document(core), 1)
            } else {
                word.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn mask_text(masker: Option<fn(&str) -> String>, text: &str) -> String {
    match masker {
        // Values without digits, such as a status label, are not identifiers.
        Some(mask) if text.chars().any(|ch| ch.is_ascii_digit()) => mask(text),
        _ => mask_embedded(text),
    }
}

fn sanitize_value(key: &str, value: Value, mask_phones: bool) -> Value {
    let lowered = key.to_ascii_lowercase();
    let masker: Option<fn(&str) -> String> = if has_token(&lowered, DOCUMENT_KEYS) {
        Some(mask_document)
    } else if mask_phones && has_token(&lowered, PHONE_KEYS) {
        Some(mask_phone)
    } else if has_token(&lowered, PLATE_KEYS) {
        Some(mask_plate)
    } else {
        None
    };

    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(inner_key, _)| !is_raw_key(inner_key))
                .map(|(inner_key, inner)| {
                    let inner = sanitize_value(&inner_key, inner, mask_phones);
                    (inner_key, inner)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_value(key, item, mask_phones))
                .collect(),
        ),
        Value::String(text) => Value::String(mask_text(masker, &text)),
        Value::Number(number) => {
            let text = number.to_string();
            if masker.is_some() || is_document_value(&text) {
                Value::String(mask_text(masker, &text))
            } else {
                Value::Number(number)
            }
        }
        other => other,
    }
}
