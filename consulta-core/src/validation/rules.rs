//! Declarative input rules keyed by service.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::model::{LookupRequest, ServiceId};
use crate::ports::FieldError;
use crate::validation::documents::{
    is_valid_cnpj, is_valid_cpf, is_valid_document, is_valid_renavam,
};

/// Custom predicate with the message reported when it fails.
type Check = (fn(&str) -> bool, &'static str);

/// Constraints for one request field.
pub struct FieldRule {
    field: &'static str,
    required: bool,
    pattern: Option<Result<Regex, regex::Error>>,
    min_len: Option<usize>,
    max_len: Option<usize>,
    check: Option<Check>,
}

impl FieldRule {
    fn required(field: &'static str) -> Self {
        Self {
            field,
            required: true,
            pattern: None,
            min_len: None,
            max_len: None,
            check: None,
        }
    }

    fn optional(field: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(field)
        }
    }

    fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(pattern));
        self
    }

    fn length(mut self, min: usize, max: usize) -> Self {
        self.min_len = Some(min);
        self.max_len = Some(max);
        self
    }

    fn check(mut self, predicate: fn(&str) -> bool, message: &'static str) -> Self {
        self.check = Some((predicate, message));
        self
    }

    /// Field the rule applies to.
    #[must_use]
    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Evaluate the rule; `None` means the value passed.
    #[must_use]
    pub fn evaluate(&self, value: Option<&str>) -> Option<FieldError> {
        let Some(value) = value.filter(|value| !value.trim().is_empty()) else {
            return self
                .required
                .then(|| FieldError::new(self.field, "is required"));
        };

        let length = value.chars().count();
        if let Some(min) = self.min_len
            && length < min
        {
            return Some(FieldError::new(
                self.field,
                format!("must have at least {min} characters"),
            ));
        }
        if let Some(max) = self.max_len
            && length > max
        {
            return Some(FieldError::new(
                self.field,
                format!("must have at most {max} characters"),
            ));
        }
        match &self.pattern {
            Some(Ok(pattern)) if !pattern.is_match(value) => {
                return Some(FieldError::new(self.field, "has an invalid format"));
            }
            // Malformed patterns reject every value.
            Some(Err(_)) => {
                return Some(FieldError::new(self.field, "cannot be checked"));
            }
            _ => {}
        }
        if let Some((predicate, message)) = self.check
            && !predicate(value)
        {
            return Some(FieldError::new(self.field, message));
        }
        None
    }
}

fn is_valid_birth_date(raw: &str) -> bool {
    NaiveDate::parse_from_str(raw, "%d/%m/%Y").is_ok()
        || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

static RULES: LazyLock<HashMap<&'static str, Vec<FieldRule>>> = LazyLock::new(|| {
    HashMap::from([
        (
            "cpf",
            vec![
                FieldRule::required("cpf")
                    .pattern(r"^\d{11}$")
                    .check(is_valid_cpf, "invalid CPF check digits"),
                FieldRule::optional("birth_date")
                    .length(10, 10)
                    .check(is_valid_birth_date, "must be DD/MM/YYYY or YYYY-MM-DD"),
            ],
        ),
        (
            "cnpj",
            vec![
                FieldRule::required("cnpj")
                    .pattern(r"^\d{14}$")
                    .check(is_valid_cnpj, "invalid CNPJ check digits"),
            ],
        ),
        (
            "vehicle_plate",
            vec![
                FieldRule::required("plate")
                    .length(7, 7)
                    .pattern(r"^[A-Z]{3}[0-9][A-Z0-9][0-9]{2}$"),
            ],
        ),
        (
            "renavam",
            vec![
                FieldRule::required("renavam")
                    .pattern(r"^\d{11}$")
                    .check(is_valid_renavam, "invalid RENAVAM check digit"),
            ],
        ),
        (
            "phone",
            vec![
                FieldRule::required("phone")
                    .length(10, 11)
                    .pattern(r"^[1-9]{2}9?\d{8}$"),
            ],
        ),
        (
            "credit_score",
            vec![
                FieldRule::required("document")
                    .pattern(r"^(\d{11}|\d{14})$")
                    .check(is_valid_document, "must be a valid CPF or CNPJ"),
            ],
        ),
        ("cep", vec![FieldRule::required("cep").pattern(r"^\d{8}$")]),
    ])
});

/// Validate a request for `service` and return its canonical form.
///
/// Services without rules accept any request.
///
/// # Errors
///
/// Returns every failed rule when the request is invalid.
pub fn validate_input(
    service: &ServiceId,
    request: &LookupRequest,
) -> Result<LookupRequest, Vec<FieldError>> {
    let canonical = request.canonicalized();
    let Some(rules) = RULES.get(service.as_str()) else {
        return Ok(canonical);
    };

    let fields = canonical.fields();
    let errors: Vec<_> = rules
        .iter()
        .filter_map(|rule| {
            let value = fields
                .iter()
                .find(|(name, _)| *name == rule.field())
                .and_then(|(_, value)| *value);
            rule.evaluate(value)
        })
        .collect();

    if errors.is_empty() {
        Ok(canonical)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punctuated_cpf_is_canonicalized() {
        let request = LookupRequest::Cpf {
            cpf: "529.982.247-25".to_owned(),
            birth_date: Some("1990-05-17".to_owned()),
        };

        let canonical = validate_input(&ServiceId::from("cpf"), &request).expect("valid");
        assert_eq!(
            canonical,
            LookupRequest::Cpf {
                cpf: "52998224725".to_owned(),
                birth_date: Some("1990-05-17".to_owned()),
            }
        );
    }

    #[test]
    fn reports_every_failing_field() {
        let request = LookupRequest::Cpf {
            cpf: "123.456.789-00".to_owned(),
            birth_date: Some("31/02/1990".to_owned()),
        };

        let errors = validate_input(&ServiceId::from("cpf"), &request).expect_err("invalid");
        let fields: Vec<_> = errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(fields, vec!["cpf", "birth_date"]);
    }

    #[test]
    fn missing_required_field() {
        let request = LookupRequest::Cep {
            cep: "   ".to_owned(),
        };

        let errors = validate_input(&ServiceId::from("cep"), &request).expect_err("invalid");
        assert_eq!(errors, vec![FieldError::new("cep", "is required")]);
    }

    #[test]
    fn plates_in_both_formats() {
        for plate in ["abc-1234", "ABC1D23"] {
            let request = LookupRequest::VehiclePlate {
                plate: plate.to_owned(),
            };
            assert!(validate_input(&ServiceId::from("vehicle_plate"), &request).is_ok());
        }

        let request = LookupRequest::VehiclePlate {
            plate: "AB12345".to_owned(),
        };
        assert!(validate_input(&ServiceId::from("vehicle_plate"), &request).is_err());
    }

    #[test]
    fn credit_score_accepts_cpf_or_cnpj() {
        for document in ["529.982.247-25", "11.222.333/0001-81"] {
            let request = LookupRequest::CreditScore {
                document: document.to_owned(),
            };
            assert!(validate_input(&ServiceId::from("credit_score"), &request).is_ok());
        }
    }

    #[test]
    fn phone_length_bounds() {
        let request = LookupRequest::Phone {
            phone: "(11) 9876-543".to_owned(),
        };
        let errors = validate_input(&ServiceId::from("phone"), &request).expect_err("too short");
        assert_eq!(errors[0].message, "must have at least 10 characters");

        let request = LookupRequest::Phone {
            phone: "(11) 98765-4321".to_owned(),
        };
        assert!(validate_input(&ServiceId::from("phone"), &request).is_ok());
    }

    #[test]
    fn every_rule_pattern_compiles() {
        for (service, rules) in RULES.iter() {
            for rule in rules {
                assert!(
                    !matches!(rule.pattern, Some(Err(_))),
                    "{service}.{} has a malformed pattern",
                    rule.field
                );
            }
        }
    }

    #[test]
    fn malformed_pattern_rejects_every_value() {
        let rule = FieldRule::required("code").pattern(r"^(\d{3}$");

        assert_eq!(
            rule.evaluate(Some("123")),
            Some(FieldError::new("code", "cannot be checked"))
        );
    }
}
