use serde_json::{Map, Value};

use crate::config::NormalizeConfig;

/// A deterministic payload transform applied after sampling and before batching.
pub trait Normalizer {
    fn normalize(&self, payload: Map<String, Value>) -> Map<String, Value>;
}

/// Normalizer that leaves payloads untouched.
pub struct Passthrough;

impl Normalizer for Passthrough {
    fn normalize(&self, payload: Map<String, Value>) -> Map<String, Value> {
        payload
    }
}

/// Rewrites phone-number-like top level payload fields to E.164.
///
/// A value is rewritten only when its digits unambiguously form a national number:
/// 10 digits get the default country code prepended, 11 digits starting with the default
/// country code get a `+`. Anything else, including non-string values, is left as is.
pub struct PhoneNormalizer {
    fields: Vec<String>,
    default_country_code: String,
}

impl PhoneNormalizer {
    pub fn new(fields: Vec<String>, default_country_code: &str) -> Self {
        Self {
            fields,
            default_country_code: default_country_code
                .trim()
                .trim_start_matches('+')
                .to_string(),
        }
    }

    pub fn from_config(config: &NormalizeConfig) -> Self {
        Self::new(
            config.normalize_phone_fields.0.clone(),
            &config.normalize_default_country_code,
        )
    }

    fn normalize_number(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }

        if trimmed.starts_with('+') {
            return Some(format!("+{digits}"));
        }

        let cc = &self.default_country_code;
        match digits.len() {
            10 => Some(format!("+{cc}{digits}")),
            len if len == 10 + cc.len() && digits.starts_with(cc.as_str()) => {
                Some(format!("+{digits}"))
            }
            _ => None,
        }
    }
}

impl Normalizer for PhoneNormalizer {
    fn normalize(&self, mut payload: Map<String, Value>) -> Map<String, Value> {
        for field in &self.fields {
            let Some(Value::String(raw)) = payload.get(field) else {
                continue;
            };
            if let Some(normalized) = self.normalize_number(raw) {
                payload.insert(field.clone(), Value::String(normalized));
            }
        }
        payload
    }
}
