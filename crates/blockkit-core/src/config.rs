//! Installer config resolution against the app's config schema.
//!
//! Blank values (`null` or whitespace-only strings) count as unset: they fall back to the
//! declared default, and fail resolution when the field is required and has none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Map, Value};
use tracing::debug;

use crate::app::AppDefinition;
use crate::schema::json_type_name;

/// Replacement text for sensitive values.
pub const MASK: &str = "********";

/// Config rejected before the app may start. Messages name fields, never values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("required config field `{field}` is missing")]
    MissingRequired { field: String },
    #[error("config field `{field}` must be a {expected}, got {found}")]
    InvalidType {
        field: String,
        expected: String,
        found: String,
    },
}

impl ConfigError {
    pub fn field(&self) -> &str {
        match self {
            ConfigError::MissingRequired { field } | ConfigError::InvalidType { field, .. } => {
                field
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Validate raw host-supplied values and produce an immutable snapshot.
pub fn resolve_config(
    definition: &AppDefinition,
    raw: &Map<String, Value>,
) -> Result<AppConfig, ConfigError> {
    let mut values = BTreeMap::new();
    let mut sensitive = BTreeSet::new();

    for (key, field) in &definition.config {
        if field.sensitive {
            sensitive.insert(key.clone());
        }
        let supplied = raw.get(key).filter(|v| !is_blank(v));
        let value = match (supplied, &field.default) {
            (Some(value), _) => {
                if !field.field_type.matches(value) {
                    return Err(ConfigError::InvalidType {
                        field: key.clone(),
                        expected: field.field_type.as_str().to_string(),
                        found: json_type_name(value).to_string(),
                    });
                }
                value.clone()
            }
            (None, Some(default)) => default.clone(),
            (None, None) if field.required => {
                return Err(ConfigError::MissingRequired { field: key.clone() });
            }
            (None, None) => continue,
        };
        values.insert(key.clone(), value);
    }

    for key in raw.keys().filter(|k| !definition.config.contains_key(*k)) {
        debug!(field = %key, "ignoring undeclared config field");
    }

    Ok(AppConfig { values, sensitive })
}

/// Resolved config snapshot. Never mutated; an installer update produces a new one.
#[derive(Clone, Default, PartialEq)]
pub struct AppConfig {
    values: BTreeMap<String, Value>,
    sensitive: BTreeSet<String>,
}

impl AppConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// JSON view safe for logs: sensitive values replaced by [`MASK`].
    pub fn masked(&self) -> Value {
        let map = self
            .values
            .iter()
            .map(|(key, value)| {
                let shown = if self.is_sensitive(key) {
                    Value::String(MASK.to_string())
                } else {
                    value.clone()
                };
                (key.clone(), shown)
            })
            .collect::<Map<_, _>>();
        Value::Object(map)
    }

    /// Replace every sensitive string or number value occurring in `text` with [`MASK`].
    ///
    /// Sensitive booleans are left alone: `true`/`false` carry one bit and masking them would
    /// mangle unrelated words.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for key in &self.sensitive {
            let secret = match self.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };
            if !secret.is_empty() {
                out = out.replace(&secret, MASK);
            }
        }
        out
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("values", &self.masked())
            .finish()
    }
}
