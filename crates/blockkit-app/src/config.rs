//! Installer config as a host would supply it: environment first, then an optional JSON file.

use std::path::Path;

use anyhow::{Context, bail};
use blockkit_core::{AppDefinition, FieldType};
use serde_json::{Map, Number, Value};
use tracing::debug;

pub const ENV_PREFIX: &str = "BLOCKKIT_CONFIG_";

/// Load `.env` files into the process environment. A missing file is not an error.
pub fn init_env() {
    let _ = dotenvy::from_path(Path::new(
        format!("{}/.env", env!("CARGO_MANIFEST_DIR")).as_str(),
    ));
    dotenvy::dotenv().ok();
}

/// `apiKey` -> `API_KEY`.
pub fn screaming_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.chars() {
        if !ch.is_ascii_alphanumeric() {
            out.push('_');
            prev_lower = false;
            continue;
        }
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch.to_ascii_uppercase());
    }
    out
}

pub fn env_var_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", screaming_snake(key))
}

/// Convert an environment string to the declared field type. Unparsable values stay strings,
/// so resolution reports the type mismatch by field name.
fn convert(field_type: FieldType, raw: String) -> Value {
    match field_type {
        FieldType::String => Value::String(raw),
        FieldType::Number => {
            let trimmed = raw.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Value::Number(n.into());
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(raw))
        }
        FieldType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Value::Bool(true),
            "0" | "false" | "no" | "off" => Value::Bool(false),
            _ => Value::String(raw),
        },
    }
}

/// Raw config from `BLOCKKIT_CONFIG_*` variables, for declared fields only.
pub fn from_env(
    definition: &AppDefinition,
    lookup: impl Fn(&str) -> Option<String>,
) -> Map<String, Value> {
    let mut raw = Map::new();
    for (key, field) in &definition.config {
        let var = env_var_name(key);
        if let Some(value) = lookup(&var) {
            debug!(field = %key, env = %var, "config field set from environment");
            raw.insert(key.clone(), convert(field.field_type, value));
        }
    }
    raw
}

/// Read a JSON object of config values.
pub fn from_file(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("config file {} must contain a JSON object", path.display()),
    }
}

/// Environment, then `file` on top. Later sources win per field.
pub fn load(
    definition: &AppDefinition,
    lookup: impl Fn(&str) -> Option<String>,
    file: Option<&Path>,
) -> anyhow::Result<Map<String, Value>> {
    let mut raw = from_env(definition, lookup);
    if let Some(path) = file {
        raw.extend(from_file(path)?);
    }
    Ok(raw)
}
