//! Schema-as-data: a small tagged shape shared by config, input and output checks.
//!
//! Shapes serialize with a `type` tag so they can be handed to the host as part of the
//! app manifest, e.g. `{"type":"object","properties":{"message":{"type":"string"}},"required":["message"]}`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-Schema-like shape. Validation lives in [`Schema::validate`] only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schema {
    Any,
    String,
    Number,
    Boolean,
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        required: BTreeSet<String>,
        #[serde(default = "default_true", rename = "additionalProperties")]
        additional_properties: bool,
    },
    Array {
        items: Box<Schema>,
    },
}

fn default_true() -> bool {
    true
}

impl Schema {
    /// Empty object shape that accepts undeclared properties.
    pub fn object() -> Self {
        Schema::Object {
            properties: BTreeMap::new(),
            required: BTreeSet::new(),
            additional_properties: true,
        }
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
        }
    }

    /// Add an optional property. No-op on non-object shapes.
    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        if let Schema::Object { properties, .. } = &mut self {
            properties.insert(name.into(), schema);
        }
        self
    }

    /// Add a property that must be present and non-null. No-op on non-object shapes.
    pub fn required_property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        if let Schema::Object {
            properties,
            required,
            ..
        } = &mut self
        {
            let name = name.into();
            properties.insert(name.clone(), schema);
            required.insert(name);
        }
        self
    }

    /// Reject properties that are not declared.
    pub fn deny_additional(mut self) -> Self {
        if let Schema::Object {
            additional_properties,
            ..
        } = &mut self
        {
            *additional_properties = false;
        }
        self
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::String => "string",
            Schema::Number => "number",
            Schema::Boolean => "boolean",
            Schema::Object { .. } => "object",
            Schema::Array { .. } => "array",
        }
    }

    /// Required property names for object shapes (empty otherwise).
    pub fn required_properties(&self) -> Vec<&str> {
        match self {
            Schema::Object { required, .. } => required.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Check `value` against this shape. Reports the first violation in key order.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.validate_at("$", value)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), SchemaViolation> {
        match (self, value) {
            (Schema::Any, _)
            | (Schema::String, Value::String(_))
            | (Schema::Number, Value::Number(_))
            | (Schema::Boolean, Value::Bool(_)) => Ok(()),
            (
                Schema::Object {
                    properties,
                    required,
                    additional_properties,
                },
                Value::Object(map),
            ) => {
                for name in required {
                    if map.get(name).is_none_or(Value::is_null) {
                        return Err(SchemaViolation::new(
                            path,
                            ViolationKind::MissingProperty {
                                property: name.clone(),
                            },
                        ));
                    }
                }
                for (name, item) in map {
                    match properties.get(name) {
                        // optional properties may be sent as null
                        Some(_) if item.is_null() => {}
                        Some(schema) => schema.validate_at(&format!("{path}.{name}"), item)?,
                        None if !additional_properties => {
                            return Err(SchemaViolation::new(
                                path,
                                ViolationKind::UnexpectedProperty {
                                    property: name.clone(),
                                },
                            ));
                        }
                        None => {}
                    }
                }
                Ok(())
            }
            (Schema::Array { items }, Value::Array(values)) => {
                for (idx, item) in values.iter().enumerate() {
                    items.validate_at(&format!("{path}[{idx}]"), item)?;
                }
                Ok(())
            }
            (expected, found) => Err(SchemaViolation::new(
                path,
                ViolationKind::TypeMismatch {
                    expected: expected.type_name().to_string(),
                    found: json_type_name(found).to_string(),
                },
            )),
        }
    }
}

/// JSON type name of a value, used in error messages instead of the value itself.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where and how a value failed its shape. Never carries the offending value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{path}: {kind}")]
pub struct SchemaViolation {
    pub path: String,
    pub kind: ViolationKind,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Name of the missing property, when that is the violation.
    pub fn missing_property(&self) -> Option<&str> {
        match &self.kind {
            ViolationKind::MissingProperty { property } => Some(property),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    #[error("missing required property `{property}`")]
    MissingProperty { property: String },
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("unexpected property `{property}`")]
    UnexpectedProperty { property: String },
}
