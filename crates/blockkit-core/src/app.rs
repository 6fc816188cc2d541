//! App definition: the registration surface the host reads at load time.
//!
//! Block, input and output identifiers are persisted in the host's canvas wiring. Renaming
//! one breaks existing installations, so identifier changes are breaking releases even though
//! nothing here can enforce that.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::{BlockRegistry, InputHandler, InputKey};
use crate::schema::{Schema, json_type_name};

/// Config field types surfaced to the host's installer form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            FieldType::String => Schema::String,
            FieldType::Number => Schema::Number,
            FieldType::Boolean => Schema::Boolean,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        self.schema().validate(value).is_ok()
    }
}

/// One installer-facing configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFieldSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Value must never appear unmasked in logs or error messages.
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ConfigFieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            field_type,
            required: false,
            sensitive: false,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Input of a block: the shape incoming event parameters must satisfy. The handler is bound
/// separately through [`BlockRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: Schema,
}

impl InputDefinition {
    pub fn new(name: impl Into<String>, config: Schema) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            config,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: Schema,
    /// Canvas routing hint only; no runtime effect.
    #[serde(default)]
    pub default: bool,
}

impl OutputDefinition {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            default: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-text grouping for the host UI.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDefinition>,
}

impl BlockDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: String::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn input(mut self, id: impl Into<String>, input: InputDefinition) -> Self {
        self.inputs.insert(id.into(), input);
        self
    }

    pub fn output(mut self, id: impl Into<String>, output: OutputDefinition) -> Self {
        self.outputs.insert(id.into(), output);
        self
    }

    /// Output flagged as the default route, if any.
    pub fn default_output(&self) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(_, output)| output.default)
            .map(|(id, _)| id.as_str())
    }
}

/// Whole app: installer config schema plus the blocks keyed by their stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub name: String,
    /// Free-text installation instructions; may reference config fields by key.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigFieldSpec>,
    #[serde(default)]
    pub blocks: BTreeMap<String, BlockDefinition>,
}

impl AppDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: String::new(),
            config: BTreeMap::new(),
            blocks: BTreeMap::new(),
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn config_field(mut self, key: impl Into<String>, field: ConfigFieldSpec) -> Self {
        self.config.insert(key.into(), field);
        self
    }

    pub fn block(mut self, id: impl Into<String>, block: BlockDefinition) -> Self {
        self.blocks.insert(id.into(), block);
        self
    }

    pub fn input_keys(&self) -> impl Iterator<Item = InputKey> + '_ {
        self.blocks.iter().flat_map(|(block_id, block)| {
            block
                .inputs
                .keys()
                .map(move |input_id| InputKey::new(block_id.as_str(), input_id.as_str()))
        })
    }

    pub fn input_definition(&self, key: &InputKey) -> Option<&InputDefinition> {
        self.blocks
            .get(&key.block)
            .and_then(|block| block.inputs.get(&key.input))
    }
}

/// App definition rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("app name must not be empty")]
    EmptyAppName,
    #[error("invalid {what} identifier `{id}`: must be non-empty and contain no whitespace")]
    InvalidIdentifier { what: &'static str, id: String },
    #[error("default for config field `{field}` must be a {expected}, got {found}")]
    InvalidDefault {
        field: String,
        expected: String,
        found: String,
    },
    #[error("block `{block}` marks more than one output as default")]
    MultipleDefaultOutputs { block: String },
    #[error("no handler registered for input `{key}`")]
    MissingHandler { key: InputKey },
    #[error("handler registered for undeclared input `{key}`")]
    UnknownHandlerTarget { key: InputKey },
}

fn check_identifier(what: &'static str, id: &str) -> Result<(), DefinitionError> {
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(DefinitionError::InvalidIdentifier {
            what,
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Validated app: definition plus the handlers bound to each declared input. Cheap to clone.
#[derive(Clone)]
pub struct App {
    definition: Arc<AppDefinition>,
    registry: Arc<BlockRegistry>,
}

impl App {
    pub fn new(definition: AppDefinition, registry: BlockRegistry) -> Result<Self, DefinitionError> {
        if definition.name.trim().is_empty() {
            return Err(DefinitionError::EmptyAppName);
        }
        for key in definition.config.keys() {
            check_identifier("config field", key)?;
        }
        for (block_id, block) in &definition.blocks {
            check_identifier("block", block_id)?;
            for input_id in block.inputs.keys() {
                check_identifier("input", input_id)?;
            }
            for output_id in block.outputs.keys() {
                check_identifier("output", output_id)?;
            }
        }
        for (key, field) in &definition.config {
            if let Some(default) = &field.default
                && !field.field_type.matches(default)
            {
                return Err(DefinitionError::InvalidDefault {
                    field: key.clone(),
                    expected: field.field_type.as_str().to_string(),
                    found: json_type_name(default).to_string(),
                });
            }
        }
        for (block_id, block) in &definition.blocks {
            if block.outputs.values().filter(|o| o.default).count() > 1 {
                return Err(DefinitionError::MultipleDefaultOutputs {
                    block: block_id.clone(),
                });
            }
        }
        for key in definition.input_keys() {
            if registry.get(&key).is_none() {
                return Err(DefinitionError::MissingHandler { key });
            }
        }
        for key in registry.keys() {
            if definition.input_definition(key).is_none() {
                return Err(DefinitionError::UnknownHandlerTarget { key: key.clone() });
            }
        }
        Ok(Self {
            definition: Arc::new(definition),
            registry: Arc::new(registry),
        })
    }

    pub fn definition(&self) -> &AppDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub(crate) fn shared_definition(&self) -> Arc<AppDefinition> {
        Arc::clone(&self.definition)
    }

    pub(crate) fn handler(&self, key: &InputKey) -> Option<Arc<dyn InputHandler>> {
        self.registry.get(key)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.definition.name)
            .field("blocks", &self.definition.blocks.keys().collect::<Vec<_>>())
            .finish()
    }
}
