//! Example block: formats the incoming `message` and emits it once on the default output.
//! The formatter is injected at registration: `register_example(registry, Arc::new(formatter))`.
//! [`crate::default_registry`] uses [`HandlebarsFormatter`].

mod handlebars_formatter;

use std::sync::Arc;

use anyhow::Context as _;
use blockkit_core::{
    BlockDefinition, BlockRegistry, EventContext, InputDefinition, InputHandler, OutputDefinition,
    Schema,
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::debug;

pub use handlebars_formatter::{DEFAULT_TEMPLATE, HandlebarsFormatter};

pub const EXAMPLE_BLOCK: &str = "example";
pub const DEFAULT_INPUT: &str = "default";
pub const DEFAULT_OUTPUT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("format failed: {0}")]
pub struct FormatError(pub String);

/// Turns the raw event message into the emitted one.
pub trait MessageFormatter: Send + Sync {
    fn format(&self, message: &str) -> Result<String, FormatError>;
}

pub fn definition() -> BlockDefinition {
    BlockDefinition::new("Example Block")
        .description("Formats the incoming message and emits it on the default output.")
        .category("Examples")
        .input(
            DEFAULT_INPUT,
            InputDefinition::new(
                "Default",
                Schema::object().required_property("message", Schema::String),
            )
            .description("Message to process."),
        )
        .output(
            DEFAULT_OUTPUT,
            OutputDefinition::new(
                "Default",
                Schema::object()
                    .required_property("message", Schema::String)
                    .required_property("originalMessage", Schema::String)
                    .property("processedAt", Schema::String),
            )
            .description("The processed message.")
            .as_default(),
        )
}

pub struct ExampleBlock {
    formatter: Arc<dyn MessageFormatter>,
}

impl ExampleBlock {
    pub fn new(formatter: Arc<dyn MessageFormatter>) -> Self {
        Self { formatter }
    }
}

#[async_trait::async_trait]
impl InputHandler for ExampleBlock {
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()> {
        let original = ctx
            .param_str("message")
            .context("event has no `message` parameter")?
            .to_string();
        let message = self.formatter.format(&original)?;
        debug!(
            base_url = ctx.config().get_str("baseUrl").unwrap_or_default(),
            "message formatted"
        );
        ctx.emit(
            DEFAULT_OUTPUT,
            json!({
                "message": message,
                "originalMessage": original,
                "processedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        )?;
        Ok(())
    }
}

/// Register the example block's default input with a formatter.
pub fn register_example(registry: &mut BlockRegistry, formatter: Arc<dyn MessageFormatter>) {
    registry.register(EXAMPLE_BLOCK, DEFAULT_INPUT, ExampleBlock::new(formatter));
}
