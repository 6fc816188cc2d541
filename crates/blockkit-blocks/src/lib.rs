//! Template app: one example block plus the definition the host loads. Start from
//! [`example_app`] and [`default_registry`], or [`app`] for both validated together.

mod example;

use std::sync::Arc;

use blockkit_core::{App, AppDefinition, BlockRegistry, ConfigFieldSpec, DefinitionError};

pub use example::{
    DEFAULT_INPUT, DEFAULT_OUTPUT, DEFAULT_TEMPLATE, EXAMPLE_BLOCK, ExampleBlock, FormatError,
    HandlebarsFormatter, MessageFormatter, register_example,
};

pub const APP_NAME: &str = "example-app";
pub const DEFAULT_BASE_URL: &str = "https://api.example.com";

/// Registration surface of the template app.
pub fn example_app() -> AppDefinition {
    AppDefinition::new(APP_NAME)
        .instructions(
            "Enter your `apiKey` to connect the app. `baseUrl` defaults to \
             https://api.example.com and only needs changing for self-hosted endpoints.",
        )
        .config_field(
            "apiKey",
            ConfigFieldSpec::string("API Key")
                .description("Key used to authenticate against the service.")
                .required()
                .sensitive(),
        )
        .config_field(
            "baseUrl",
            ConfigFieldSpec::string("Base URL")
                .description("Service endpoint.")
                .default_value(DEFAULT_BASE_URL),
        )
        .block(EXAMPLE_BLOCK, example::definition())
}

/// Registry with the example block bound to [`HandlebarsFormatter`].
pub fn default_registry() -> BlockRegistry {
    registry_with_formatter(Arc::new(HandlebarsFormatter::default()))
}

/// Registry with the example block bound to `formatter`.
pub fn registry_with_formatter(formatter: Arc<dyn MessageFormatter>) -> BlockRegistry {
    let mut r = BlockRegistry::new();
    register_example(&mut r, formatter);
    r
}

/// Validated template app with the default registry.
pub fn app() -> Result<App, DefinitionError> {
    App::new(example_app(), default_registry())
}
