use serde_json::json;

use super::{FormatError, MessageFormatter};

pub const DEFAULT_TEMPLATE: &str = "Processed: {{message}}";

/// Default formatter: renders a handlebars template with `message` in scope. Output is plain
/// text, so HTML escaping is off.
#[derive(Debug, Clone)]
pub struct HandlebarsFormatter {
    template: String,
}

impl HandlebarsFormatter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl Default for HandlebarsFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl MessageFormatter for HandlebarsFormatter {
    fn format(&self, message: &str) -> Result<String, FormatError> {
        let mut reg = handlebars::Handlebars::new();
        reg.register_escape_fn(handlebars::no_escape);
        reg.set_strict_mode(true);
        reg.render_template(&self.template, &json!({ "message": message }))
            .map_err(|e| FormatError(e.to_string()))
    }
}
