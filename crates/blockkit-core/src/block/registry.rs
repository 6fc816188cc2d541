use std::collections::BTreeMap;
use std::sync::Arc;

use super::{InputHandler, InputKey};

/// Registry: `(block, input)` -> handler. Passed explicitly to [`App::new`](crate::App::new);
/// there is no process-wide registry.
#[derive(Default)]
pub struct BlockRegistry {
    handlers: BTreeMap<InputKey, Arc<dyn InputHandler>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Bind a handler to a block input. Registering the same input twice replaces the handler.
    pub fn register(
        &mut self,
        block: impl Into<String>,
        input: impl Into<String>,
        handler: impl InputHandler + 'static,
    ) {
        self.register_shared(InputKey::new(block, input), Arc::new(handler));
    }

    /// Bind an already shared handler, e.g. one handler serving several inputs.
    pub fn register_shared(&mut self, key: InputKey, handler: Arc<dyn InputHandler>) {
        self.handlers.insert(key, handler);
    }

    pub fn get(&self, key: &InputKey) -> Option<Arc<dyn InputHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &InputKey> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
