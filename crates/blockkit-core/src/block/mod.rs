//! # Block SDK
//!
//! A block is an addressable node with inputs and outputs. Each input is bound to an
//! [`InputHandler`] through the [`BlockRegistry`] handed to [`App::new`](crate::App::new).
//!
//! ## Handler contract
//!
//! - The handler receives an [`EventContext`] holding the resolved app config and the event
//!   parameters, already validated against the input's schema.
//! - Output is produced only through [`EventContext::emit`], zero or more times. The return
//!   value carries success or failure, never data.
//! - Fail by returning an error (`?` on anything, or `anyhow::bail!`). Panics are caught by the
//!   runtime and reported as failures too.
//! - The failure report redacts sensitive config values, but a panic message also reaches the
//!   process panic hook, which prints it to stderr as is. Never panic with a secret in the
//!   message; return an error instead.
//!
//! ## Cancellation
//!
//! The host may cancel an invocation. Handlers can poll [`EventContext::is_cancelled`] or await
//! [`EventContext::cancelled`]; ignoring the signal is allowed, the events are then discarded.

mod context;
mod registry;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

pub use context::{CancellationSignal, EventContext};
pub use registry::BlockRegistry;

/// Address of one block input: `(block id, input id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputKey {
    pub block: String,
    pub input: String,
}

impl InputKey {
    pub fn new(block: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            input: input.into(),
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block, self.input)
    }
}

/// Async event handler for one block input.
#[async_trait::async_trait]
pub trait InputHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()>;
}

/// Handler backed by an async closure. Build with [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> InputHandler for FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as an [`InputHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}
