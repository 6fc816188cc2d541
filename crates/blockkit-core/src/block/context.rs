use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::emit::{EmitError, Emitter};

/// Best-effort cancellation flag observed by a running handler.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the invocation is
    /// dropped without being cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything one handler invocation gets from the runtime.
#[derive(Clone)]
pub struct EventContext {
    invocation_id: Uuid,
    block_id: String,
    input_id: String,
    config: Arc<AppConfig>,
    params: Value,
    emitter: Emitter,
    cancel: CancellationSignal,
}

impl EventContext {
    pub(crate) fn new(
        invocation_id: Uuid,
        block_id: String,
        input_id: String,
        config: Arc<AppConfig>,
        params: Value,
        emitter: Emitter,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            invocation_id,
            block_id,
            input_id,
            config,
            params,
            emitter,
            cancel,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn input_id(&self) -> &str {
        &self.input_id
    }

    /// Resolved app config snapshot taken when this invocation started.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Event parameters, validated against the input schema.
    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    /// Emit `payload` on the declared output `output`.
    pub fn emit(&self, output: &str, payload: Value) -> Result<(), EmitError> {
        self.emitter.emit(output, payload)
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("invocation_id", &self.invocation_id)
            .field("block_id", &self.block_id)
            .field("input_id", &self.input_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
