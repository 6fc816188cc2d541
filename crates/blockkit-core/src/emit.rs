//! Output emission for a single invocation.
//!
//! Events are checked against the block's declared outputs, numbered, and buffered. The
//! runtime publishes the buffer only when the invocation completes successfully.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::app::AppDefinition;
use crate::schema::SchemaViolation;

/// One event produced by a handler on one of its block's outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    pub invocation_id: Uuid,
    pub block: String,
    pub output: String,
    /// Position within the invocation, from 0.
    pub seq: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmitError {
    #[error("block `{block}` has no output `{output}`")]
    UndeclaredOutput { block: String, output: String },
    #[error("payload for output `{output}` violates its schema: {violation}")]
    PayloadViolation {
        output: String,
        violation: SchemaViolation,
    },
    #[error("invocation {invocation_id} is already finished; cannot emit on `{output}`")]
    InvocationClosed { invocation_id: Uuid, output: String },
}

struct EmitterInner {
    invocation_id: Uuid,
    block: String,
    definition: Arc<AppDefinition>,
    next_seq: AtomicU64,
    tx: mpsc::UnboundedSender<EmittedEvent>,
    violation: OnceLock<EmitError>,
}

/// Emission handle of one invocation of one block. Clones share the same sequence.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

impl Emitter {
    pub(crate) fn new(
        definition: Arc<AppDefinition>,
        block: impl Into<String>,
        invocation_id: Uuid,
    ) -> (Self, EmitBuffer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Self {
            inner: Arc::new(EmitterInner {
                invocation_id,
                block: block.into(),
                definition,
                next_seq: AtomicU64::new(0),
                tx,
                violation: OnceLock::new(),
            }),
        };
        (emitter, EmitBuffer { rx })
    }

    /// Emit `payload` on output `output`. The output id is checked before the payload.
    ///
    /// A rejected emit is also recorded on the invocation, so the invocation fails even when
    /// the handler ignores the returned error.
    pub fn emit(&self, output: &str, payload: Value) -> Result<(), EmitError> {
        let inner = &self.inner;
        let declared = inner
            .definition
            .blocks
            .get(&inner.block)
            .and_then(|block| block.outputs.get(output));
        let Some(declared) = declared else {
            return Err(self.reject(EmitError::UndeclaredOutput {
                block: inner.block.clone(),
                output: output.to_string(),
            }));
        };
        if let Err(violation) = declared.schema.validate(&payload) {
            return Err(self.reject(EmitError::PayloadViolation {
                output: output.to_string(),
                violation,
            }));
        }

        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = EmittedEvent {
            invocation_id: inner.invocation_id,
            block: inner.block.clone(),
            output: output.to_string(),
            seq,
            payload,
        };
        inner
            .tx
            .send(event)
            .map_err(|_| EmitError::InvocationClosed {
                invocation_id: inner.invocation_id,
                output: output.to_string(),
            })?;
        debug!(output, seq, "event emitted");
        Ok(())
    }

    pub fn invocation_id(&self) -> Uuid {
        self.inner.invocation_id
    }

    pub fn block(&self) -> &str {
        &self.inner.block
    }

    /// Number of events accepted so far.
    pub fn emitted(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    /// First rejected emit of this invocation, if any.
    pub(crate) fn violation(&self) -> Option<EmitError> {
        self.inner.violation.get().cloned()
    }

    fn reject(&self, err: EmitError) -> EmitError {
        let _ = self.inner.violation.set(err.clone());
        err
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("invocation_id", &self.inner.invocation_id)
            .field("block", &self.inner.block)
            .field("emitted", &self.emitted())
            .finish()
    }
}

/// Receiving side of an invocation's events. Dropping it closes the emitter.
pub(crate) struct EmitBuffer {
    rx: mpsc::UnboundedReceiver<EmittedEvent>,
}

impl EmitBuffer {
    /// Take every event emitted so far, in `seq` order.
    pub(crate) fn drain(&mut self) -> Vec<EmittedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events.sort_by_key(|event| event.seq);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{BlockDefinition, OutputDefinition};
    use crate::schema::{Schema, ViolationKind};
    use serde_json::json;

    fn definition() -> Arc<AppDefinition> {
        Arc::new(
            AppDefinition::new("emit-test").block(
                "example",
                BlockDefinition::new("Example")
                    .output(
                        "default",
                        OutputDefinition::new(
                            "Default",
                            Schema::object().required_property("message", Schema::String),
                        )
                        .as_default(),
                    )
                    .output("raw", OutputDefinition::new("Raw", Schema::Any)),
            ),
        )
    }

    #[test]
    fn accepted_events_are_numbered_from_zero() {
        let (emitter, mut buffer) = Emitter::new(definition(), "example", Uuid::new_v4());
        emitter.emit("default", json!({"message": "a"})).unwrap();
        emitter.emit("raw", json!(42)).unwrap();
        emitter.emit("default", json!({"message": "b"})).unwrap();

        let events = buffer.drain();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(events[1].output, "raw");
        assert_eq!(events[2].payload["message"], "b");
        assert_eq!(emitter.emitted(), 3);
        assert!(emitter.violation().is_none());
    }

    #[test]
    fn undeclared_output_is_rejected_even_with_valid_payload() {
        let (emitter, mut buffer) = Emitter::new(definition(), "example", Uuid::new_v4());
        let err = emitter
            .emit("missing", json!({"message": "fine"}))
            .unwrap_err();
        assert_eq!(
            err,
            EmitError::UndeclaredOutput {
                block: "example".into(),
                output: "missing".into()
            }
        );
        assert_eq!(emitter.violation(), Some(err));
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn payload_must_match_output_schema() {
        let (emitter, _buffer) = Emitter::new(definition(), "example", Uuid::new_v4());
        let err = emitter.emit("default", json!({"message": 1})).unwrap_err();
        let EmitError::PayloadViolation { output, violation } = err else {
            panic!("expected payload violation");
        };
        assert_eq!(output, "default");
        assert_eq!(violation.path, "$.message");
        assert!(matches!(violation.kind, ViolationKind::TypeMismatch { .. }));
        assert_eq!(emitter.emitted(), 0);
    }

    #[test]
    fn first_violation_is_kept() {
        let (emitter, _buffer) = Emitter::new(definition(), "example", Uuid::new_v4());
        let first = emitter.emit("nope", json!(null)).unwrap_err();
        let _ = emitter.emit("default", json!({}));
        assert_eq!(emitter.violation(), Some(first));
    }

    #[test]
    fn emitting_after_buffer_dropped_reports_closed_invocation() {
        let id = Uuid::new_v4();
        let (emitter, buffer) = Emitter::new(definition(), "example", id);
        drop(buffer);
        let err = emitter.emit("raw", json!("late")).unwrap_err();
        assert_eq!(
            err,
            EmitError::InvocationClosed {
                invocation_id: id,
                output: "raw".into()
            }
        );
        assert!(emitter.violation().is_none());
    }

    #[test]
    fn emit_error_serializes_with_kind_tag() {
        let err = EmitError::UndeclaredOutput {
            block: "example".into(),
            output: "x".into(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "undeclared_output");
        assert_eq!(value["output"], "x");
    }
}
