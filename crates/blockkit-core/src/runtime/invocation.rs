use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, oneshot, watch};
use tracing::{Instrument as _, info, info_span, warn};
use uuid::Uuid;

use super::Shared;
use crate::block::{CancellationSignal, EventContext, InputHandler, InputKey};
use crate::config::AppConfig;
use crate::emit::{EmitError, EmittedEvent, Emitter};
use crate::schema::SchemaViolation;

/// Why one invocation failed. Messages are redacted against the config snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationError {
    #[error("event parameters rejected: {violation}")]
    InputValidation { violation: SchemaViolation },
    #[error("handler failed: {message}")]
    Handler { message: String },
    #[error("emission failed: {error}")]
    Emission { error: EmitError },
    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

/// Terminal state of an invocation. Only `Completed` carries events; the other outcomes count
/// what was discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Completed {
        events: Vec<EmittedEvent>,
    },
    Failed {
        error: InvocationError,
        discarded: usize,
    },
    Cancelled {
        discarded: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationReport {
    pub invocation_id: Uuid,
    pub block: String,
    pub input: String,
    pub outcome: InvocationOutcome,
    pub elapsed_ms: u64,
}

impl InvocationReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Completed { .. })
    }

    /// Published events; empty unless the invocation completed.
    pub fn events(&self) -> &[EmittedEvent] {
        match &self.outcome {
            InvocationOutcome::Completed { events } => events,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&InvocationError> {
        match &self.outcome {
            InvocationOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Cancelled { .. })
    }
}

/// Requests cancellation of one invocation. Clones share the same flag.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Best effort: the handler sees the request through its [`EventContext`]; whatever it
    /// does, the invocation ends `Cancelled` and its events are discarded.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn signal(&self) -> CancellationSignal {
        CancellationSignal::new(self.tx.subscribe())
    }
}

/// Caller's handle on one dispatched event.
#[derive(Debug)]
pub struct InvocationHandle {
    id: Uuid,
    key: InputKey,
    abort: AbortHandle,
    report: oneshot::Receiver<InvocationReport>,
}

impl InvocationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &InputKey {
        &self.key
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Wait for the terminal report. An invocation dropped by the runtime before reporting
    /// (shutdown) is reported as cancelled.
    pub async fn wait(self) -> InvocationReport {
        match self.report.await {
            Ok(report) => report,
            Err(_) => InvocationReport {
                invocation_id: self.id,
                block: self.key.block,
                input: self.key.input,
                outcome: InvocationOutcome::Cancelled { discarded: 0 },
                elapsed_ms: 0,
            },
        }
    }
}

/// Queued event for one input's worker.
pub(super) struct Job {
    pub(super) id: Uuid,
    pub(super) key: InputKey,
    pub(super) params: Value,
    pub(super) abort: AbortHandle,
    pub(super) report_tx: oneshot::Sender<InvocationReport>,
}

impl Job {
    pub(super) fn new(key: InputKey, params: Value) -> (Self, InvocationHandle) {
        let id = Uuid::new_v4();
        let abort = AbortHandle::new();
        let (report_tx, report) = oneshot::channel();
        let handle = InvocationHandle {
            id,
            key: key.clone(),
            abort: abort.clone(),
            report,
        };
        let job = Self {
            id,
            key,
            params,
            abort,
            report_tx,
        };
        (job, handle)
    }
}

/// Run one job to its terminal report. `started` fires once the handler has been polled, or
/// is dropped if the handler is never called.
pub(super) async fn run_invocation(
    shared: Arc<Shared>,
    handler: Arc<dyn InputHandler>,
    job: Job,
    permit: OwnedSemaphorePermit,
    started: oneshot::Sender<()>,
) {
    let Job {
        id,
        key,
        params,
        abort,
        report_tx,
    } = job;
    let span = info_span!(
        "invocation",
        invocation_id = %id,
        block = %key.block,
        input = %key.input
    );

    async move {
        let started_at = Instant::now();
        let outcome = execute(&shared, handler, id, &key, params, &abort, started).await;
        drop(permit);
        shared.in_flight.remove(&id);

        let elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            InvocationOutcome::Completed { events } => {
                info!(events = events.len(), elapsed_ms, "invocation completed");
            }
            InvocationOutcome::Failed { error, discarded } => {
                warn!(%error, discarded, elapsed_ms, "invocation failed");
            }
            InvocationOutcome::Cancelled { discarded } => {
                info!(discarded, elapsed_ms, "invocation cancelled");
            }
        }

        let report = InvocationReport {
            invocation_id: id,
            block: key.block,
            input: key.input,
            outcome,
            elapsed_ms,
        };
        let _ = shared.reports.send(report.clone());
        let _ = report_tx.send(report);
    }
    .instrument(span)
    .await
}

async fn execute(
    shared: &Shared,
    handler: Arc<dyn InputHandler>,
    id: Uuid,
    key: &InputKey,
    params: Value,
    abort: &AbortHandle,
    started: oneshot::Sender<()>,
) -> InvocationOutcome {
    if abort.is_aborted() {
        return InvocationOutcome::Cancelled { discarded: 0 };
    }

    let config: Arc<AppConfig> = Arc::clone(&shared.config_rx.borrow());
    let definition = shared.app.shared_definition();
    if let Some(input) = definition.input_definition(key)
        && let Err(violation) = input.config.validate(&params)
    {
        return InvocationOutcome::Failed {
            error: InvocationError::InputValidation { violation },
            discarded: 0,
        };
    }

    let (emitter, mut buffer) = Emitter::new(definition, key.block.clone(), id);
    let ctx = EventContext::new(
        id,
        key.block.clone(),
        key.input.clone(),
        Arc::clone(&config),
        params,
        emitter.clone(),
        abort.signal(),
    );

    let task = tokio::spawn(async move {
        let mut fut = handler.handle(ctx);
        let first = futures::poll!(&mut fut);
        let _ = started.send(());
        match first {
            Poll::Ready(result) => result,
            Poll::Pending => fut.await,
        }
    });
    let joined = task.await;
    let events = buffer.drain();
    let discarded = events.len();

    let result = match joined {
        Ok(result) => result,
        Err(join_err) => {
            let message = panic_message(join_err);
            return InvocationOutcome::Failed {
                error: InvocationError::Panicked {
                    message: config.redact(&message),
                },
                discarded,
            };
        }
    };
    if let Some(error) = emitter.violation() {
        return InvocationOutcome::Failed {
            error: InvocationError::Emission { error },
            discarded,
        };
    }
    if abort.is_aborted() {
        return InvocationOutcome::Cancelled { discarded };
    }
    match result {
        Ok(()) => InvocationOutcome::Completed { events },
        Err(err) => InvocationOutcome::Failed {
            error: InvocationError::Handler {
                message: config.redact(&format!("{err:#}")),
            },
            discarded,
        },
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
