//! Dispatch runtime: per-input FIFO queues, invocation lifecycle, config snapshots.
//!
//! One worker task per `(block, input)` starts invocations in enqueue order. An invocation
//! counts as started once its handler has been polled; only then does the worker take the
//! next event, so invocations of one input overlap but never start out of order.
//! Execution is at-most-once: nothing here retries.

mod invocation;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::app::App;
use crate::block::{InputHandler, InputKey};
use crate::config::{AppConfig, ConfigError, resolve_config};

pub use invocation::{
    AbortHandle, InvocationError, InvocationHandle, InvocationOutcome, InvocationReport,
};
use invocation::{Job, run_invocation};

/// Runtime tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOptions {
    /// Upper bound on handlers running at once, across all inputs.
    pub max_concurrent_invocations: usize,
    /// Capacity of the report broadcast; slow subscribers lag rather than block.
    pub report_buffer: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: 256,
            report_buffer: 1024,
        }
    }
}

/// Startup failure.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("runtime must be started inside a tokio runtime: {0}")]
    NoAsyncRuntime(String),
}

/// Event could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown block `{block}`")]
    UnknownBlock { block: String },
    #[error("block `{block}` has no input `{input}`")]
    UnknownInput { block: String, input: String },
    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// State shared with workers and invocation tasks.
struct Shared {
    app: App,
    config_rx: watch::Receiver<Arc<AppConfig>>,
    in_flight: DashMap<Uuid, AbortHandle>,
    permits: Arc<Semaphore>,
    reports: broadcast::Sender<InvocationReport>,
}

struct RuntimeInner {
    shared: Arc<Shared>,
    config_tx: watch::Sender<Arc<AppConfig>>,
    queues: DashMap<InputKey, mpsc::UnboundedSender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Running app. Cheap to clone; clones drive the same queues.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Resolve `raw_config` and spawn one worker per declared input. Refuses to start on a
    /// configuration error.
    pub fn start(
        app: App,
        raw_config: &Map<String, Value>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RuntimeError::NoAsyncRuntime(e.to_string()))?;
        let config = resolve_config(app.definition(), raw_config)?;
        info!(app = %app.name(), config = %config.masked(), "starting runtime");

        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        let (reports, _) = broadcast::channel(options.report_buffer.max(1));
        let shared = Arc::new(Shared {
            app: app.clone(),
            config_rx,
            in_flight: DashMap::new(),
            permits: Arc::new(Semaphore::new(options.max_concurrent_invocations.max(1))),
            reports,
        });

        let queues = DashMap::new();
        let mut workers = Vec::new();
        for key in app.definition().input_keys() {
            let Some(handler) = app.handler(&key) else {
                error!(input = %key, "no handler bound; input will reject events");
                continue;
            };
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(handle.spawn(run_worker(
                Arc::clone(&shared),
                key.clone(),
                handler,
                rx,
            )));
            queues.insert(key, tx);
        }

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                shared,
                config_tx,
                queues,
                workers: Mutex::new(workers),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Queue one event for `block`/`input`. Returns without waiting for the handler.
    pub fn dispatch(
        &self,
        block: &str,
        input: &str,
        params: Value,
    ) -> Result<InvocationHandle, DispatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        let definition = self.inner.shared.app.definition();
        let Some(block_def) = definition.blocks.get(block) else {
            return Err(DispatchError::UnknownBlock {
                block: block.to_string(),
            });
        };
        if !block_def.inputs.contains_key(input) {
            return Err(DispatchError::UnknownInput {
                block: block.to_string(),
                input: input.to_string(),
            });
        }

        let key = InputKey::new(block, input);
        let queue = self
            .inner
            .queues
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::ShuttingDown)?;
        let (job, handle) = Job::new(key, params);
        self.enqueue(&queue, job)?;
        debug!(invocation_id = %handle.id(), block, input, "event queued");
        Ok(handle)
    }

    /// Track `job` as in flight and hand it to its worker.
    fn enqueue(
        &self,
        queue: &mpsc::UnboundedSender<Job>,
        job: Job,
    ) -> Result<(), DispatchError> {
        let id = job.id;
        let abort = job.abort.clone();
        self.inner.shared.in_flight.insert(id, abort.clone());
        // shutdown may have swept in_flight between the caller's check and the insert
        if self.inner.closed.load(Ordering::SeqCst) {
            abort.abort();
            self.inner.shared.in_flight.remove(&id);
            return Err(DispatchError::ShuttingDown);
        }
        if queue.send(job).is_err() {
            self.inner.shared.in_flight.remove(&id);
            return Err(DispatchError::ShuttingDown);
        }
        Ok(())
    }

    /// Validate a new installer config and make it the snapshot for invocations that start
    /// from now on. Running invocations keep theirs.
    pub fn update_config(&self, raw_config: &Map<String, Value>) -> Result<(), ConfigError> {
        let config = resolve_config(self.inner.shared.app.definition(), raw_config)?;
        info!(config = %config.masked(), "config updated");
        self.inner.config_tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn current_config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.inner.config_tx.borrow())
    }

    /// Every terminal report, for host-side observability and alerting.
    pub fn subscribe(&self) -> broadcast::Receiver<InvocationReport> {
        self.inner.shared.reports.subscribe()
    }

    pub fn app(&self) -> &App {
        &self.inner.shared.app
    }

    /// Invocations dispatched but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.in_flight.len()
    }

    /// Stop accepting events, cancel everything queued or running, and wait for the workers
    /// to drain their queues.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight(), "shutting down runtime");
        for entry in self.inner.shared.in_flight.iter() {
            entry.value().abort();
        }
        self.inner.queues.clear();

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task failed");
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("app", &self.inner.shared.app)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    key: InputKey,
    handler: Arc<dyn InputHandler>,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    debug!(input = %key, "worker started");
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&shared.permits).acquire_owned().await else {
            break;
        };
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(run_invocation(
            Arc::clone(&shared),
            Arc::clone(&handler),
            job,
            permit,
            started_tx,
        ));
        // Err means the handler was never called (cancelled or invalid params).
        let _ = started_rx.await;
    }
    debug!(input = %key, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{
        AppDefinition, BlockDefinition, ConfigFieldSpec, InputDefinition, OutputDefinition,
    };
    use crate::block::{BlockRegistry, EventContext, handler_fn};
    use crate::emit::EmitError;
    use crate::schema::Schema;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    const WAIT: Duration = Duration::from_secs(5);

    fn definition() -> AppDefinition {
        AppDefinition::new("runtime-test")
            .config_field(
                "apiKey",
                ConfigFieldSpec::string("API Key").required().sensitive(),
            )
            .config_field(
                "label",
                ConfigFieldSpec::string("Label").default_value("first"),
            )
            .block(
                "work",
                BlockDefinition::new("Work")
                    .input(
                        "default",
                        InputDefinition::new(
                            "Default",
                            Schema::object().required_property("message", Schema::String),
                        ),
                    )
                    .input("other", InputDefinition::new("Other", Schema::Any))
                    .output(
                        "default",
                        OutputDefinition::new(
                            "Default",
                            Schema::object().required_property("message", Schema::String),
                        )
                        .as_default(),
                    ),
            )
    }

    fn raw_config() -> Map<String, Value> {
        json!({"apiKey": "secret123"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn start_with<H, O>(default: H, other: O) -> Runtime
    where
        H: InputHandler + 'static,
        O: InputHandler + 'static,
    {
        start_with_options(default, other, RuntimeOptions::default())
    }

    fn start_with_options<H, O>(default: H, other: O, options: RuntimeOptions) -> Runtime
    where
        H: InputHandler + 'static,
        O: InputHandler + 'static,
    {
        let mut registry = BlockRegistry::new();
        registry.register("work", "default", default);
        registry.register("work", "other", other);
        let app = App::new(definition(), registry).unwrap();
        Runtime::start(app, &raw_config(), options).unwrap()
    }

    fn single_permit() -> RuntimeOptions {
        RuntimeOptions {
            max_concurrent_invocations: 1,
            ..RuntimeOptions::default()
        }
    }

    fn noop() -> impl InputHandler {
        handler_fn(|_ctx| async { anyhow::Ok(()) })
    }

    fn echo() -> impl InputHandler {
        handler_fn(|ctx: EventContext| async move {
            let message = ctx.param_str("message").unwrap_or_default().to_string();
            ctx.emit("default", json!({ "message": message }))?;
            anyhow::Ok(())
        })
    }

    async fn wait(handle: InvocationHandle) -> InvocationReport {
        tokio::time::timeout(WAIT, handle.wait())
            .await
            .expect("invocation should finish")
    }

    #[tokio::test]
    async fn completed_invocation_publishes_emitted_events() {
        let rt = start_with(echo(), noop());
        let handle = rt.dispatch("work", "default", json!({"message": "hi"})).unwrap();
        let id = handle.id();
        let report = wait(handle).await;
        assert!(report.is_success());
        assert_eq!(report.invocation_id, id);
        let events = report.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].output, "default");
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[0].invocation_id, id);
        assert_eq!(events[0].payload["message"], "hi");
    }

    #[tokio::test]
    async fn start_refused_when_required_config_missing() {
        let mut registry = BlockRegistry::new();
        registry.register("work", "default", noop());
        registry.register("work", "other", noop());
        let app = App::new(definition(), registry).unwrap();
        let err = Runtime::start(app, &Map::new(), RuntimeOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Config(ConfigError::MissingRequired { ref field }) if field == "apiKey"
        ));
    }

    #[tokio::test]
    async fn missing_required_param_never_reaches_handler() {
        let calls = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                anyhow::Ok(())
            }
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({})).unwrap()).await;
        match report.error() {
            Some(InvocationError::InputValidation { violation }) => {
                assert_eq!(violation.missing_property(), Some("message"));
            }
            other => panic!("expected input validation error, got {other:?}"),
        }
        assert!(report.events().is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn events_start_in_fifo_order_even_when_later_ones_finish_first() {
        let started = Arc::new(StdMutex::new(Vec::new()));
        let finished = Arc::new(StdMutex::new(Vec::new()));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let handler = handler_fn(move |ctx: EventContext| {
            let (started, finished) = (Arc::clone(&s), Arc::clone(&f));
            async move {
                let message = ctx.param_str("message").unwrap_or_default().to_string();
                started.lock().unwrap().push(message.clone());
                let delay = if message == "A" { 80 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finished.lock().unwrap().push(message);
                anyhow::Ok(())
            }
        });
        let rt = start_with(handler, noop());
        let a = rt.dispatch("work", "default", json!({"message": "A"})).unwrap();
        let b = rt.dispatch("work", "default", json!({"message": "B"})).unwrap();
        assert!(wait(a).await.is_success());
        assert!(wait(b).await.is_success());
        assert_eq!(*started.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(*finished.lock().unwrap(), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn many_events_start_in_enqueue_order() {
        let started = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&started);
        let handler = handler_fn(move |ctx: EventContext| {
            let started = Arc::clone(&s);
            async move {
                let message = ctx.param_str("message").unwrap_or_default().to_string();
                started.lock().unwrap().push(message);
                tokio::task::yield_now().await;
                anyhow::Ok(())
            }
        });
        let rt = start_with(handler, noop());
        let handles = (0..20)
            .map(|i| {
                rt.dispatch("work", "default", json!({ "message": i.to_string() }))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(wait(handle).await.is_success());
        }
        let expected = (0..20).map(|i| i.to_string()).collect::<Vec<_>>();
        assert_eq!(*started.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn invocations_of_one_input_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        let handler = handler_fn(move |_ctx| {
            let barrier = Arc::clone(&b);
            async move {
                barrier.wait().await;
                anyhow::Ok(())
            }
        });
        let rt = start_with(handler, noop());
        let first = rt.dispatch("work", "default", json!({"message": "1"})).unwrap();
        let second = rt.dispatch("work", "default", json!({"message": "2"})).unwrap();
        assert!(wait(first).await.is_success());
        assert!(wait(second).await.is_success());
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_invocation() {
        let handler = handler_fn(|ctx: EventContext| async move {
            if ctx.param_str("message") == Some("explode") {
                panic!("handler blew up");
            }
            ctx.emit("default", json!({"message": "ok"}))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let bad = rt
            .dispatch("work", "default", json!({"message": "explode"}))
            .unwrap();
        let good = rt.dispatch("work", "default", json!({"message": "fine"})).unwrap();
        let bad = wait(bad).await;
        assert_eq!(
            bad.error(),
            Some(&InvocationError::Panicked {
                message: "handler blew up".into()
            })
        );
        assert_eq!(wait(good).await.events().len(), 1);
    }

    #[tokio::test]
    async fn handler_error_discards_earlier_emits() {
        let handler = handler_fn(|ctx: EventContext| async move {
            ctx.emit("default", json!({"message": "partial"}))?;
            Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert_eq!(
            report.outcome,
            InvocationOutcome::Failed {
                error: InvocationError::Handler {
                    message: "downstream unavailable".into()
                },
                discarded: 1
            }
        );
        assert!(report.events().is_empty());
    }

    #[tokio::test]
    async fn undeclared_output_fails_invocation() {
        let handler = handler_fn(|ctx: EventContext| async move {
            ctx.emit("missing", json!({"message": "x"}))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert_eq!(
            report.error(),
            Some(&InvocationError::Emission {
                error: EmitError::UndeclaredOutput {
                    block: "work".into(),
                    output: "missing".into()
                }
            })
        );
    }

    #[tokio::test]
    async fn swallowed_emit_error_still_fails_invocation() {
        let handler = handler_fn(|ctx: EventContext| async move {
            let _ = ctx.emit("missing", json!({}));
            ctx.emit("default", json!({"message": "after"}))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert!(matches!(
            report.outcome,
            InvocationOutcome::Failed {
                error: InvocationError::Emission { .. },
                discarded: 1
            }
        ));
    }

    #[tokio::test]
    async fn invalid_payload_fails_invocation() {
        let handler = handler_fn(|ctx: EventContext| async move {
            ctx.emit("default", json!({"message": 7}))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert!(matches!(
            report.error(),
            Some(InvocationError::Emission {
                error: EmitError::PayloadViolation { .. }
            })
        ));
    }

    #[tokio::test]
    async fn cancelled_invocation_reports_cancelled_and_discards_events() {
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered = Arc::new(StdMutex::new(Some(entered_tx)));
        let handler = handler_fn(move |ctx: EventContext| {
            let entered = Arc::clone(&entered);
            async move {
                ctx.emit("default", json!({"message": "before"}))?;
                if let Some(tx) = entered.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                ctx.cancelled().await;
                anyhow::Ok(())
            }
        });
        let rt = start_with(handler, noop());
        let handle = rt.dispatch("work", "default", json!({"message": "x"})).unwrap();
        entered_rx.await.unwrap();
        handle.cancel();
        let report = wait(handle).await;
        assert_eq!(report.outcome, InvocationOutcome::Cancelled { discarded: 1 });
    }

    #[tokio::test]
    async fn handler_ignoring_cancellation_is_still_cancelled() {
        let handler = handler_fn(|ctx: EventContext| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ctx.emit("default", json!({"message": "late"}))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let handle = rt.dispatch("work", "default", json!({"message": "x"})).unwrap();
        handle.cancel();
        let report = wait(handle).await;
        assert!(report.is_cancelled());
        assert!(report.events().is_empty());
    }

    #[tokio::test]
    async fn handler_errors_are_redacted() {
        let handler = handler_fn(|ctx: EventContext| async move {
            let key = ctx.config().get_str("apiKey").unwrap_or_default().to_string();
            Err::<(), _>(anyhow::anyhow!("auth rejected for key {key}"))
        });
        let rt = start_with(handler, noop());
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        let message = report.error().map(ToString::to_string).unwrap_or_default();
        assert!(!message.contains("secret123"), "{message}");
        assert!(message.contains("********"));
    }

    #[tokio::test]
    async fn sensitive_numbers_are_redacted_from_handler_errors() {
        let handler = handler_fn(|ctx: EventContext| async move {
            let pin = ctx.config().get_f64("pin").unwrap_or_default();
            Err::<(), _>(anyhow::anyhow!("pin {pin} rejected"))
        });
        let mut registry = BlockRegistry::new();
        registry.register("work", "default", handler);
        registry.register("work", "other", noop());
        let def = definition().config_field("pin", ConfigFieldSpec::number("PIN").sensitive());
        let app = App::new(def, registry).unwrap();
        let mut raw = raw_config();
        raw.insert("pin".into(), json!(987654));
        let rt = Runtime::start(app, &raw, RuntimeOptions::default()).unwrap();
        let report = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        let message = report.error().map(ToString::to_string).unwrap_or_default();
        assert!(!message.contains("987654"), "{message}");
        assert!(message.contains("********"));
    }

    #[tokio::test]
    async fn config_update_applies_to_later_invocations() {
        let handler = handler_fn(|ctx: EventContext| async move {
            let label = ctx.config().get_str("label").unwrap_or_default().to_string();
            ctx.emit("default", json!({ "message": label }))?;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let first = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert_eq!(first.events()[0].payload["message"], "first");

        let mut raw = raw_config();
        raw.insert("label".into(), json!("second"));
        rt.update_config(&raw).unwrap();
        assert_eq!(rt.current_config().get_str("label"), Some("second"));
        let second = wait(rt.dispatch("work", "default", json!({"message": "x"})).unwrap()).await;
        assert_eq!(second.events()[0].payload["message"], "second");

        assert!(rt.update_config(&Map::new()).is_err());
        assert_eq!(rt.current_config().get_str("label"), Some("second"));
    }

    #[tokio::test]
    async fn unknown_targets_are_rejected_synchronously() {
        let rt = start_with(noop(), noop());
        assert_eq!(
            rt.dispatch("nope", "default", json!({})).unwrap_err(),
            DispatchError::UnknownBlock {
                block: "nope".into()
            }
        );
        assert_eq!(
            rt.dispatch("work", "nope", json!({})).unwrap_err(),
            DispatchError::UnknownInput {
                block: "work".into(),
                input: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn inputs_are_independent() {
        let rt = start_with(echo(), noop());
        let other = rt.dispatch("work", "other", json!("anything")).unwrap();
        let default = rt.dispatch("work", "default", json!({"message": "m"})).unwrap();
        assert!(wait(other).await.is_success());
        assert_eq!(wait(default).await.events().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_every_terminal_report() {
        let rt = start_with(echo(), noop());
        let mut reports = rt.subscribe();
        let ok = rt.dispatch("work", "default", json!({"message": "m"})).unwrap();
        let ok_id = ok.id();
        wait(ok).await;
        let bad = rt.dispatch("work", "default", json!({})).unwrap();
        let bad_id = bad.id();
        wait(bad).await;

        let first = tokio::time::timeout(WAIT, reports.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(WAIT, reports.recv()).await.unwrap().unwrap();
        assert_eq!(first.invocation_id, ok_id);
        assert!(first.is_success());
        assert_eq!(second.invocation_id, bad_id);
        assert!(second.error().is_some());
        assert_eq!(rt.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_running_and_rejects_new_events() {
        let handler = handler_fn(|ctx: EventContext| async move {
            ctx.cancelled().await;
            anyhow::Ok(())
        });
        let rt = start_with(handler, noop());
        let running = rt.dispatch("work", "default", json!({"message": "x"})).unwrap();
        tokio::time::timeout(WAIT, rt.shutdown()).await.unwrap();
        assert!(wait(running).await.is_cancelled());
        assert_eq!(
            rt.dispatch("work", "default", json!({"message": "y"})).unwrap_err(),
            DispatchError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn dispatch_racing_shutdown_is_aborted_and_untracked() {
        let rt = start_with(noop(), noop());
        let key = InputKey::new("work", "default");
        let queue = rt.inner.queues.get(&key).map(|e| e.value().clone()).unwrap();
        // shutdown flips the flag after dispatch passed its first check
        rt.inner.closed.store(true, Ordering::SeqCst);
        let (job, handle) = Job::new(key, json!({"message": "late"}));
        assert_eq!(rt.enqueue(&queue, job).unwrap_err(), DispatchError::ShuttingDown);
        assert!(handle.abort_handle().is_aborted());
        assert_eq!(rt.in_flight(), 0);
        assert!(wait(handle).await.is_cancelled());
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_handlers_across_inputs() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tracked = |current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>| {
            handler_fn(move |_ctx| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
        };
        let rt = start_with_options(
            tracked(Arc::clone(&current), Arc::clone(&peak)),
            tracked(Arc::clone(&current), Arc::clone(&peak)),
            single_permit(),
        );
        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(
                rt.dispatch("work", "default", json!({ "message": i.to_string() }))
                    .unwrap(),
            );
            handles.push(rt.dispatch("work", "other", json!(i)).unwrap());
        }
        for handle in handles {
            assert!(wait(handle).await.is_success());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn job_cancelled_before_dequeue_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered = Arc::new(StdMutex::new(Some(entered_tx)));
        let handler = {
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            handler_fn(move |_ctx| {
                let calls = Arc::clone(&calls);
                let release = Arc::clone(&release);
                let entered = Arc::clone(&entered);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(tx) = entered.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    release.notified().await;
                    anyhow::Ok(())
                }
            })
        };
        let rt = start_with_options(handler, noop(), single_permit());
        let a = rt.dispatch("work", "default", json!({"message": "a"})).unwrap();
        entered_rx.await.unwrap();
        // the only permit is held by A, so B is still waiting in its worker
        let b = rt.dispatch("work", "default", json!({"message": "b"})).unwrap();
        b.cancel();
        release.notify_one();

        assert!(wait(a).await.is_success());
        assert_eq!(wait(b).await.outcome, InvocationOutcome::Cancelled { discarded: 0 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_outside_tokio_is_an_error() {
        let mut registry = BlockRegistry::new();
        registry.register("work", "default", noop());
        registry.register("work", "other", noop());
        let app = App::new(definition(), registry).unwrap();
        let err = Runtime::start(app, &raw_config(), RuntimeOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::NoAsyncRuntime(_)));
    }

    #[test]
    fn options_fill_missing_fields_with_defaults() {
        let options: RuntimeOptions =
            serde_json::from_value(json!({"maxConcurrentInvocations": 4})).unwrap();
        assert_eq!(options.max_concurrent_invocations, 4);
        assert_eq!(options.report_buffer, RuntimeOptions::default().report_buffer);
    }
}
