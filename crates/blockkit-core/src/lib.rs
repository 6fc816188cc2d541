pub mod app;
pub mod block;
pub mod config;
pub mod emit;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod schema;

// Minimal user-facing API: App, AppDefinition, BlockRegistry, Runtime, Schema.
pub use app::{
    App, AppDefinition, BlockDefinition, ConfigFieldSpec, DefinitionError, FieldType,
    InputDefinition, OutputDefinition,
};
pub use block::{
    BlockRegistry, CancellationSignal, EventContext, InputHandler, InputKey, handler_fn,
};
pub use config::{AppConfig, ConfigError, resolve_config};
pub use emit::{EmitError, EmittedEvent, Emitter};
pub use observability::{ObservabilitySettings, init_observability};
pub use runtime::{
    AbortHandle, DispatchError, InvocationError, InvocationHandle, InvocationOutcome,
    InvocationReport, Runtime, RuntimeError, RuntimeOptions,
};
pub use schema::{Schema, SchemaViolation, ViolationKind};
